//! Metric names and per-entity delta sets.
//!
//! The set of metrics is closed. Each [`Metric`] has a stable snake_case name
//! that doubles as the field name in the counter store and the column name in
//! the durable store.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// A counted quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Blocks broken by the entity.
    BlocksBroken,
    /// Blocks placed by the entity.
    BlocksPlaced,
    /// Mobs killed by the entity.
    MobsKilled,
}

impl Metric {
    /// Every metric, in storage order.
    pub const ALL: [Metric; 3] = [Metric::BlocksBroken, Metric::BlocksPlaced, Metric::MobsKilled];

    /// Number of metrics.
    pub const COUNT: usize = Self::ALL.len();

    /// Stable storage name of the metric.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Metric::BlocksBroken => "blocks_broken",
            Metric::BlocksPlaced => "blocks_placed",
            Metric::MobsKilled => "mobs_killed",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing a name that is not a known [`Metric`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown metric: {0}")]
pub struct UnknownMetric(pub String);

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// Non-negative amount per metric for a single entity.
///
/// Additions saturate rather than wrap. A metric absent from a delta set is
/// zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Deltas([u64; Metric::COUNT]);

impl Deltas {
    /// All-zero deltas.
    #[must_use]
    pub const fn new() -> Self {
        Self([0; Metric::COUNT])
    }

    /// Amount recorded for `metric`.
    #[must_use]
    pub fn get(&self, metric: Metric) -> u64 {
        self.0[metric.index()]
    }

    /// Add `amount` to `metric`.
    pub fn add(&mut self, metric: Metric, amount: u64) {
        let slot = &mut self.0[metric.index()];
        *slot = slot.saturating_add(amount);
    }

    /// Add every amount of `other` into `self`.
    pub fn merge(&mut self, other: &Deltas) {
        for metric in Metric::ALL {
            self.add(metric, other.get(metric));
        }
    }

    /// Subtract every amount of `other` from `self`, stopping at zero.
    pub fn saturating_sub(&mut self, other: &Deltas) {
        for metric in Metric::ALL {
            let slot = &mut self.0[metric.index()];
            *slot = slot.saturating_sub(other.get(metric));
        }
    }

    /// True when every metric is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|amount| *amount == 0)
    }

    /// Sum across all metrics.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, amount| acc.saturating_add(*amount))
    }

    /// Non-zero amounts, in storage order.
    pub fn nonzero(&self) -> impl Iterator<Item = (Metric, u64)> + '_ {
        Metric::ALL
            .into_iter()
            .map(|metric| (metric, self.get(metric)))
            .filter(|(_, amount)| *amount > 0)
    }
}

impl FromIterator<(Metric, u64)> for Deltas {
    fn from_iter<I: IntoIterator<Item = (Metric, u64)>>(iter: I) -> Self {
        let mut deltas = Deltas::new();
        for (metric, amount) in iter {
            deltas.add(metric, amount);
        }
        deltas
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn names_round_trip() {
        for metric in Metric::ALL {
            assert_eq!(metric.as_str().parse::<Metric>(), Ok(metric));
        }
        assert_eq!(
            "blocks_mined".parse::<Metric>(),
            Err(UnknownMetric("blocks_mined".to_string()))
        );
    }

    #[test]
    fn serde_names_match_storage_names() {
        for metric in Metric::ALL {
            let json = serde_json::to_string(&metric).expect("serializable");
            assert_eq!(json, format!("\"{}\"", metric.as_str()));
        }
    }

    #[test]
    fn iter_skips_zero_amounts() {
        let deltas: Deltas = [(Metric::BlocksBroken, 5), (Metric::MobsKilled, 2)]
            .into_iter()
            .collect();
        let seen: Vec<_> = deltas.nonzero().collect();
        assert_eq!(seen, vec![(Metric::BlocksBroken, 5), (Metric::MobsKilled, 2)]);
        assert_eq!(deltas.total(), 7);
        assert!(!deltas.is_zero());
        assert!(Deltas::new().is_zero());
    }

    #[test]
    fn add_saturates() {
        let mut deltas = Deltas::new();
        deltas.add(Metric::BlocksPlaced, u64::MAX);
        deltas.add(Metric::BlocksPlaced, 1);
        assert_eq!(deltas.get(Metric::BlocksPlaced), u64::MAX);
    }

    proptest! {
        #[test]
        fn merge_then_sub_restores(a in any::<[u32; 3]>(), b in any::<[u32; 3]>()) {
            let left: Deltas = Metric::ALL.into_iter().zip(a.map(u64::from)).collect();
            let right: Deltas = Metric::ALL.into_iter().zip(b.map(u64::from)).collect();
            let mut sum = left;
            sum.merge(&right);
            prop_assert_eq!(sum.total(), left.total() + right.total());
            sum.saturating_sub(&right);
            prop_assert_eq!(sum, left);
        }
    }
}
