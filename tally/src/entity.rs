//! Entity identifiers.

use std::{
    borrow::Borrow,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of the subject whose counters are tracked.
///
/// No normalization is applied, `"Steve"` and `"steve"` are distinct
/// entities. Cloning is a reference count bump.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Arc<str>);

impl EntityId {
    /// Create a new identifier.
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable index in `0..buckets` for spreading entities over shards or
    /// workers.
    ///
    /// # Panics
    ///
    /// Panics if `buckets` is zero.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn bucket(&self, buckets: usize) -> usize {
        assert!(buckets > 0, "bucket count must be non-zero");
        let mut hasher = FxHasher::default();
        self.0.hash(&mut hasher);
        // The remainder is below `buckets` so it always fits back into usize.
        (hasher.finish() % buckets as u64) as usize
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::EntityId;

    #[test]
    fn identifiers_are_case_sensitive() {
        assert_ne!(EntityId::from("Steve"), EntityId::from("steve"));
        assert_eq!(EntityId::from("steve"), EntityId::new(String::from("steve")));
    }

    #[test]
    fn deserializes_from_plain_string() {
        let id: EntityId = serde_json::from_str("\"alice\"").expect("valid json string");
        assert_eq!(id.as_str(), "alice");
        assert_eq!(id.to_string(), "alice");
    }

    proptest! {
        #[test]
        fn bucket_is_stable_and_in_range(id in "[a-zA-Z0-9_]{1,16}", buckets in 1usize..64) {
            let entity = EntityId::from(id.as_str());
            let bucket = entity.bucket(buckets);
            prop_assert!(bucket < buckets);
            prop_assert_eq!(bucket, EntityId::from(id).bucket(buckets));
        }
    }
}
