//! Decides when flushes happen.
//!
//! Three triggers feed the flush [`Coordinator`]:
//!
//! * a periodic ticker that enqueues every dirty entity,
//! * a session-end request for a single entity, and
//! * the shutdown drain, which flushes everything still dirty after the
//!   background tasks have stopped.
//!
//! Flushes run on a fixed number of worker tasks. Each worker owns a bounded
//! queue and an entity always routes to the same worker, so that queue
//! order is flush order for any one entity.
//!
//! ## Metrics
//!
//! `session_end_dropped`: Session-end flushes dropped because the worker
//! queue was full
//!

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use metrics::counter;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinSet,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{EntityId, dirty::DirtySet, flush::Coordinator};

/// Maximum passes the shutdown drain makes over the dirty set.
const DRAIN_PASSES: usize = 3;

/// Scheduling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Time between periodic flushes.
    pub flush_interval: Duration,
    /// Number of background flush workers.
    pub flush_workers: NonZeroUsize,
    /// Bound on each worker's queue.
    pub queue_capacity: NonZeroUsize,
    /// Log increments the counter store rejected.
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(120),
            flush_workers: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            queue_capacity: NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN),
            debug: false,
        }
    }
}

/// What the shutdown drain achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Entities whose deltas were merged during the drain.
    pub flushed: usize,
    /// Flush attempts that failed during the drain.
    pub failed: usize,
    /// Entities still dirty when the drain gave up.
    pub remaining: usize,
}

/// Routes entities to their worker's queue.
#[derive(Debug)]
pub(crate) struct Router {
    queues: Box<[mpsc::Sender<EntityId>]>,
}

impl Router {
    fn queue(&self, entity: &EntityId) -> &mpsc::Sender<EntityId> {
        &self.queues[entity.bucket(self.queues.len())]
    }

    /// Enqueue `entity`, waiting for queue space.
    async fn enqueue(&self, entity: EntityId) -> Result<(), mpsc::error::SendError<EntityId>> {
        let queue = self.queue(&entity);
        queue.send(entity).await
    }

    /// Enqueue `entity` if its worker's queue has room.
    pub(crate) fn try_enqueue(&self, entity: EntityId) -> Result<(), TrySendError<EntityId>> {
        let queue = self.queue(&entity);
        queue.try_send(entity)
    }
}

struct Worker {
    id: usize,
    coordinator: Arc<Coordinator>,
    queue: mpsc::Receiver<EntityId>,
    shutdown: tally_signal::Watcher,
}

impl Worker {
    async fn spin(mut self) {
        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                () = &mut shutdown_wait => {
                    debug!("Flush worker {} received shutdown signal.", self.id);
                    return;
                }
                entity = self.queue.recv() => {
                    let Some(entity) = entity else {
                        return;
                    };
                    self.coordinator.flush_entity(&entity).await;
                }
            }
        }
    }
}

struct Ticker {
    period: Duration,
    dirty: Arc<DirtySet>,
    router: Arc<Router>,
    shutdown: tally_signal::Watcher,
}

impl Ticker {
    async fn spin(self) {
        let mut interval = time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                () = &mut shutdown_wait => {
                    debug!("Periodic flush ticker received shutdown signal.");
                    return;
                }
                _ = interval.tick() => {
                    if self.dirty.is_empty() {
                        debug!("No dirty entities, skipping periodic flush.");
                        continue;
                    }
                    let entities = self.dirty.snapshot();
                    info!("Starting periodic flush of {} dirty entities.", entities.len());
                    for entity in entities {
                        if self.router.enqueue(entity).await.is_err() {
                            // Workers are gone, shutdown is underway.
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Owner of the background flush tasks.
#[derive(Debug)]
pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    dirty: Arc<DirtySet>,
    router: Arc<Router>,
    tasks: JoinSet<()>,
    shutdown: tally_signal::Broadcaster,
    workers: NonZeroUsize,
}

impl Scheduler {
    /// Spawn the ticker and flush workers onto the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    #[must_use]
    pub fn start(coordinator: Arc<Coordinator>, dirty: Arc<DirtySet>, settings: Settings) -> Self {
        let (watcher, broadcaster) = tally_signal::signal();
        let mut tasks = JoinSet::new();

        let mut queues = Vec::with_capacity(settings.flush_workers.get());
        for id in 0..settings.flush_workers.get() {
            let (sender, receiver) = mpsc::channel(settings.queue_capacity.get());
            queues.push(sender);
            let worker = Worker {
                id,
                coordinator: Arc::clone(&coordinator),
                queue: receiver,
                shutdown: watcher.clone(),
            };
            tasks.spawn(worker.spin());
        }
        let router = Arc::new(Router {
            queues: queues.into_boxed_slice(),
        });

        let ticker = Ticker {
            period: settings.flush_interval,
            dirty: Arc::clone(&dirty),
            router: Arc::clone(&router),
            shutdown: watcher,
        };
        tasks.spawn(ticker.spin());

        Self {
            coordinator,
            dirty,
            router,
            tasks,
            shutdown: broadcaster,
            workers: settings.flush_workers,
        }
    }

    pub(crate) fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Stop the background tasks, wait for in-flight flushes and drain what
    /// is still dirty.
    ///
    /// The drain makes up to three passes and stops early when a pass makes
    /// no progress. Entities still dirty afterward are reported, not retried.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("Shutdown requested, waiting for in-flight flushes.");
        self.shutdown.signal_and_wait().await;
        while let Some(res) = self.tasks.join_next().await {
            if let Err(err) = res {
                error!("Flush task failed: {err}");
            }
        }

        let mut report = ShutdownReport::default();
        for pass in 1..=DRAIN_PASSES {
            let entities = self.dirty.snapshot();
            if entities.is_empty() {
                break;
            }
            info!("Shutdown drain pass {pass}: flushing {} dirty entities.", entities.len());
            let summary = self.coordinator.flush_all(entities, self.workers).await;
            report.flushed += summary.flushed;
            report.failed += summary.failed;
            if summary.flushed == 0 && summary.clean == 0 {
                break;
            }
        }
        report.remaining = self.dirty.len();
        if report.remaining > 0 {
            warn!(
                "Shutdown drain finished with {} entities still dirty; their pending counts remain in the counter store.",
                report.remaining
            );
        } else {
            info!("Shutdown drain flushed {} entities.", report.flushed);
        }
        report
    }
}

/// Queue a flush of `entity` without waiting, counting a full queue as a drop.
pub(crate) fn request_flush(router: &Router, entity: &EntityId) {
    match router.try_enqueue(entity.clone()) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            debug!("Flush queue full, {entity} will be picked up by the periodic flush.");
            counter!("session_end_dropped").increment(1);
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Flush workers stopped, {entity} will be picked up by the shutdown drain.");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroU64,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        Metric,
        counter::{CounterStore, memory::Memory as MemoryCounters},
        durable::{self, DurableStore, memory::Memory as MemoryDurable},
        metric::Deltas,
    };

    /// Durable store that only accepts the merge attempts listed in `accept`,
    /// counted from one.
    #[derive(Debug, Default)]
    struct Selective {
        inner: MemoryDurable,
        accept: Vec<usize>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl DurableStore for Selective {
        async fn ensure_schema(&self) -> Result<(), durable::Error> {
            Ok(())
        }

        async fn merge_add(
            &self,
            entity: &EntityId,
            deltas: &Deltas,
        ) -> Result<(), durable::Error> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.accept.contains(&attempt) {
                return Err(durable::Error::Unavailable("connection refused".to_string()));
            }
            self.inner.merge_add(entity, deltas).await
        }
    }

    /// Start a single-worker scheduler over `durable`, with every entity
    /// of `entities` holding one pending count per index.
    async fn stuck(
        durable: Arc<Selective>,
        entities: &[EntityId],
    ) -> (Arc<MemoryCounters>, Arc<DirtySet>, Scheduler) {
        let counters = Arc::new(MemoryCounters::new(NonZeroUsize::new(4).expect("non-zero")));
        let dirty = Arc::new(DirtySet::new());
        let coordinator = Arc::new(Coordinator::new(counters.clone(), durable, dirty.clone()));
        let scheduler = Scheduler::start(
            coordinator,
            Arc::clone(&dirty),
            Settings {
                flush_interval: Duration::from_secs(3600),
                flush_workers: NonZeroUsize::MIN,
                ..Settings::default()
            },
        );
        for (idx, entity) in entities.iter().enumerate() {
            let amount = NonZeroU64::new(idx as u64 + 1).expect("non-zero");
            counters
                .increment(entity, Metric::MobsKilled, amount)
                .await
                .expect("increment");
            dirty.mark(entity);
        }
        (counters, dirty, scheduler)
    }

    struct Fixture {
        counters: Arc<MemoryCounters>,
        durable: Arc<MemoryDurable>,
        dirty: Arc<DirtySet>,
        scheduler: Scheduler,
    }

    fn fixture(settings: Settings) -> Fixture {
        let counters = Arc::new(MemoryCounters::new(NonZeroUsize::new(4).expect("non-zero")));
        let durable = Arc::new(MemoryDurable::new());
        let dirty = Arc::new(DirtySet::new());
        let coordinator = Arc::new(Coordinator::new(
            counters.clone(),
            durable.clone(),
            dirty.clone(),
        ));
        let scheduler = Scheduler::start(coordinator, Arc::clone(&dirty), settings);
        Fixture {
            counters,
            durable,
            dirty,
            scheduler,
        }
    }

    async fn bump(fixture: &Fixture, entity: &EntityId, amount: u64) {
        fixture
            .counters
            .increment(entity, Metric::BlocksBroken, NonZeroU64::new(amount).expect("non-zero"))
            .await
            .expect("increment");
        fixture.dirty.mark(entity);
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn periodic_tick_flushes_dirty_entities() {
        let fixture = fixture(Settings {
            flush_interval: Duration::from_millis(50),
            ..Settings::default()
        });
        let alice = EntityId::from("alice");
        bump(&fixture, &alice, 4).await;

        eventually(|| fixture.durable.record(&alice).is_some()).await;
        eventually(|| fixture.dirty.is_empty()).await;
        let record = fixture.durable.record(&alice).expect("record");
        assert_eq!(record.totals.get(Metric::BlocksBroken), 4);

        let report = fixture.scheduler.shutdown().await;
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_end_flushes_one_entity() {
        let fixture = fixture(Settings {
            flush_interval: Duration::from_secs(3600),
            ..Settings::default()
        });
        let bob = EntityId::from("bob");
        let carol = EntityId::from("carol");
        bump(&fixture, &bob, 2).await;
        bump(&fixture, &carol, 1).await;

        request_flush(&fixture.scheduler.router(), &bob);
        eventually(|| fixture.durable.record(&bob).is_some()).await;
        assert_eq!(fixture.durable.record(&carol), None);
        assert!(fixture.dirty.contains(&carol));

        let report = fixture.scheduler.shutdown().await;
        assert_eq!(report.flushed, 1);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_drains_everything() {
        let fixture = fixture(Settings {
            flush_interval: Duration::from_secs(3600),
            flush_workers: NonZeroUsize::new(2).expect("non-zero"),
            ..Settings::default()
        });
        let entities: Vec<EntityId> = (0..50).map(|idx| EntityId::from(format!("p{idx}"))).collect();
        for (idx, entity) in entities.iter().enumerate() {
            bump(&fixture, entity, idx as u64 + 1).await;
        }

        let Fixture {
            counters,
            durable,
            dirty,
            scheduler,
        } = fixture;
        let report = scheduler.shutdown().await;
        assert_eq!(
            report,
            ShutdownReport {
                flushed: 50,
                failed: 0,
                remaining: 0
            }
        );
        assert!(dirty.is_empty());
        assert!(counters.is_empty());
        for (idx, entity) in entities.iter().enumerate() {
            let record = durable.record(entity).expect("record");
            assert_eq!(record.totals.get(Metric::BlocksBroken), idx as u64 + 1);
        }
    }

    #[tokio::test]
    async fn full_queue_drops_session_end() {
        let (sender, _receiver) = mpsc::channel(1);
        let router = Router {
            queues: vec![sender].into_boxed_slice(),
        };
        let alice = EntityId::from("alice");
        request_flush(&router, &alice);
        request_flush(&router, &alice);
        assert!(matches!(
            router.try_enqueue(alice),
            Err(TrySendError::Full(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_stops_when_the_durable_store_refuses_everything() {
        let durable = Arc::new(Selective::default());
        let entities: Vec<EntityId> = (0..4).map(|idx| EntityId::from(format!("s{idx}"))).collect();
        let (counters, dirty, scheduler) = stuck(Arc::clone(&durable), &entities).await;

        let report = scheduler.shutdown().await;
        assert_eq!(
            report,
            ShutdownReport {
                flushed: 0,
                failed: 4,
                remaining: 4
            }
        );
        // One pass only: it made no progress.
        assert_eq!(durable.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(dirty.len(), 4);
        for (idx, entity) in entities.iter().enumerate() {
            assert_eq!(counters.pending(entity).get(Metric::MobsKilled), idx as u64 + 1);
            assert!(durable.inner.record(entity).is_none());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drain_gives_up_after_three_passes() {
        // With one worker the drain is sequential: passes make attempts
        // 1..=5, 6..=9 and 10..=12, and the first attempt of each succeeds.
        let durable = Arc::new(Selective {
            accept: vec![1, 6, 10],
            ..Selective::default()
        });
        let entities: Vec<EntityId> = (0..5).map(|idx| EntityId::from(format!("t{idx}"))).collect();
        let (counters, dirty, scheduler) = stuck(Arc::clone(&durable), &entities).await;

        let report = scheduler.shutdown().await;
        assert_eq!(
            report,
            ShutdownReport {
                flushed: 3,
                failed: 4 + 3 + 2,
                remaining: 2
            }
        );
        assert_eq!(durable.attempts.load(Ordering::SeqCst), 12);
        assert_eq!(dirty.len(), 2);

        let mut merged = 0;
        let mut pending = 0;
        for entity in &entities {
            let stored = durable
                .inner
                .record(entity)
                .map_or(0, |record| record.totals.get(Metric::MobsKilled));
            let left = counters.pending(entity).get(Metric::MobsKilled);
            assert!(stored == 0 || left == 0, "{entity} is both merged and pending");
            assert_eq!(left > 0, dirty.contains(entity));
            merged += stored;
            pending += left;
        }
        assert_eq!(merged + pending, 1 + 2 + 3 + 4 + 5);
    }
}
