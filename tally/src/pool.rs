//! Bounded pool of blocking connections.
//!
//! Both SQLite-backed stores talk to the database through a [`Pool`]. At most
//! `max_connections` units of work run at once. Callers that cannot get a slot
//! within the configured wait time receive [`Error::Timeout`] rather than
//! queueing forever. Connections are opened lazily and the work itself runs
//! on tokio's blocking thread pool.

use std::{fmt, num::NonZeroU32, path::PathBuf, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::Semaphore;

/// Errors produced by [`Pool`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No connection became available in time.
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    Timeout(Duration),
    /// The pool has been closed.
    #[error("Connection pool is closed")]
    Closed,
    /// The blocking task running the work failed.
    #[error("Pooled work failed to complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Opens connections on behalf of a [`Pool`].
pub trait Manage: Send + Sync + 'static {
    /// The connection type handed to pooled work.
    type Connection: Send + 'static;
    /// Error produced when a connection cannot be opened.
    type Error: Send + 'static;

    /// Open a fresh connection. Called from a blocking thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    fn open(&self) -> Result<Self::Connection, Self::Error>;
}

struct Shared<M: Manage> {
    manager: M,
    idle: Mutex<Vec<M::Connection>>,
    permits: Semaphore,
    wait_timeout: Duration,
}

/// A bounded, lazily filled pool of connections.
pub struct Pool<M: Manage> {
    shared: Arc<Shared<M>>,
}

impl<M: Manage> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("available", &self.shared.permits.available_permits())
            .field("idle", &self.shared.idle.lock().len())
            .field("wait_timeout", &self.shared.wait_timeout)
            .finish_non_exhaustive()
    }
}

impl<M: Manage> Pool<M> {
    /// Create a new pool. No connection is opened until work arrives.
    #[must_use]
    pub fn new(manager: M, max_connections: NonZeroU32, wait_timeout: Duration) -> Self {
        let permits = usize::try_from(max_connections.get()).unwrap_or(Semaphore::MAX_PERMITS);
        Self {
            shared: Arc::new(Shared {
                manager,
                idle: Mutex::new(Vec::new()),
                permits: Semaphore::new(permits.min(Semaphore::MAX_PERMITS)),
                wait_timeout,
            }),
        }
    }

    /// Run `work` against a pooled connection on a blocking thread.
    ///
    /// The connection is returned to the pool afterward, whatever `work`
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when no slot frees up within the wait time,
    /// [`Error::Closed`] after [`Pool::close`], a connection error from the
    /// manager, or whatever `work` returns.
    pub async fn run<F, R, E>(&self, work: F) -> Result<R, E>
    where
        F: FnOnce(&mut M::Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<Error> + From<M::Error> + Send + 'static,
    {
        let wait_timeout = self.shared.wait_timeout;
        let permit = match tokio::time::timeout(wait_timeout, self.shared.permits.acquire()).await {
            Err(_elapsed) => return Err(Error::Timeout(wait_timeout).into()),
            Ok(Err(_closed)) => return Err(Error::Closed.into()),
            Ok(Ok(permit)) => permit,
        };
        // The slot is accounted for by hand so it can travel to the blocking
        // thread with the work.
        permit.forget();

        let shared = Arc::clone(&self.shared);
        let handle = tokio::task::spawn_blocking(move || {
            let _slot = Slot(&shared);
            let idle = shared.idle.lock().pop();
            let mut conn = match idle {
                Some(conn) => conn,
                None => shared.manager.open()?,
            };
            let result = work(&mut conn);
            if !shared.permits.is_closed() {
                shared.idle.lock().push(conn);
            }
            result
        });
        handle.await.map_err(|err| E::from(Error::Join(err)))?
    }

    /// Refuse new work and drop idle connections. Work already running
    /// finishes and its connection is dropped instead of returned.
    pub fn close(&self) {
        self.shared.permits.close();
        self.shared.idle.lock().clear();
    }

    /// Number of idle connections currently held.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.shared.idle.lock().len()
    }
}

/// Hands a forgotten permit back when pooled work ends, even by panic.
struct Slot<'a, M: Manage>(&'a Shared<M>);

impl<M: Manage> Drop for Slot<'_, M> {
    fn drop(&mut self) {
        self.0.permits.add_permits(1);
    }
}

/// Opens SQLite connections for the stores in this crate.
#[derive(Debug, Clone)]
pub(crate) struct SqliteManager {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteManager {
    pub(crate) fn new(path: PathBuf, busy_timeout: Duration) -> Self {
        Self { path, busy_timeout }
    }
}

impl Manage for SqliteManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn open(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct Counting {
        opened: AtomicUsize,
    }

    #[derive(Debug)]
    struct Refused;

    impl Manage for Arc<Counting> {
        type Connection = usize;
        type Error = Refused;

        fn open(&self) -> Result<usize, Refused> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[derive(Debug, Default)]
    struct Broken;

    impl Manage for Broken {
        type Connection = usize;
        type Error = Refused;

        fn open(&self) -> Result<usize, Refused> {
            Err(Refused)
        }
    }

    #[derive(thiserror::Error, Debug)]
    enum TestError {
        #[error("pool: {0}")]
        Pool(#[from] Error),
        #[error("refused")]
        Refused,
    }

    impl From<Refused> for TestError {
        fn from(_: Refused) -> Self {
            TestError::Refused
        }
    }

    fn one(max: u32) -> NonZeroU32 {
        NonZeroU32::new(max).expect("non-zero")
    }

    #[tokio::test]
    async fn connections_are_opened_lazily_and_reused() {
        let manager = Arc::new(Counting::default());
        let pool = Pool::new(Arc::clone(&manager), one(4), Duration::from_secs(1));
        assert_eq!(manager.opened.load(Ordering::SeqCst), 0);

        for _ in 0..3 {
            let conn = pool
                .run(|conn: &mut usize| Ok::<_, TestError>(*conn))
                .await
                .expect("work runs");
            assert_eq!(conn, 0);
        }
        assert_eq!(manager.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_pool_times_out() {
        let pool = Arc::new(Pool::new(
            Arc::new(Counting::default()),
            one(1),
            Duration::from_millis(50),
        ));

        let busy = Arc::clone(&pool);
        let holder = tokio::spawn(async move {
            busy.run(|_conn: &mut usize| {
                std::thread::sleep(Duration::from_millis(500));
                Ok::<_, TestError>(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = pool.run(|_conn: &mut usize| Ok::<_, TestError>(())).await;
        assert!(matches!(result, Err(TestError::Pool(Error::Timeout(_)))));

        holder.await.expect("holder task").expect("holder work");
        pool.run(|_conn: &mut usize| Ok::<_, TestError>(()))
            .await
            .expect("slot is free again");
    }

    #[tokio::test]
    async fn open_failure_releases_the_slot() {
        let pool = Pool::new(Broken, one(1), Duration::from_millis(50));
        for _ in 0..2 {
            let result = pool.run(|_conn: &mut usize| Ok::<_, TestError>(())).await;
            assert!(matches!(result, Err(TestError::Refused)));
        }
    }

    #[tokio::test]
    async fn closed_pool_refuses_work() {
        let pool = Pool::new(Arc::new(Counting::default()), one(2), Duration::from_secs(1));
        pool.run(|_conn: &mut usize| Ok::<_, TestError>(()))
            .await
            .expect("work runs");
        pool.close();
        assert_eq!(pool.idle(), 0);
        let result = pool.run(|_conn: &mut usize| Ok::<_, TestError>(())).await;
        assert!(matches!(result, Err(TestError::Pool(Error::Closed))));
    }
}
