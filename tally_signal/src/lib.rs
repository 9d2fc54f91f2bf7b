//! One-shot phase signalling for tally.
//!
//! The tally engine runs a ticker and a handful of flush workers in the
//! background. At shutdown the engine must stop all of them from taking new
//! work and then wait until every in-flight flush has finished before it drains
//! whatever is still dirty.
//!
//! The mechanism here has two components, a `Broadcaster` and a `Watcher`.
//! There is exactly one `Broadcaster` and any number of `Watcher` instances,
//! one per background task. A `Watcher` is released by the signal and the
//! `Broadcaster` learns that the task is done once that `Watcher` is dropped.
//! The signal is a one-time event.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]

use tokio::sync::watch;
use tracing::{debug, info};

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);
    (Watcher { receiver }, Broadcaster { sender })
}

#[derive(Debug)]
/// Releases every `Watcher` created from the same [`signal`] call.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal without waiting for watchers to finish.
    pub fn signal(self) {
        self.sender.send_replace(true);
    }

    /// Send the signal and wait until every `Watcher` has been dropped.
    ///
    /// Watchers that were never polled still count; their owners must drop
    /// them for this call to return.
    pub async fn signal_and_wait(self) {
        self.sender.send_replace(true);
        let peers = self.sender.receiver_count();
        if peers > 0 {
            info!("Waiting for {peers} peers to shut down.");
        }
        self.sender.closed().await;
        debug!("All peers have shut down.");
    }

    /// Number of live `Watcher` instances.
    #[must_use]
    pub fn peers(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone)]
/// Waits for the signal sent by the paired `Broadcaster`.
///
/// Every clone counts as a separate peer.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait for the signal, consuming this `Watcher`.
    ///
    /// Returns immediately if the signal was already sent. A `Broadcaster`
    /// dropped without signalling counts as a signal.
    pub async fn recv(mut self) {
        // An error means the broadcaster is gone, which releases us just the
        // same.
        let _ = self.receiver.wait_for(|signalled| *signalled).await;
    }

    /// Whether the signal has been sent, without waiting.
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }
}
