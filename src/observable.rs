//! Small observable value abstraction.
//!
//! Coordinator state (`ws_status`, `cache_enabled`, role, online, debug) is
//! exposed as observable values so binding layers can adapt them to
//! framework-native state. Backed by `tokio::sync::watch`: reads are
//! lock-free snapshots, writers notify every subscriber.

use tokio::sync::watch;

/// A shared observable value with a subscribe API.
///
/// Cloning an `Observable` clones the handle, not the value; all clones
/// observe and mutate the same slot.
#[derive(Debug, Clone)]
pub struct Observable<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value, notifying subscribers only when it changed.
    /// Returns whether the value actually changed.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Subscribe to changes. The receiver observes the current value
    /// immediately and every subsequent change.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Wait until the value satisfies `predicate`, without a deadline.
    pub async fn wait_for<F>(&self, mut predicate: F)
    where
        F: FnMut(&T) -> bool,
    {
        let mut rx = self.tx.subscribe();
        loop {
            if predicate(&rx.borrow()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
