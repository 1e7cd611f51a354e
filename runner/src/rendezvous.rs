//! One-shot rendezvous between a blocked thread and the thread that wakes it.
//!
//! [`rendezvous`] returns a [`Blocker`] for the thread that must wait and an
//! [`Unblocker`] for the thread that will eventually wake it. The unblocker
//! may hand over a deferred action; the action runs on the *blocked* thread,
//! after it wakes and before [`Blocker::block`] returns.
//!
//! Both halves are consumed by value, so a rendezvous can be signaled at most
//! once and waited on at most once:
//!
//! ```compile_fail
//! let (unblocker, _blocker) = childlink_runner::rendezvous::<u32>();
//! unblocker.unblock(|| 1);
//! unblocker.unblock(|| 2);
//! ```

use tokio::sync::oneshot;

type Deferred<T> = Box<dyn FnOnce() -> T + Send + 'static>;

/// Create the two halves of a one-shot rendezvous.
#[must_use]
pub fn rendezvous<T>() -> (Unblocker<T>, Blocker<T>) {
    let (tx, rx) = oneshot::channel();
    (Unblocker { tx }, Blocker { rx })
}

/// Capability to wake one [`Blocker`], exactly once.
///
/// Dropping an unused unblocker wakes the blocker with no action, so a
/// waiter is never stranded by a controller that went away.
pub struct Unblocker<T> {
    tx: oneshot::Sender<Option<Deferred<T>>>,
}

impl<T> Unblocker<T> {
    /// Wake the blocked thread and have it run `run_after`.
    pub fn unblock(self, run_after: impl FnOnce() -> T + Send + 'static) {
        self.signal(Some(Box::new(run_after)));
    }

    /// Wake the blocked thread without an action (the failure outcome).
    pub fn unblock_empty(self) {
        self.signal(None);
    }

    fn signal(self, run_after: Option<Deferred<T>>) {
        if self.tx.send(run_after).is_err() {
            tracing::debug!("rendezvous signaled after its blocker was dropped");
        }
    }
}

impl<T> std::fmt::Debug for Unblocker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unblocker")
            .field("waiting", &!self.tx.is_closed())
            .finish()
    }
}

/// The waiting half of a rendezvous.
pub struct Blocker<T> {
    rx: oneshot::Receiver<Option<Deferred<T>>>,
}

impl<T> Blocker<T> {
    /// Park the current thread until the unblocker fires or is dropped.
    ///
    /// Returns the value produced by the deferred action, which runs here on
    /// the calling thread, or `None` if the rendezvous was signaled without
    /// an action.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async runtime; this is a blocking
    /// call for plain threads.
    pub fn block(self) -> Option<T> {
        match self.rx.blocking_recv() {
            Ok(Some(run_after)) => Some(run_after()),
            Ok(None) | Err(_) => None,
        }
    }
}
