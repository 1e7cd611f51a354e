//! Single point where fatal controller conditions turn into process exit.
//!
//! The controller never exits the process. It raises a [`FatalError`]
//! through a [`FatalSender`]; whoever owns the [`ShutdownCoordinator`]
//! decides what happens next. Worker binaries typically hand the coordinator
//! to [`ShutdownCoordinator::spawn_exit_watcher`] so an `exit_now` arriving
//! while the main thread is still blocked in the handshake takes effect.

use std::thread;

use childlink_types::FatalError;
use tokio::sync::mpsc;

/// Create a connected sender/coordinator pair.
#[must_use]
pub fn fatal_channel() -> (FatalSender, ShutdownCoordinator) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FatalSender { tx }, ShutdownCoordinator { rx })
}

/// Raises fatal conditions to the coordinator.
#[derive(Debug, Clone)]
pub struct FatalSender {
    tx: mpsc::UnboundedSender<FatalError>,
}

impl FatalSender {
    pub fn raise(&self, fatal: FatalError) {
        tracing::debug!(%fatal, "Raising fatal condition");
        if self.tx.send(fatal).is_err() {
            tracing::warn!(%fatal, "No shutdown coordinator is listening");
        }
    }
}

/// Receives fatal conditions. The first one decides the exit status.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    rx: mpsc::UnboundedReceiver<FatalError>,
}

impl ShutdownCoordinator {
    /// Block until a fatal condition arrives, or until every sender is gone
    /// (a clean shutdown, returned as `None`).
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async runtime.
    pub fn wait(mut self) -> Option<FatalError> {
        self.rx.blocking_recv()
    }

    /// Watch for a fatal condition on a dedicated thread and call `exit` with
    /// its status. The thread ends quietly on clean shutdown; joining it
    /// yields whichever condition (if any) was acted on.
    pub fn spawn_exit_watcher<F>(self, exit: F) -> std::io::Result<thread::JoinHandle<Option<FatalError>>>
    where
        F: FnOnce(i32) + Send + 'static,
    {
        thread::Builder::new()
            .name("shutdown_watcher".to_string())
            .spawn(move || {
                let fatal = self.wait()?;
                tracing::error!(%fatal, code = fatal.exit_code(), "Terminating worker");
                exit(fatal.exit_code());
                Some(fatal)
            })
    }
}
