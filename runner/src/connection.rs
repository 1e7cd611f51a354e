//! Runner connection. Owns the controller thread and the first-request
//! handshake.
//!
//! ```text
//! caller thread                         controller thread
//! -------------                         -----------------
//! RunnerConnection::start ------------> event loop running
//! bootstrap
//!   acquire_channel (caller thread)
//!   post Create ----------------------> ChildController::create (binds)
//!   Blocker::block  . . . . . . . . . . start_app / channel error
//!   <------------------------------------ Unblocker::unblock
//!   run deferred action, return request
//! drop ------------------------------> Shutdown: drop controller, stop loop
//!   join thread
//! ```
//!
//! The controller only ever exists inside the controller thread's event
//! loop. Everything else talks to it by posting [`ControllerTask`]s.

use std::io;
use std::thread;

use childlink_types::{AppResult, ServiceRequest};
use tokio::sync::mpsc;

use crate::channel::{ChannelHandle, StartParams, acquire_channel};
use crate::controller::{ChannelEvent, ChildController};
use crate::rendezvous::{Unblocker, rendezvous};
use crate::shutdown::FatalSender;

/// Default name of the controller thread.
pub const CONTROLLER_THREAD_NAME: &str = "controller_thread";

enum ControllerTask {
    Create {
        channel: ChannelHandle,
        unblocker: Unblocker<ServiceRequest>,
        exit_on_error: bool,
    },
    RecordResult(AppResult),
    Shutdown,
}

/// Settings for a [`RunnerConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    thread_name: String,
    start_params: StartParams,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            thread_name: CONTROLLER_THREAD_NAME.to_string(),
            start_params: StartParams::default(),
        }
    }
}

impl ConnectionOptions {
    /// Defaults, with start parameters taken from this process's arguments.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_start_params(StartParams::from_env())
    }

    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    #[must_use]
    pub fn with_start_params(mut self, params: StartParams) -> Self {
        self.start_params = params;
        self
    }

    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    #[must_use]
    pub fn start_params(&self) -> &StartParams {
        &self.start_params
    }
}

/// The worker's connection to its runner.
///
/// Construction starts the controller thread. Dropping the connection tears
/// the controller down on that thread (which sends the completion reply, if a
/// request was delivered) and then joins it.
pub struct RunnerConnection {
    tasks: mpsc::UnboundedSender<ControllerTask>,
    thread: Option<thread::JoinHandle<()>>,
    start_params: StartParams,
    bootstrapped: bool,
}

impl RunnerConnection {
    /// Start the controller thread. Fatal conditions it detects go to `fatal`.
    pub fn start(options: ConnectionOptions, fatal: FatalSender) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()?;
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name(options.thread_name.clone())
            .spawn(move || {
                runtime.block_on(run_controller_loop(tasks_rx, fatal));
            })?;
        tracing::debug!(thread = %options.thread_name, "Controller thread started");

        Ok(Self {
            tasks: tasks_tx,
            thread: Some(thread),
            start_params: options.start_params,
            bootstrapped: false,
        })
    }

    /// Block until the runner delivers the application request.
    ///
    /// Uses `handle` if given, otherwise looks for a channel in the start
    /// parameters. Returns `None` when no channel could be found (without
    /// blocking) or when the runner closed the channel before sending a
    /// request. There is no timeout: a runner that neither sends nor closes
    /// keeps the caller blocked.
    ///
    /// Only the first call on a connection performs a handshake.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async runtime.
    pub fn bootstrap(
        &mut self,
        handle: Option<ChannelHandle>,
        exit_on_error: bool,
    ) -> Option<ServiceRequest> {
        if self.bootstrapped {
            tracing::warn!("Runner handshake already attempted on this connection");
            return None;
        }
        self.bootstrapped = true;

        let channel = match acquire_channel(handle, &self.start_params) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!("No runner connection available: {e}");
                return None;
            }
        };
        tracing::debug!(?channel, exit_on_error, "Waiting for application request");

        let (unblocker, blocker) = rendezvous();
        let task = ControllerTask::Create {
            channel,
            unblocker,
            exit_on_error,
        };
        if self.tasks.send(task).is_err() {
            tracing::error!("Controller thread is not running");
            return None;
        }

        let request = blocker.block();
        if request.is_none() {
            tracing::info!("Runner closed the connection without an application request");
        }
        request
    }

    /// Record the application's result; it is sent to the runner when the
    /// connection is dropped.
    pub fn report_result(&self, result: AppResult) {
        if self.tasks.send(ControllerTask::RecordResult(result)).is_err() {
            tracing::warn!(%result, "Controller thread gone; result not recorded");
        }
    }
}

impl Drop for RunnerConnection {
    fn drop(&mut self) {
        let _ = self.tasks.send(ControllerTask::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("Controller thread panicked");
        }
    }
}

/// Event loop of the controller thread. The controller is a local of this
/// future and is never reachable from anywhere else.
async fn run_controller_loop(
    mut tasks: mpsc::UnboundedReceiver<ControllerTask>,
    fatal: FatalSender,
) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ChannelEvent>();
    let mut controller: Option<ChildController> = None;

    loop {
        tokio::select! {
            task = tasks.recv() => match task {
                Some(ControllerTask::Create { channel, unblocker, exit_on_error }) => {
                    debug_assert!(controller.is_none(), "controller created twice");
                    match ChildController::create(channel, unblocker, exit_on_error, events_tx.clone()) {
                        Ok(created) => controller = Some(created),
                        Err(e) => tracing::warn!("Failed to bind runner channel: {e}"),
                    }
                }
                Some(ControllerTask::RecordResult(result)) => match controller.as_mut() {
                    Some(controller) => controller.record_result(result),
                    None => tracing::warn!(%result, "No controller to record result on"),
                },
                Some(ControllerTask::Shutdown) | None => break,
            },
            Some(event) = events_rx.recv() => {
                if let Some(controller) = controller.as_mut()
                    && let Err(fatal_error) = controller.handle_event(event)
                {
                    fatal.raise(fatal_error);
                }
            }
        }
    }

    if let Some(controller) = controller.take() {
        controller.shutdown().await;
    }
    tracing::debug!("Controller thread stopped");
}

/// Start a connection and wait for the runner's application request.
///
/// Returns the live connection together with the request, or `None` (after
/// tearing the connection down) when no request is available. Keep the
/// connection alive for as long as the application runs.
pub fn connect_to_runner(
    handle: Option<ChannelHandle>,
    exit_on_error: bool,
    options: ConnectionOptions,
    fatal: FatalSender,
) -> io::Result<Option<(RunnerConnection, ServiceRequest)>> {
    let mut connection = RunnerConnection::start(options, fatal)?;
    Ok(connection
        .bootstrap(handle, exit_on_error)
        .map(|request| (connection, request)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::fatal_channel;

    #[test]
    fn thread_uses_configured_name() {
        let options = ConnectionOptions::default().with_thread_name("custom_controller");
        assert_eq!(options.thread_name(), "custom_controller");
        let (fatal, _coordinator) = fatal_channel();
        let connection = RunnerConnection::start(options, fatal).unwrap();
        let name = connection
            .thread
            .as_ref()
            .and_then(|t| t.thread().name().map(str::to_string));
        assert_eq!(name.as_deref(), Some("custom_controller"));
    }

    #[test]
    fn teardown_without_handshake_is_clean() {
        let (fatal, coordinator) = fatal_channel();
        let connection = RunnerConnection::start(ConnectionOptions::default(), fatal).unwrap();
        drop(connection);
        assert_eq!(coordinator.wait(), None);
    }

    #[test]
    fn no_channel_returns_none_without_blocking() {
        let (fatal, _coordinator) = fatal_channel();
        let mut connection =
            RunnerConnection::start(ConnectionOptions::default(), fatal).unwrap();
        assert!(connection.bootstrap(None, true).is_none());
    }

    #[test]
    fn second_handshake_is_refused() {
        let (fatal, _coordinator) = fatal_channel();
        let mut connection =
            RunnerConnection::start(ConnectionOptions::default(), fatal).unwrap();
        assert!(connection.bootstrap(None, false).is_none());

        let (ours, _theirs) = ChannelHandle::pair();
        assert!(connection.bootstrap(Some(ours), false).is_none());
    }

    #[test]
    fn report_result_without_controller_is_harmless() {
        let (fatal, _coordinator) = fatal_channel();
        let connection = RunnerConnection::start(ConnectionOptions::default(), fatal).unwrap();
        connection.report_result(AppResult::Ok);
    }
}
