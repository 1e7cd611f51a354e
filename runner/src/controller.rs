//! The controller endpoint bound to the runner channel.
//!
//! A [`ChildController`] lives on the controller thread only. It is created
//! and dropped by tasks running there, and nothing hands out references to
//! it, so every method runs on that one thread.
//!
//! Handshake phases:
//!
//! ```text
//! AwaitingStart --start_app--> Started --channel error--> Disconnected
//!       |                                 (fatal if exit_on_error)
//!       +--channel error--> Disconnected (caller woken with no request)
//! ```

use childlink_types::{AppResult, FatalError, ServiceRequest};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::ChannelHandle;
use crate::codec::{FrameError, FrameReader, FrameWriter};
use crate::protocol::{self, Incoming, ProtocolError, RequestId};
use crate::rendezvous::Unblocker;

/// What the reader task observed on the channel.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Frame(serde_json::Value),
    Closed,
    Failed(FrameError),
}

type Reply = Box<dyn FnOnce(Result<AppResult, ProtocolError>) + Send>;

/// The runner's completion callback for one `start_app` request.
///
/// Runs exactly once: explicitly through [`AppCompletion::complete`] or
/// [`AppCompletion::reject`], or with [`AppResult::Unimplemented`] when
/// dropped unused.
pub(crate) struct AppCompletion {
    reply: Option<Reply>,
}

impl AppCompletion {
    pub(crate) fn new(reply: impl FnOnce(Result<AppResult, ProtocolError>) + Send + 'static) -> Self {
        Self {
            reply: Some(Box::new(reply)),
        }
    }

    /// Completion that answers request `id` over the outbound frame queue.
    fn for_request(id: RequestId, outbound: mpsc::UnboundedSender<serde_json::Value>) -> Self {
        Self::new(move |outcome| {
            let frame = match outcome {
                Ok(result) => protocol::completion_response(id, result),
                Err(error) => protocol::error_response(id, &error),
            };
            if outbound.send(frame).is_err() {
                tracing::debug!("Runner channel writer gone; completion not delivered");
            }
        })
    }

    pub(crate) fn complete(mut self, result: AppResult) {
        if let Some(reply) = self.reply.take() {
            reply(Ok(result));
        }
    }

    pub(crate) fn reject(mut self, error: ProtocolError) {
        if let Some(reply) = self.reply.take() {
            reply(Err(error));
        }
    }
}

impl Drop for AppCompletion {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            reply(Ok(AppResult::Unimplemented));
        }
    }
}

enum Phase {
    AwaitingStart { unblocker: Unblocker<ServiceRequest> },
    Started,
    Disconnected,
}

struct Binding {
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

pub(crate) struct ChildController {
    phase: Phase,
    /// Set once `start_app` is handled.
    completion: Option<AppCompletion>,
    /// Result the application reported, if any.
    recorded: Option<AppResult>,
    exit_on_error: bool,
    outbound: mpsc::UnboundedSender<serde_json::Value>,
    binding: Option<Binding>,
}

impl ChildController {
    /// An unbound controller. Frames it wants to send go to `outbound`.
    pub(crate) fn new(
        unblocker: Unblocker<ServiceRequest>,
        exit_on_error: bool,
        outbound: mpsc::UnboundedSender<serde_json::Value>,
    ) -> Self {
        Self {
            phase: Phase::AwaitingStart { unblocker },
            completion: None,
            recorded: None,
            exit_on_error,
            outbound,
            binding: None,
        }
    }

    /// Construct a controller and bind it to `channel`.
    ///
    /// Must run inside the controller thread's runtime. If the channel cannot
    /// be registered the unblocker is dropped with it, which wakes the caller
    /// with no request.
    pub(crate) fn create(
        channel: ChannelHandle,
        unblocker: Unblocker<ServiceRequest>,
        exit_on_error: bool,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> std::io::Result<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mut controller = Self::new(unblocker, exit_on_error, outbound_tx);
        controller.bind(channel, outbound_rx, events)?;
        Ok(controller)
    }

    /// Start receiving from `channel`; channel errors surface as
    /// [`ChannelEvent::Closed`] or [`ChannelEvent::Failed`] on `events`.
    fn bind(
        &mut self,
        channel: ChannelHandle,
        mut outbound: mpsc::UnboundedReceiver<serde_json::Value>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> std::io::Result<()> {
        debug_assert!(self.binding.is_none(), "controller bound twice");
        let stream = channel.into_stream()?;
        let (read_half, write_half) = tokio::io::split(stream);

        let writer = tokio::spawn(async move {
            let mut writer = FrameWriter::new(write_half);
            while let Some(frame) = outbound.recv().await {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::warn!("Runner channel write error: {e}");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut reader = FrameReader::new(read_half);
            loop {
                let event = match reader.read_frame().await {
                    Ok(Some(frame)) => ChannelEvent::Frame(frame),
                    Ok(None) => ChannelEvent::Closed,
                    Err(e) => ChannelEvent::Failed(e),
                };
                let last = !matches!(event, ChannelEvent::Frame(_));
                if events.send(event).is_err() || last {
                    break;
                }
            }
        });

        self.binding = Some(Binding {
            reader,
            writer: Some(writer),
        });
        Ok(())
    }

    pub(crate) fn handle_event(&mut self, event: ChannelEvent) -> Result<(), FatalError> {
        match event {
            ChannelEvent::Frame(frame) => self.handle_frame(&frame),
            ChannelEvent::Closed => {
                tracing::info!("Runner closed the channel");
                self.on_connection_error()
            }
            ChannelEvent::Failed(error) if error.is_truncation() => {
                tracing::info!(%error, "Runner closed the channel mid-frame");
                self.on_connection_error()
            }
            ChannelEvent::Failed(error) => {
                tracing::warn!(%error, "Runner channel failed");
                self.on_connection_error()
            }
        }
    }

    fn handle_frame(&mut self, frame: &serde_json::Value) -> Result<(), FatalError> {
        let Some(incoming) = protocol::parse_incoming(frame) else {
            tracing::trace!("Ignoring non-message frame from runner");
            return Ok(());
        };

        match incoming {
            Incoming::StartApp { id, request } => {
                let completion = AppCompletion::for_request(id, self.outbound.clone());
                if let Err(error) = self.start_app(request, completion) {
                    tracing::warn!("Rejected start_app: {error}");
                }
                Ok(())
            }
            Incoming::ExitNow { exit_code } => Err(self.exit_now(exit_code)),
            Incoming::Rejected { id, error } => {
                tracing::debug!("Rejecting runner request: {error}");
                self.send(protocol::error_response(id, &error));
                Ok(())
            }
            Incoming::Ignored { reason } => {
                tracing::trace!("Ignoring runner frame: {reason}");
                Ok(())
            }
        }
    }

    /// Handle the runner's `start_app`: keep the completion callback and wake
    /// the caller with `request`.
    pub(crate) fn start_app(
        &mut self,
        request: ServiceRequest,
        completion: AppCompletion,
    ) -> Result<(), ProtocolError> {
        match std::mem::replace(&mut self.phase, Phase::Started) {
            Phase::AwaitingStart { unblocker } => {
                tracing::info!(url = %request.url(), "Received application request");
                self.completion = Some(completion);
                unblocker.unblock(move || request);
                Ok(())
            }
            previous => {
                self.phase = previous;
                completion.reject(ProtocolError::AlreadyStarted);
                Err(ProtocolError::AlreadyStarted)
            }
        }
    }

    /// The runner asked the worker to exit immediately.
    pub(crate) fn exit_now(&mut self, exit_code: i32) -> FatalError {
        tracing::debug!(exit_code, "Runner requested immediate exit");
        FatalError::ExitRequested { code: exit_code }
    }

    /// The channel is gone. Before `start_app` this releases the caller with
    /// no request; after it, it is fatal only with `exit_on_error`.
    pub(crate) fn on_connection_error(&mut self) -> Result<(), FatalError> {
        match std::mem::replace(&mut self.phase, Phase::Disconnected) {
            Phase::AwaitingStart { unblocker } => {
                tracing::warn!("Connection to the runner lost before an application request");
                unblocker.unblock_empty();
                Ok(())
            }
            Phase::Started if self.exit_on_error => {
                tracing::error!("Connection to the runner lost");
                Err(FatalError::ConnectionLost)
            }
            Phase::Started => {
                tracing::debug!("Connection to the runner lost after start; ignoring");
                Ok(())
            }
            Phase::Disconnected => Ok(()),
        }
    }

    /// Remember the application's result for the completion reply. The first
    /// recorded result wins.
    pub(crate) fn record_result(&mut self, result: AppResult) {
        match self.recorded {
            None => self.recorded = Some(result),
            Some(existing) => {
                tracing::debug!(%existing, ignored = %result, "Application result already recorded");
            }
        }
    }

    /// Tear the controller down and wait for queued frames to be written.
    pub(crate) async fn shutdown(mut self) {
        let writer = self.binding.as_mut().and_then(|b| b.writer.take());
        drop(self);
        if let Some(writer) = writer
            && let Err(e) = writer.await
        {
            tracing::warn!("Runner channel writer task failed: {e}");
        }
    }

    fn send(&self, frame: serde_json::Value) {
        if self.outbound.send(frame).is_err() {
            tracing::debug!("Runner channel writer gone; dropping frame");
        }
    }
}

impl Drop for ChildController {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            let result = self.recorded.unwrap_or(AppResult::Unimplemented);
            tracing::debug!(%result, "Reporting application completion");
            completion.complete(result);
        }
        if let Some(binding) = self.binding.take() {
            binding.reader.abort();
            if let Some(writer) = binding.writer {
                writer.abort();
            }
        }
    }
}
