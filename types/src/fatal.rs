use thiserror::Error;

/// Exit status used when the runner connection is lost after the handshake.
pub const CONNECTION_LOST_EXIT_CODE: i32 = 1;

/// An unrecoverable condition raised by the controller.
///
/// The controller never terminates the process itself. It hands one of these
/// to the shutdown coordinator, which owns the decision to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FatalError {
    /// The runner sent `exit_now`.
    #[error("runner requested exit with status {code}")]
    ExitRequested { code: i32 },
    /// The channel closed after the application request was delivered and the
    /// worker was started with `exit_on_error`.
    #[error("connection to the runner was lost")]
    ConnectionLost,
}

impl FatalError {
    /// The process exit status this condition implies.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::ExitRequested { code } => code,
            Self::ConnectionLost => CONNECTION_LOST_EXIT_CODE,
        }
    }
}
