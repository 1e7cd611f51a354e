//! Worker side of the runner connection.
//!
//! A worker process calls [`connect_to_runner`] once at start-up. It resolves
//! the channel to the runner, starts a dedicated controller thread bound to
//! that channel, and blocks until the runner delivers the application request
//! (or closes the channel first).

pub mod codec;
pub mod protocol;

mod channel;
mod connection;
mod controller;
mod rendezvous;
mod shutdown;

pub use channel::{
    AcquireError, ChannelHandle, ChannelIo, ChannelStream, RUNNER_CHANNEL_SWITCH, StartParams,
    acquire_channel,
};
pub use connection::{
    CONTROLLER_THREAD_NAME, ConnectionOptions, RunnerConnection, connect_to_runner,
};
pub use rendezvous::{Blocker, Unblocker, rendezvous};
pub use shutdown::{FatalSender, ShutdownCoordinator, fatal_channel};

pub use childlink_types::{AppResult, FatalError, ServiceRequest};
