//! Core domain types for childlink.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Both the runner connection and the worker binary build on them.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod fatal;
mod request;
mod result;
mod token;

pub use fatal::{CONNECTION_LOST_EXIT_CODE, FatalError};
pub use request::{ROOT_USER_ID, ServiceRequest};
pub use result::AppResult;
pub use token::{ChannelAddress, ChannelToken, TokenError};
