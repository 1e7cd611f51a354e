//! Start-parameter tokens naming the runner channel.
//!
//! A worker launched without an explicit channel handle finds its channel
//! through a token on the command line. The token is validated at
//! construction, so holding a [`ChannelToken`] proves it is non-empty; turning
//! it into a [`ChannelAddress`] checks the form.

use std::path::PathBuf;

use thiserror::Error;

const FD_PREFIX: &str = "fd:";
const UNIX_PREFIX: &str = "unix:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("channel token must not be empty")]
    Empty,
    #[error("channel token `{0}` has no recognized scheme (expected `fd:` or `unix:`)")]
    UnknownScheme(String),
    #[error("channel token `{0}` does not name a valid file descriptor")]
    InvalidDescriptor(String),
    #[error("channel token `{0}` has an empty socket path")]
    EmptyPath(String),
}

/// A non-empty, trimmed channel token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelToken(String);

impl ChannelToken {
    pub fn new(value: impl Into<String>) -> Result<Self, TokenError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(TokenError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Where the channel endpoint named by this token lives.
    pub fn address(&self) -> Result<ChannelAddress, TokenError> {
        if let Some(raw) = self.0.strip_prefix(FD_PREFIX) {
            return match raw.parse::<i32>() {
                Ok(fd) if fd >= 0 => Ok(ChannelAddress::InheritedFd(fd)),
                _ => Err(TokenError::InvalidDescriptor(self.0.clone())),
            };
        }
        if let Some(raw) = self.0.strip_prefix(UNIX_PREFIX) {
            if raw.is_empty() {
                return Err(TokenError::EmptyPath(self.0.clone()));
            }
            return Ok(ChannelAddress::SocketPath(PathBuf::from(raw)));
        }
        Err(TokenError::UnknownScheme(self.0.clone()))
    }
}

impl std::fmt::Display for ChannelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed location of the worker's end of a channel pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAddress {
    /// A socket descriptor inherited from the runner.
    InheritedFd(i32),
    /// A listening socket the runner created for this worker.
    SocketPath(PathBuf),
}

impl ChannelAddress {
    /// Render back into token form, for launchers building command lines.
    #[must_use]
    pub fn to_token(&self) -> String {
        match self {
            Self::InheritedFd(fd) => format!("{FD_PREFIX}{fd}"),
            Self::SocketPath(path) => format!("{UNIX_PREFIX}{}", path.display()),
        }
    }
}
