//! Channel handles and channel acquisition.
//!
//! A [`ChannelHandle`] is an opaque, not-yet-registered endpoint of a
//! bidirectional byte channel to the runner. It is plain data until
//! [`ChannelHandle::into_stream`] is called inside an async runtime, which is
//! why acquisition can run on the caller's thread before the controller
//! thread's event loop is involved.

use std::io;
#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::PathBuf;

use childlink_types::{ChannelAddress, ChannelToken, TokenError};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

/// Command-line switch carrying the channel token.
pub const RUNNER_CHANNEL_SWITCH: &str = "--runner-channel";

/// Buffer size for in-process channel pairs.
const MEMORY_CHANNEL_BYTES: usize = 64 * 1024;

/// Any async byte stream usable as a runner channel.
pub trait ChannelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelIo for T {}

pub type ChannelStream = Box<dyn ChannelIo>;

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("no runner channel supplied and no --runner-channel start parameter found")]
    NoToken,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("cannot adopt inherited descriptor {fd}: {source}")]
    Adopt { fd: i32, source: io::Error },
    #[cfg(unix)]
    #[error("cannot connect to runner socket {}: {source}", path.display())]
    Connect { path: PathBuf, source: io::Error },
    #[error("channel token `{0}` is not supported on this platform")]
    Unsupported(String),
}

enum HandleKind {
    Memory(DuplexStream),
    #[cfg(unix)]
    Socket(UnixStream),
}

/// One end of a channel to the runner.
pub struct ChannelHandle {
    kind: HandleKind,
}

impl ChannelHandle {
    /// Both ends of an in-process channel.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(MEMORY_CHANNEL_BYTES);
        (
            Self {
                kind: HandleKind::Memory(a),
            },
            Self {
                kind: HandleKind::Memory(b),
            },
        )
    }

    /// Both ends of a Unix socket pair, suitable for handing one end to a
    /// child process.
    #[cfg(unix)]
    pub fn socket_pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_unix_stream(a), Self::from_unix_stream(b)))
    }

    #[cfg(unix)]
    #[must_use]
    pub fn from_unix_stream(stream: UnixStream) -> Self {
        Self {
            kind: HandleKind::Socket(stream),
        }
    }

    /// Register the handle with the current async runtime.
    ///
    /// Socket handles need a runtime with IO enabled; call this from inside
    /// one.
    pub fn into_stream(self) -> io::Result<ChannelStream> {
        match self.kind {
            HandleKind::Memory(stream) => Ok(Box::new(stream)),
            #[cfg(unix)]
            HandleKind::Socket(stream) => {
                stream.set_nonblocking(true)?;
                Ok(Box::new(tokio::net::UnixStream::from_std(stream)?))
            }
        }
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            HandleKind::Memory(_) => "memory",
            #[cfg(unix)]
            HandleKind::Socket(_) => "socket",
        };
        f.debug_struct("ChannelHandle").field("kind", &kind).finish()
    }
}

/// The subset of process start parameters the runner connection consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartParams {
    channel_token: Option<String>,
}

impl StartParams {
    /// Parameters of the current process.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_args(std::env::args().skip(1))
    }

    /// Scan `args` for the channel switch, as `--runner-channel=<token>` or
    /// `--runner-channel <token>`. The last occurrence wins.
    #[must_use]
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut channel_token = None;
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let arg = arg.as_ref();
            if arg == "--" {
                break;
            }
            if let Some(value) = arg
                .strip_prefix(RUNNER_CHANNEL_SWITCH)
                .and_then(|rest| rest.strip_prefix('='))
            {
                channel_token = Some(value.to_string());
            } else if arg == RUNNER_CHANNEL_SWITCH
                && let Some(value) = args.next()
            {
                channel_token = Some(value.as_ref().to_string());
            }
        }
        Self { channel_token }
    }

    #[must_use]
    pub fn with_channel_token(token: impl Into<String>) -> Self {
        Self {
            channel_token: Some(token.into()),
        }
    }

    #[must_use]
    pub fn channel_token(&self) -> Option<&str> {
        self.channel_token.as_deref()
    }
}

/// Resolve the channel to the runner.
///
/// A caller-supplied handle is used as-is. Otherwise the channel token from
/// `params` is resolved into the worker's end of the channel pair.
pub fn acquire_channel(
    handle: Option<ChannelHandle>,
    params: &StartParams,
) -> Result<ChannelHandle, AcquireError> {
    if let Some(handle) = handle {
        return Ok(handle);
    }

    let raw = params.channel_token().ok_or(AcquireError::NoToken)?;
    let token = ChannelToken::new(raw)?;
    let address = token.address()?;
    tracing::debug!(token = %token, "Resolving runner channel from start parameters");
    open_address(&token, address)
}

#[cfg(unix)]
fn open_address(_token: &ChannelToken, address: ChannelAddress) -> Result<ChannelHandle, AcquireError> {
    match address {
        ChannelAddress::InheritedFd(fd) => adopt_inherited_fd(fd)
            .map(ChannelHandle::from_unix_stream)
            .map_err(|source| AcquireError::Adopt { fd, source }),
        ChannelAddress::SocketPath(path) => match UnixStream::connect(&path) {
            Ok(stream) => Ok(ChannelHandle::from_unix_stream(stream)),
            Err(source) => Err(AcquireError::Connect { path, source }),
        },
    }
}

#[cfg(not(unix))]
fn open_address(token: &ChannelToken, _address: ChannelAddress) -> Result<ChannelHandle, AcquireError> {
    Err(AcquireError::Unsupported(token.to_string()))
}

/// Take ownership of a socket descriptor inherited from the runner.
///
/// The descriptor must be open and refer to a socket. It is marked
/// close-on-exec so it does not leak into processes this worker spawns.
#[cfg(unix)]
fn adopt_inherited_fd(fd: RawFd) -> io::Result<UnixStream> {
    use std::os::unix::io::FromRawFd;

    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: `stat` points to writable storage sized for `libc::stat`; an
    // invalid descriptor only makes fstat fail with EBADF.
    let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fstat succeeded, so the buffer is initialized.
    let stat = unsafe { stat.assume_init() };
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor is not a socket",
        ));
    }

    // SAFETY: F_GETFD takes no pointer argument; `fd` is an open socket.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: F_SETFD takes an integer flag set; `fd` is still open.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the descriptor is an open socket handed to this process for
    // exclusive use by the runner; nothing else in the process owns it.
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}
