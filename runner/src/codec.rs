//! Frame codec for the runner channel.
//!
//! A frame is a header block terminated by an empty line, followed by a JSON
//! body of exactly `Content-Length` bytes:
//!
//! ```text
//! Content-Length: 62\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"exit_now","params":{"exit_code":0}}
//! ```
//!
//! Both the header block and the body are bounded before anything is
//! buffered. [`FrameError`] separates a peer that went away mid-frame from a
//! peer that sent something malformed.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest body accepted from the peer.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Largest header block (all header lines plus the blank separator).
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("runner channel I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("channel closed inside a frame header")]
    TruncatedHeader,
    #[error("channel closed after a header announcing {expected} body bytes")]
    TruncatedBody { expected: usize },
    #[error("frame header block exceeds {limit} bytes")]
    HeaderTooLong { limit: usize },
    #[error("malformed frame header line `{0}`")]
    MalformedHeader(String),
    #[error("frame header block has no Content-Length")]
    MissingLength,
    #[error("invalid Content-Length `{0}`")]
    InvalidLength(String),
    #[error("conflicting Content-Length headers ({first} and {second})")]
    ConflictingLength { first: usize, second: usize },
    #[error("frame of {length} bytes exceeds limit of {limit}")]
    TooLarge { length: usize, limit: usize },
    #[error("frame body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("cannot encode frame body: {0}")]
    Encode(#[source] serde_json::Error),
}

impl FrameError {
    /// The peer closed the stream part-way through a frame. Anything else
    /// is an I/O failure or a protocol violation.
    #[must_use]
    pub fn is_truncation(&self) -> bool {
        matches!(self, Self::TruncatedHeader | Self::TruncatedBody { .. })
    }
}

/// Reads length-prefixed JSON frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    body_limit: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_FRAME_BYTES)
    }

    /// Reader accepting bodies of at most `body_limit` bytes. The header
    /// block is capped at [`MAX_HEADER_BYTES`] regardless.
    pub fn with_limit(reader: R, body_limit: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            body_limit,
        }
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` means the peer closed the stream between frames.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let Some(block) = self.read_header_block().await? else {
            return Ok(None);
        };
        let length = parse_header_block(&block)?;
        if length > self.body_limit {
            return Err(FrameError::TooLarge {
                length,
                limit: self.body_limit,
            });
        }

        let mut body = vec![0u8; length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => FrameError::TruncatedBody { expected: length },
                _ => FrameError::Io(e),
            })?;

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(FrameError::InvalidJson)
    }

    /// Raw header block up to and including the blank line, or `None` on a
    /// clean close before the first byte.
    async fn read_header_block(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut block = Vec::new();
        loop {
            let line_start = block.len();
            let budget = (MAX_HEADER_BYTES - line_start) as u64;
            (&mut self.reader)
                .take(budget)
                .read_until(b'\n', &mut block)
                .await?;

            if !block[line_start..].ends_with(b"\n") {
                return if block.is_empty() {
                    Ok(None)
                } else if block.len() >= MAX_HEADER_BYTES {
                    Err(FrameError::HeaderTooLong {
                        limit: MAX_HEADER_BYTES,
                    })
                } else {
                    Err(FrameError::TruncatedHeader)
                };
            }
            if matches!(&block[line_start..], b"\r\n" | b"\n") {
                return Ok(Some(block));
            }
        }
    }
}

fn parse_header_block(block: &[u8]) -> Result<usize, FrameError> {
    let text = String::from_utf8_lossy(block);
    let mut length = None;
    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            continue;
        }
        let value = value.trim();
        let parsed: usize = value
            .parse()
            .map_err(|_| FrameError::InvalidLength(value.to_string()))?;
        match length {
            Some(first) if first != parsed => {
                return Err(FrameError::ConflictingLength {
                    first,
                    second: parsed,
                });
            }
            _ => length = Some(parsed),
        }
    }
    length.ok_or(FrameError::MissingLength)
}

/// Writes length-prefixed JSON frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode `message` and write it as one frame. Header and body go out
    /// in a single write so a reader never sees a header alone.
    pub async fn write_frame<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<(), FrameError> {
        let body = serde_json::to_vec(message).map_err(FrameError::Encode)?;
        let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
