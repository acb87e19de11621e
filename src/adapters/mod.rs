//! Transport adapters
//!
//! The driver talks to the board over any async byte stream. [`Transport`]
//! wraps such a stream with a per-operation timeout and keeps whatever bytes
//! arrived before a failure so they can be reported with the error.
//!
//! Two stream sources ship with the crate: a serial port (feature `serial`)
//! and [`MockBoard`], an in-process simulated board used by tests and the
//! CLI `--mock` flag.

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial_adapter;

pub use mock::{Fault, MockBoard, MockHandle};
#[cfg(feature = "serial")]
pub use serial_adapter::open_serial;

use crate::error::{ArcError, ProtocolFault};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Default bound on every read or write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(7);

const DRAIN_WINDOW: Duration = Duration::from_millis(20);

/// Any duplex byte stream the driver can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Failure of a transport operation.
#[derive(Debug)]
pub enum TransportError {
    /// The deadline passed before the operation completed.
    Timeout {
        /// Bytes received before the deadline.
        received: Vec<u8>,
        /// The timeout in effect.
        after: Duration,
    },
    /// The peer closed the stream.
    Closed {
        /// Bytes received before the stream ended.
        received: Vec<u8>,
    },
    /// The underlying stream reported an error.
    Io(std::io::Error),
}

impl TransportError {
    /// Prepend bytes that were received by an earlier read of the same frame.
    pub fn after_prefix(self, prefix: &[u8]) -> Self {
        let join = |received: Vec<u8>| [prefix, &received[..]].concat();
        match self {
            TransportError::Timeout { received, after } => TransportError::Timeout {
                received: join(received),
                after,
            },
            TransportError::Closed { received } => TransportError::Closed {
                received: join(received),
            },
            io => io,
        }
    }

    /// Attribute the failure to a command.
    pub fn into_arc(self, command: &'static str) -> ArcError {
        match self {
            TransportError::Timeout { received, after } => {
                ArcError::protocol(command, ProtocolFault::Timeout(after), received)
            }
            TransportError::Closed { received } => {
                ArcError::protocol(command, ProtocolFault::Closed, received)
            }
            TransportError::Io(e) => ArcError::Io(e),
        }
    }
}

/// Byte stream to the board with a bounded wait on every operation.
pub struct Transport {
    stream: Box<dyn ByteStream>,
    timeout: Duration,
    label: String,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("label", &self.label)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Transport {
    /// Wrap a stream. `label` identifies it in logs (e.g. the port path).
    pub fn new(stream: impl ByteStream + 'static, label: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            timeout: DEFAULT_TIMEOUT,
            label: label.into(),
        }
    }

    /// Set the bound on each operation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Change the bound on each operation.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Current bound on each operation.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Label given at construction.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Write a complete command frame and flush it.
    pub async fn write_frame(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        trace!(port = %self.label, bytes = ?bytes, "write");
        let write = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        };
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout {
                received: Vec::new(),
                after: self.timeout,
            }),
        }
    }

    /// Read exactly `len` bytes, or fail with the bytes received so far.
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        let deadline = tokio::time::Instant::now() + self.timeout;

        while filled < len {
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut buf[filled..]));
            match read.await {
                Ok(Ok(0)) => {
                    buf.truncate(filled);
                    return Err(TransportError::Closed { received: buf });
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_) => {
                    buf.truncate(filled);
                    return Err(TransportError::Timeout {
                        received: buf,
                        after: self.timeout,
                    });
                }
            }
        }

        trace!(port = %self.label, bytes = ?buf, "read");
        Ok(buf)
    }

    /// Throw away input that is already waiting, e.g. the tail of a frame
    /// that failed validation.
    pub async fn drain(&mut self) -> usize {
        let mut scratch = [0u8; 64];
        let mut discarded = 0;
        while let Ok(Ok(n)) = tokio::time::timeout(DRAIN_WINDOW, self.stream.read(&mut scratch)).await {
            if n == 0 {
                break;
            }
            discarded += n;
        }
        if discarded > 0 {
            debug!(port = %self.label, discarded, "discarded stale input");
        }
        discarded
    }

    /// Shut the stream down.
    pub async fn close(mut self) -> Result<(), TransportError> {
        debug!(port = %self.label, "closing transport");
        self.stream.shutdown().await.map_err(TransportError::Io)
    }
}
