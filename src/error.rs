//! Error types for the ArC1 driver.
//!
//! `ArcError` is the single error type returned by every fallible operation in
//! the crate. The variants map onto the failure classes a caller has to tell
//! apart:
//!
//! - **`Address`**: a crossbar coordinate outside the configured array. Always
//!   detected locally, before anything is written to the transport.
//! - **`Connection`**: opening the link or the initial handshake failed. Fatal
//!   to that connect attempt only; connecting again is allowed.
//! - **`Protocol`**: a response frame that is short, corrupt, of the wrong
//!   shape, or that never arrived within the timeout. Carries the raw bytes
//!   received so far.
//! - **`DeviceFault`**: a well-formed response whose status byte reports a
//!   device-level problem (compliance, overcurrent, ...). Asking again will
//!   not help; the device misbehaved.
//! - **`NoDeviceSelected`** / **`ControllerBusy`** / **`NotConnected`**: local
//!   precondition violations, detected before any I/O.
//!
//! Nothing inside the crate retries automatically; retry policy belongs to
//! the caller.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type ArcResult<T> = std::result::Result<T, ArcError>;

/// What went wrong with a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFault {
    /// No complete frame arrived within the transport timeout.
    Timeout(Duration),
    /// The byte stream ended in the middle of a frame.
    Closed,
    /// The frame did not start with the sync byte.
    BadSync(u8),
    /// Payload length does not match the response expected for the command.
    BadLength {
        /// Length the command expects.
        expected: usize,
        /// Length announced by the frame header.
        actual: usize,
    },
    /// Checksum byte does not match the frame contents.
    BadChecksum {
        /// Checksum computed over the received bytes.
        computed: u8,
        /// Checksum carried by the frame.
        received: u8,
    },
    /// Payload could not be interpreted (e.g. a non-finite reading).
    Malformed(&'static str),
}

impl fmt::Display for ProtocolFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFault::Timeout(t) => write!(f, "timed out after {:?}", t),
            ProtocolFault::Closed => write!(f, "connection closed mid-frame"),
            ProtocolFault::BadSync(b) => write!(f, "bad sync byte 0x{:02x}", b),
            ProtocolFault::BadLength { expected, actual } => {
                write!(f, "expected {} payload bytes, frame announces {}", expected, actual)
            }
            ProtocolFault::BadChecksum { computed, received } => write!(
                f,
                "checksum mismatch (computed 0x{:02x}, received 0x{:02x})",
                computed, received
            ),
            ProtocolFault::Malformed(what) => write!(f, "malformed payload: {}", what),
        }
    }
}

/// Status flags reported by the board in a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultFlags(pub u8);

impl FaultFlags {
    /// Current compliance limit reached.
    pub const COMPLIANCE: u8 = 0x01;
    /// Overcurrent protection tripped.
    pub const OVERCURRENT: u8 = 0x02;
    /// Reading outside the amplifier range.
    pub const OUT_OF_RANGE: u8 = 0x04;
    /// Firmware rejected the command (e.g. pulse with nothing selected).
    pub const REJECTED: u8 = 0x80;

    /// Returns `true` when every bit in `flag` is set.
    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }
}

impl fmt::Display for FaultFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::COMPLIANCE, "compliance"),
            (Self::OVERCURRENT, "overcurrent"),
            (Self::OUT_OF_RANGE, "out of range"),
            (Self::REJECTED, "rejected"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();

        if set.is_empty() {
            write!(f, "status 0x{:02x}", self.0)
        } else {
            write!(f, "{} (0x{:02x})", set.join(", "), self.0)
        }
    }
}

/// Errors produced by the driver.
#[derive(Error, Debug)]
pub enum ArcError {
    /// Coordinate outside the crossbar.
    #[error("device ({word}, {bit}) is outside the {words}x{bits} crossbar")]
    Address {
        /// Requested word-line.
        word: u32,
        /// Requested bit-line.
        bit: u32,
        /// Word-lines in the array.
        words: u32,
        /// Bit-lines in the array.
        bits: u32,
    },

    /// Transport open or handshake failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed, short or missing response frame.
    #[error("Protocol error during {command}: {fault} ({} bytes received)", raw.len())]
    Protocol {
        /// Command whose response failed to decode.
        command: &'static str,
        /// Classification of the failure.
        fault: ProtocolFault,
        /// Bytes received before the failure was detected.
        raw: Vec<u8>,
    },

    /// Well-formed response reporting a device-level failure.
    #[error("Device fault during {command}: {flags}")]
    DeviceFault {
        /// Command that reported the fault.
        command: &'static str,
        /// Decoded status flags.
        flags: FaultFlags,
    },

    /// Pulse or read of the active device with nothing latched.
    #[error("No device selected")]
    NoDeviceSelected,

    /// Single-shot operation attempted while a module run holds the board.
    #[error("Controller is busy running a module")]
    ControllerBusy,

    /// Operation attempted after `disconnect`.
    #[error("Controller is not connected")]
    NotConnected,

    /// Configuration value outside the board's accepted range.
    #[error("Configuration validation error: {0}")]
    InvalidConfiguration(String),

    /// No module registered under this tag.
    #[error("Unknown module '{0}'")]
    UnknownModule(String),

    /// Failure raised by a module body.
    #[error("Module error: {0}")]
    Module(#[from] anyhow::Error),

    /// The consumer abandoned the run; the worker should wind down.
    #[error("Module run cancelled")]
    Cancelled,

    /// I/O error from the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArcError {
    pub(crate) fn protocol(command: &'static str, fault: ProtocolFault, raw: Vec<u8>) -> Self {
        ArcError::Protocol {
            command,
            fault,
            raw,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ArcError::InvalidConfiguration(msg.into())
    }

    /// True for errors raised before any byte was sent.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ArcError::Address { .. }
                | ArcError::NoDeviceSelected
                | ArcError::ControllerBusy
                | ArcError::NotConnected
                | ArcError::InvalidConfiguration(_)
                | ArcError::UnknownModule(_)
        )
    }
}
