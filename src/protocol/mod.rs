//! Command codec for the ArC1 board.
//!
//! Every operation the driver can ask of the board is a [`Command`]. A
//! [`WireFormat`] turns commands into bytes and response frames back into a
//! typed [`Response`]. The byte-level layout is a property of the firmware
//! revision, so it lives behind the trait; [`FrameV1`] is the revision shipped
//! with the driver.
//!
//! The codec is the only place that converts engineering units (volts,
//! seconds, 0-based coordinates) into their wire representation.

pub mod frame_v1;
pub mod limits;

pub use frame_v1::FrameV1;

use crate::config::{BoardConfig, ReadMode};
use crate::error::ArcResult;
use crate::instrument::crossbar::Coordinate;
use crate::measurement::Pulse;
use std::fmt;

/// Operations understood by the board.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Force a microcontroller reset. The board does not answer.
    Reset,
    /// Upload the session configuration.
    Init(BoardConfig),
    /// Change read voltage and amplifier mode.
    Configure {
        /// Amplifier mode to use for reads.
        read_mode: ReadMode,
        /// Read voltage in volts.
        read_voltage: f64,
    },
    /// Close the crosspoint at the coordinate.
    Select(Coordinate),
    /// Open whatever crosspoint is latched.
    Deselect,
    /// Pulse the latched device.
    PulseActive(Pulse),
    /// Firmware/status query.
    Status,
    /// Read the device at the coordinate (which must be latched).
    Read(Coordinate),
    /// Pulse then read the device as one board-side operation.
    PulseRead(Coordinate, Pulse),
}

impl Command {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Reset => "reset",
            Command::Init(_) => "init",
            Command::Configure { .. } => "configure",
            Command::Select(_) => "select",
            Command::Deselect => "deselect",
            Command::PulseActive(_) => "pulse",
            Command::Status => "status",
            Command::Read(_) => "read",
            Command::PulseRead(..) => "pulse-read",
        }
    }

    /// The response the board sends back for this command.
    pub fn expected_response(&self) -> ResponseKind {
        match self {
            Command::Reset => ResponseKind::None,
            Command::Init(_)
            | Command::Configure { .. }
            | Command::Select(_)
            | Command::Deselect
            | Command::PulseActive(_) => ResponseKind::Ack,
            Command::Status => ResponseKind::Status,
            Command::Read(_) | Command::PulseRead(..) => ResponseKind::Value,
        }
    }
}

/// Shape of the response a command expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Fire-and-forget.
    None,
    /// Empty confirmation.
    Ack,
    /// One measured resistance.
    Value,
    /// Firmware version.
    Status,
}

/// Firmware version reported by a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Decoded response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Response {
    /// Command accepted.
    Ack,
    /// Measured resistance in ohms.
    Value(f64),
    /// Firmware version.
    Status(FirmwareVersion),
}

/// A versioned byte-level layout for commands and responses.
///
/// Implementations must validate every value against the board limits in
/// [`limits`] before producing any bytes, so an out-of-range parameter never
/// reaches the transport.
pub trait WireFormat: Send + Sync + fmt::Debug {
    /// Revision identifier, e.g. `"arc1-v1"`.
    fn revision(&self) -> &'static str;

    /// Encode a command into the bytes written to the transport.
    fn encode(&self, command: &Command) -> ArcResult<Vec<u8>>;

    /// Number of bytes to read before the frame length is known.
    fn header_len(&self) -> usize;

    /// Validate a received header and return how many bytes remain in the frame.
    fn remaining_len(&self, command: &Command, header: &[u8]) -> ArcResult<usize>;

    /// Decode a complete frame (header included).
    fn decode(&self, command: &Command, frame: &[u8]) -> ArcResult<Response>;
}
