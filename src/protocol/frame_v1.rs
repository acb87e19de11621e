//! First wire revision of the ArC1 protocol.
//!
//! Commands are sequences of newline-terminated ASCII fields: a job code
//! followed by its parameters. Integers are written in decimal, voltages and
//! durations (in seconds) with six decimals. Word/bit numbers are 1-based on
//! the wire.
//!
//! | command      | job  | fields                                                     |
//! |--------------|------|------------------------------------------------------------|
//! | reset        | `00` |                                                            |
//! | init         | `0`  | read cycles, words, bits, read mode, session, sneak, Vread |
//! | configure    | `01` | read mode, Vread                                           |
//! | select       | `02` | word, bit                                                  |
//! | deselect     | `03` |                                                            |
//! | pulse        | `04` | amplitude, width                                           |
//! | status       | `05` |                                                            |
//! | read         | `1`  | word, bit                                                  |
//! | pulse-read   | `3`  | word, bit, amplitude, width                                |
//!
//! Responses are binary frames:
//!
//! ```text
//! 0xAA | status | len | payload[len] | checksum
//! ```
//!
//! `checksum` is the XOR of `status`, `len` and every payload byte. A value
//! payload is a little-endian `f32` resistance in ohms; a status payload is
//! the firmware major and minor version.

use super::limits::{self, MAX_BITS, MAX_WORDS};
use super::{Command, FirmwareVersion, Response, ResponseKind, WireFormat};
use crate::error::{ArcError, ArcResult, FaultFlags, ProtocolFault};
use crate::instrument::crossbar::Coordinate;
use crate::measurement::Pulse;

/// First byte of every response frame.
pub const SYNC: u8 = 0xAA;
/// Sync, status and length bytes.
pub const HEADER_LEN: usize = 3;

const VALUE_LEN: usize = 4;
const STATUS_LEN: usize = 2;

/// The `arc1-v1` wire revision.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameV1;

impl FrameV1 {
    fn payload_len(kind: ResponseKind) -> usize {
        match kind {
            ResponseKind::None | ResponseKind::Ack => 0,
            ResponseKind::Value => VALUE_LEN,
            ResponseKind::Status => STATUS_LEN,
        }
    }
}

/// XOR checksum over status, length and payload.
pub fn checksum(status: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(status ^ payload.len() as u8, |acc, b| acc ^ b)
}

/// Build a complete response frame.
pub fn response_frame(status: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    frame.push(SYNC);
    frame.push(status);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    frame.push(checksum(status, payload));
    frame
}

struct Fields(Vec<u8>);

impl Fields {
    fn job(code: &str) -> Self {
        let mut fields = Fields(Vec::with_capacity(64));
        fields.push_str(code);
        fields
    }

    fn push_str(&mut self, s: &str) {
        self.0.extend_from_slice(s.as_bytes());
        self.0.push(b'\n');
    }

    fn int(mut self, value: u32) -> Self {
        self.push_str(&value.to_string());
        self
    }

    fn float(mut self, value: f64) -> Self {
        self.push_str(&format!("{:.6}", value));
        self
    }

    fn device(self, coordinate: Coordinate) -> Self {
        self.int(coordinate.word + 1).int(coordinate.bit + 1)
    }

    fn pulse(self, pulse: &Pulse) -> Self {
        self.float(pulse.amplitude).float(pulse.width.as_secs_f64())
    }
}

impl WireFormat for FrameV1 {
    fn revision(&self) -> &'static str {
        "arc1-v1"
    }

    fn encode(&self, command: &Command) -> ArcResult<Vec<u8>> {
        let fields = match command {
            Command::Reset => Fields::job("00"),
            Command::Init(config) => {
                config.validate()?;
                Fields::job("0")
                    .int(config.read_cycles)
                    .int(config.words)
                    .int(config.bits)
                    .int(config.read_mode.wire_code())
                    .int(config.session_type.wire_code())
                    .int(config.sneak_path.wire_code())
                    .float(config.read_voltage)
            }
            Command::Configure {
                read_mode,
                read_voltage,
            } => {
                limits::check_voltage("read voltage", *read_voltage)?;
                Fields::job("01").int(read_mode.wire_code()).float(*read_voltage)
            }
            Command::Select(device) => {
                check_device(*device)?;
                Fields::job("02").device(*device)
            }
            Command::Deselect => Fields::job("03"),
            Command::PulseActive(pulse) => {
                limits::check_pulse(pulse)?;
                Fields::job("04").pulse(pulse)
            }
            Command::Status => Fields::job("05"),
            Command::Read(device) => {
                check_device(*device)?;
                Fields::job("1").device(*device)
            }
            Command::PulseRead(device, pulse) => {
                check_device(*device)?;
                limits::check_pulse(pulse)?;
                Fields::job("3").device(*device).pulse(pulse)
            }
        };
        Ok(fields.0)
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn remaining_len(&self, command: &Command, header: &[u8]) -> ArcResult<usize> {
        if header.len() < HEADER_LEN {
            return Err(ArcError::protocol(
                command.name(),
                ProtocolFault::Closed,
                header.to_vec(),
            ));
        }
        if header[0] != SYNC {
            return Err(ArcError::protocol(
                command.name(),
                ProtocolFault::BadSync(header[0]),
                header.to_vec(),
            ));
        }
        let expected = Self::payload_len(command.expected_response());
        let actual = header[2] as usize;
        if actual != expected {
            return Err(ArcError::protocol(
                command.name(),
                ProtocolFault::BadLength { expected, actual },
                header.to_vec(),
            ));
        }
        Ok(actual + 1)
    }

    fn decode(&self, command: &Command, frame: &[u8]) -> ArcResult<Response> {
        let remaining = self.remaining_len(command, frame)?;
        if frame.len() != HEADER_LEN + remaining {
            return Err(ArcError::protocol(
                command.name(),
                ProtocolFault::Closed,
                frame.to_vec(),
            ));
        }

        let status = frame[1];
        let payload = &frame[HEADER_LEN..frame.len() - 1];
        let received = frame[frame.len() - 1];
        let computed = checksum(status, payload);
        if computed != received {
            return Err(ArcError::protocol(
                command.name(),
                ProtocolFault::BadChecksum { computed, received },
                frame.to_vec(),
            ));
        }

        // Only a frame that survived framing checks can carry a device fault.
        if status != 0 {
            return Err(ArcError::DeviceFault {
                command: command.name(),
                flags: FaultFlags(status),
            });
        }

        match command.expected_response() {
            ResponseKind::None | ResponseKind::Ack => Ok(Response::Ack),
            ResponseKind::Value => {
                let bytes = [payload[0], payload[1], payload[2], payload[3]];
                let value = f32::from_le_bytes(bytes);
                if !value.is_finite() {
                    return Err(ArcError::protocol(
                        command.name(),
                        ProtocolFault::Malformed("non-finite reading"),
                        frame.to_vec(),
                    ));
                }
                Ok(Response::Value(value as f64))
            }
            ResponseKind::Status => Ok(Response::Status(FirmwareVersion {
                major: payload[0],
                minor: payload[1],
            })),
        }
    }
}

fn check_device(device: Coordinate) -> ArcResult<()> {
    if device.word >= MAX_WORDS || device.bit >= MAX_BITS {
        return Err(ArcError::Address {
            word: device.word,
            bit: device.bit,
            words: MAX_WORDS,
            bits: MAX_BITS,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoardConfig, ReadMode};
    use std::time::Duration;

    fn text(bytes: &[u8]) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_select_uses_one_based_numbering() {
        let bytes = FrameV1.encode(&Command::Select(Coordinate::new(2, 7))).unwrap();
        assert_eq!(text(&bytes), "02\n3\n8\n");
    }

    #[test]
    fn test_pulse_read_scales_units() {
        let cmd = Command::PulseRead(
            Coordinate::new(0, 0),
            Pulse::new(2.5, Duration::from_micros(100)),
        );
        let bytes = FrameV1.encode(&cmd).unwrap();
        assert_eq!(text(&bytes), "3\n1\n1\n2.500000\n0.000100\n");
    }

    #[test]
    fn test_init_frame_layout() {
        let config = BoardConfig::default();
        let bytes = FrameV1.encode(&Command::Init(config)).unwrap();
        assert_eq!(text(&bytes), "0\n30\n32\n32\n2\n0\n0\n0.500000\n");
    }

    #[test]
    fn test_out_of_range_pulse_builds_no_frame() {
        let cmd = Command::PulseActive(Pulse::new(20.0, Duration::from_micros(100)));
        assert!(matches!(
            FrameV1.encode(&cmd),
            Err(ArcError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_configure_rejects_out_of_range_voltage() {
        let cmd = Command::Configure {
            read_mode: ReadMode::Tia4p,
            read_voltage: 15.0,
        };
        assert!(FrameV1.encode(&cmd).is_err());
    }

    #[test]
    fn test_decode_value() {
        let frame = response_frame(0, &1234.5f32.to_le_bytes());
        let response = FrameV1
            .decode(&Command::Read(Coordinate::new(0, 0)), &frame)
            .unwrap();
        assert_eq!(response, Response::Value(1234.5));
    }

    #[test]
    fn test_decode_status() {
        let frame = response_frame(0, &[2, 7]);
        let response = FrameV1.decode(&Command::Status, &frame).unwrap();
        assert_eq!(
            response,
            Response::Status(FirmwareVersion { major: 2, minor: 7 })
        );
    }

    #[test]
    fn test_bad_checksum_is_protocol_error() {
        let mut frame = response_frame(0, &[]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        match FrameV1.decode(&Command::Deselect, &frame) {
            Err(ArcError::Protocol { fault, raw, .. }) => {
                assert!(matches!(fault, ProtocolFault::BadChecksum { .. }));
                assert_eq!(raw, frame);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wrong_length_is_protocol_error() {
        let frame = response_frame(0, &[]);
        let err = FrameV1
            .decode(&Command::Read(Coordinate::new(0, 0)), &frame)
            .unwrap_err();
        assert!(matches!(
            err,
            ArcError::Protocol {
                fault: ProtocolFault::BadLength {
                    expected: 4,
                    actual: 0
                },
                ..
            }
        ));
    }

    #[test]
    fn test_bad_sync_is_protocol_error() {
        let err = FrameV1
            .remaining_len(&Command::Deselect, &[0x55, 0, 0])
            .unwrap_err();
        assert!(matches!(
            err,
            ArcError::Protocol {
                fault: ProtocolFault::BadSync(0x55),
                ..
            }
        ));
    }

    #[test]
    fn test_status_flag_is_device_fault() {
        let frame = response_frame(FaultFlags::COMPLIANCE, &100.0f32.to_le_bytes());
        let err = FrameV1
            .decode(&Command::Read(Coordinate::new(1, 1)), &frame)
            .unwrap_err();
        match err {
            ArcError::DeviceFault { command, flags } => {
                assert_eq!(command, "read");
                assert!(flags.contains(FaultFlags::COMPLIANCE));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame() {
        let frame = response_frame(0, &1.0f32.to_le_bytes());
        let err = FrameV1
            .decode(&Command::Read(Coordinate::new(0, 0)), &frame[..5])
            .unwrap_err();
        assert!(matches!(
            err,
            ArcError::Protocol {
                fault: ProtocolFault::Closed,
                ..
            }
        ));
    }
}
