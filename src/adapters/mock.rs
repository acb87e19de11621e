//! Simulated ArC1 board.
//!
//! [`MockBoard::spawn`] starts a task that speaks the `arc1-v1` wire revision
//! over an in-memory duplex stream and returns the client end as a
//! [`Transport`]. The task keeps a per-device resistance model and a log of
//! every command it decoded, and can be told to corrupt upcoming responses.
//!
//! Model:
//!
//! - Every device starts between 1 kΩ and 1 MΩ, derived from its coordinate
//! - Positive pulses lower the resistance, negative pulses raise it
//! - Reads and pulse-reads are rejected unless the device is latched
//! - Pulses with nothing latched are rejected
//!
//! All waits use `tokio::time::sleep`.

use super::Transport;
use crate::error::FaultFlags;
use crate::instrument::crossbar::Coordinate;
use crate::protocol::frame_v1::response_frame;
use crate::protocol::FirmwareVersion;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

const DUPLEX_CAPACITY: usize = 4096;

/// A corruption applied to the next response the board sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Flip the checksum byte.
    CorruptChecksum,
    /// Send only the first half of the frame.
    Truncate,
    /// Send nothing at all.
    Silence,
    /// Replace the sync byte.
    BadSync,
    /// Report these status flags with a well-formed frame.
    Status(u8),
}

#[derive(Debug)]
struct BoardState {
    words: u32,
    bits: u32,
    read_voltage: f64,
    latched: Option<Coordinate>,
    resistances: HashMap<Coordinate, f64>,
    bytes_received: usize,
    commands: Vec<String>,
    faults: VecDeque<Fault>,
    latency: Duration,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            words: 32,
            bits: 32,
            read_voltage: 0.5,
            latched: None,
            resistances: HashMap::new(),
            bytes_received: 0,
            commands: Vec::new(),
            faults: VecDeque::new(),
            latency: Duration::ZERO,
        }
    }
}

/// Entry point for the simulated board.
pub struct MockBoard;

impl MockBoard {
    /// Firmware version reported by status queries.
    pub const FIRMWARE: FirmwareVersion = FirmwareVersion { major: 2, minor: 0 };
    /// Lowest modelled resistance in ohms.
    pub const MIN_RESISTANCE: f64 = 1e3;
    /// Highest modelled resistance in ohms.
    pub const MAX_RESISTANCE: f64 = 1e6;

    /// Start a simulated board and return the transport connected to it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn() -> (Transport, MockHandle) {
        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        let state = Arc::new(Mutex::new(BoardState::default()));
        tokio::spawn(serve(server, state.clone()));
        (Transport::new(client, "mock"), MockHandle { state })
    }

    /// Initial resistance of a device.
    pub fn model_resistance(device: Coordinate) -> f64 {
        let spread = ((device.word * 7 + device.bit * 13) % 32) as f64 / 31.0;
        10f64.powf(3.0 + 3.0 * spread)
    }
}

/// Inspection and fault-injection handle for a running [`MockBoard`].
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<BoardState>>,
}

impl MockHandle {
    /// Total command bytes the board has received.
    pub fn bytes_received(&self) -> usize {
        self.state.lock().bytes_received
    }

    /// Every decoded command, as its fields joined by spaces.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Number of decoded commands with the given job code.
    pub fn count(&self, job: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.split(' ').next() == Some(job))
            .count()
    }

    /// Forget the command log.
    pub fn clear_log(&self) {
        self.state.lock().commands.clear();
    }

    /// Corrupt the next response.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Crosspoint the board has latched.
    pub fn latched(&self) -> Option<Coordinate> {
        self.state.lock().latched
    }

    /// Modelled resistance of a device.
    pub fn resistance(&self, device: Coordinate) -> f64 {
        self.state.lock().resistance(device)
    }

    /// Override the modelled resistance of a device.
    pub fn set_resistance(&self, device: Coordinate, ohms: f64) {
        self.state.lock().resistances.insert(device, ohms);
    }

    /// Read voltage the board was last configured with.
    pub fn read_voltage(&self) -> f64 {
        self.state.lock().read_voltage
    }
}

enum Reply {
    None,
    Ack(u8),
    Value(u8, f64),
    Status(FirmwareVersion),
}

impl BoardState {
    fn resistance(&self, device: Coordinate) -> f64 {
        self.resistances
            .get(&device)
            .copied()
            .unwrap_or_else(|| MockBoard::model_resistance(device))
    }

    fn apply_pulse(&mut self, device: Coordinate, amplitude: f64) {
        let factor = 1.0 - 0.02 * amplitude.clamp(-12.0, 12.0);
        let next = (self.resistance(device) * factor)
            .clamp(MockBoard::MIN_RESISTANCE, MockBoard::MAX_RESISTANCE);
        self.resistances.insert(device, next);
    }

    fn device(&self, fields: &[String]) -> Option<Coordinate> {
        let word: u32 = fields.first()?.parse().ok()?;
        let bit: u32 = fields.get(1)?.parse().ok()?;
        if word == 0 || bit == 0 || word > self.words || bit > self.bits {
            return None;
        }
        Some(Coordinate::new(word - 1, bit - 1))
    }

    fn float(fields: &[String], index: usize) -> Option<f64> {
        fields.get(index)?.parse().ok()
    }

    fn execute(&mut self, job: &str, fields: &[String]) -> Reply {
        let rejected = FaultFlags::REJECTED;
        match job {
            "00" => {
                self.latched = None;
                Reply::None
            }
            "0" => {
                self.words = fields.get(1).and_then(|f| f.parse().ok()).unwrap_or(self.words);
                self.bits = fields.get(2).and_then(|f| f.parse().ok()).unwrap_or(self.bits);
                self.read_voltage = Self::float(fields, 6).unwrap_or(self.read_voltage);
                self.latched = None;
                Reply::Ack(0)
            }
            "01" => {
                self.read_voltage = Self::float(fields, 1).unwrap_or(self.read_voltage);
                Reply::Ack(0)
            }
            "02" => match self.device(fields) {
                Some(device) => {
                    self.latched = Some(device);
                    Reply::Ack(0)
                }
                None => Reply::Ack(rejected),
            },
            "03" => {
                self.latched = None;
                Reply::Ack(0)
            }
            "04" => match (self.latched, Self::float(fields, 0)) {
                (Some(device), Some(amplitude)) => {
                    self.apply_pulse(device, amplitude);
                    Reply::Ack(0)
                }
                _ => Reply::Ack(rejected),
            },
            "05" => Reply::Status(MockBoard::FIRMWARE),
            "1" => match self.device(fields) {
                Some(device) if self.latched == Some(device) => {
                    Reply::Value(0, self.resistance(device))
                }
                _ => Reply::Value(rejected, 0.0),
            },
            "3" => match (self.device(fields), Self::float(fields, 2)) {
                (Some(device), Some(amplitude)) if self.latched == Some(device) => {
                    self.apply_pulse(device, amplitude);
                    Reply::Value(0, self.resistance(device))
                }
                _ => Reply::Value(rejected, 0.0),
            },
            _ => Reply::None,
        }
    }

    fn frame(&mut self, reply: Reply) -> Option<Vec<u8>> {
        let (status, payload) = match reply {
            Reply::None => return None,
            Reply::Ack(status) => (status, Vec::new()),
            Reply::Value(status, ohms) => (status, (ohms as f32).to_le_bytes().to_vec()),
            Reply::Status(version) => (0, vec![version.major, version.minor]),
        };

        let mut frame = response_frame(status, &payload);
        match self.faults.pop_front() {
            None => {}
            Some(Fault::CorruptChecksum) => {
                let last = frame.len() - 1;
                frame[last] ^= 0xFF;
            }
            Some(Fault::Truncate) => frame.truncate(frame.len() / 2),
            Some(Fault::Silence) => return None,
            Some(Fault::BadSync) => frame[0] = 0x55,
            Some(Fault::Status(flags)) => frame = response_frame(flags, &vec![0; payload.len()]),
        }
        Some(frame)
    }
}

fn param_count(job: &str) -> Option<usize> {
    match job {
        "00" | "03" | "05" => Some(0),
        "01" | "02" | "04" | "1" => Some(2),
        "3" => Some(4),
        "0" => Some(7),
        _ => None,
    }
}

async fn next_field<R>(reader: &mut BufReader<R>, state: &Mutex<BoardState>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(n) => {
            state.lock().bytes_received += n;
            Some(line.trim_end().to_string())
        }
    }
}

async fn serve(stream: tokio::io::DuplexStream, state: Arc<Mutex<BoardState>>) {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    loop {
        let Some(job) = next_field(&mut reader, &state).await else {
            break;
        };
        let Some(params) = param_count(&job) else {
            warn!(job = %job, "mock board: unknown job");
            continue;
        };

        let mut fields = Vec::with_capacity(params);
        for _ in 0..params {
            match next_field(&mut reader, &state).await {
                Some(field) => fields.push(field),
                None => return,
            }
        }

        let latency = {
            let mut board = state.lock();
            let entry = std::iter::once(job.as_str())
                .chain(fields.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            board.commands.push(entry);
            board.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let frame = {
            let mut board = state.lock();
            let reply = board.execute(&job, &fields);
            board.frame(reply)
        };
        if let Some(frame) = frame {
            if write.write_all(&frame).await.is_err() {
                break;
            }
        }
    }

    debug!("mock board: client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_resistance_within_range() {
        for word in 0..32 {
            for bit in 0..32 {
                let r = MockBoard::model_resistance(Coordinate::new(word, bit));
                assert!((MockBoard::MIN_RESISTANCE..=MockBoard::MAX_RESISTANCE).contains(&r));
            }
        }
    }

    #[test]
    fn test_pulses_move_resistance_and_clamp() {
        let mut board = BoardState::default();
        let device = Coordinate::new(0, 0);
        board.resistances.insert(device, 10_000.0);

        board.apply_pulse(device, 2.5);
        assert!(board.resistance(device) < 10_000.0);

        for _ in 0..500 {
            board.apply_pulse(device, -12.0);
        }
        assert_eq!(board.resistance(device), MockBoard::MAX_RESISTANCE);
    }

    #[test]
    fn test_read_requires_latched_device() {
        let mut board = BoardState::default();
        let fields = vec!["1".to_string(), "1".to_string()];
        assert!(matches!(board.execute("1", &fields), Reply::Value(FaultFlags::REJECTED, _)));

        board.execute("02", &fields);
        assert!(matches!(board.execute("1", &fields), Reply::Value(0, _)));
    }

    #[test]
    fn test_injected_status_keeps_frame_shape() {
        let mut board = BoardState::default();
        board.faults.push_back(Fault::Status(FaultFlags::COMPLIANCE));
        let frame = board.frame(Reply::Value(0, 100.0)).unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(frame[1], FaultFlags::COMPLIANCE);
    }
}
