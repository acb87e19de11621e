//! Measurement data produced by reads.
//!
//! [`MeasurementRecord`] is the single data point type shared by single-shot
//! operations and modules. Records are immutable once built; the builder
//! methods consume and return the record.

use crate::instrument::crossbar::Coordinate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A programming pulse: amplitude and width.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    /// Amplitude in volts.
    pub amplitude: f64,
    /// Pulse width.
    #[serde(with = "humantime_serde")]
    pub width: Duration,
}

impl Pulse {
    /// Build a pulse from volts and a width.
    pub fn new(amplitude: f64, width: Duration) -> Self {
        Self { amplitude, width }
    }
}

/// One read of one device.
///
/// # Fields
///
/// * `device` - Coordinate that was read
/// * `resistance` - Measured resistance in ohms
/// * `read_voltage` - Read voltage in effect at the time of the read
/// * `pulse` - Pulse applied immediately before the read, if any
/// * `sequence` - Cycle or round number when produced by a module
/// * `elapsed` - Time since the start of the producing module
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// UTC timestamp of the read.
    pub timestamp: DateTime<Utc>,
    /// Device that was read.
    pub device: Coordinate,
    /// Resistance in ohms.
    pub resistance: f64,
    /// Read voltage in volts.
    pub read_voltage: f64,
    /// Pulse applied before the read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulse: Option<Pulse>,
    /// Sequence marker set by modules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Time since the producing module started.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub elapsed: Option<Duration>,
}

impl MeasurementRecord {
    /// A plain read with no pulse and no sequence marker.
    pub fn read(device: Coordinate, resistance: f64, read_voltage: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            device,
            resistance,
            read_voltage,
            pulse: None,
            sequence: None,
            elapsed: None,
        }
    }

    /// Attach the pulse applied before the read.
    pub fn with_pulse(mut self, pulse: Pulse) -> Self {
        self.pulse = Some(pulse);
        self
    }

    /// Attach a sequence marker.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Attach the elapsed time since the module started.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    /// Current through the device at the read voltage, in amperes.
    pub fn current(&self) -> f64 {
        self.read_voltage / self.resistance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_from_read_voltage() {
        let record = MeasurementRecord::read(Coordinate::new(0, 0), 1_000.0, 0.5);
        assert!((record.current() - 5e-4).abs() < 1e-12);
    }

    #[test]
    fn test_plain_read_serializes_without_optional_fields() {
        let record = MeasurementRecord::read(Coordinate::new(2, 7), 10_000.0, 0.5);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["device"]["word"], 2);
        assert_eq!(json["device"]["bit"], 7);
        assert!(json.get("pulse").is_none());
        assert!(json.get("sequence").is_none());
        assert!(json.get("elapsed").is_none());
    }

    #[test]
    fn test_module_record_round_trips() {
        let record = MeasurementRecord::read(Coordinate::new(1, 1), 5_000.0, 0.2)
            .with_pulse(Pulse::new(2.5, Duration::from_micros(100)))
            .with_sequence(3)
            .with_elapsed(Duration::from_millis(1500));
        let json = serde_json::to_string(&record).unwrap();
        let back: MeasurementRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
