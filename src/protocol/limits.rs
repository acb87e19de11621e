//! Accepted parameter ranges of the ArC1 board.

use crate::error::{ArcError, ArcResult};
use crate::measurement::Pulse;
use std::time::Duration;

/// Word-lines wired on the board.
pub const MAX_WORDS: u32 = 32;
/// Bit-lines wired on the board.
pub const MAX_BITS: u32 = 32;
/// Largest number of averaged read cycles.
pub const MAX_READ_CYCLES: u32 = 1000;
/// Largest magnitude for read and pulse voltages, in volts.
pub const MAX_VOLTAGE: f64 = 12.0;
/// Shortest pulse the board produces.
pub const MIN_PULSE_WIDTH: Duration = Duration::from_micros(1);
/// Longest pulse the board produces.
pub const MAX_PULSE_WIDTH: Duration = Duration::from_secs(1);

/// Check a read or pulse voltage.
pub fn check_voltage(what: &str, volts: f64) -> ArcResult<()> {
    if !volts.is_finite() || volts.abs() > MAX_VOLTAGE {
        return Err(ArcError::invalid(format!(
            "{} {} V out of bounds (-{} V ..= {} V)",
            what, volts, MAX_VOLTAGE, MAX_VOLTAGE
        )));
    }
    Ok(())
}

/// Check amplitude and width of a programming pulse.
pub fn check_pulse(pulse: &Pulse) -> ArcResult<()> {
    check_voltage("pulse amplitude", pulse.amplitude)?;
    if pulse.width < MIN_PULSE_WIDTH || pulse.width > MAX_PULSE_WIDTH {
        return Err(ArcError::invalid(format!(
            "pulse width {:?} out of bounds ({:?} ..= {:?})",
            pulse.width, MIN_PULSE_WIDTH, MAX_PULSE_WIDTH
        )));
    }
    Ok(())
}

/// Check a 1-based count against an inclusive maximum.
pub fn check_count(what: &str, value: u32, max: u32) -> ArcResult<()> {
    if value == 0 || value > max {
        return Err(ArcError::invalid(format!(
            "{} must be within 1 ..= {}, got {}",
            what, max, value
        )));
    }
    Ok(())
}
