//! Board configuration and settings loading.
//!
//! [`BoardConfig`] is the set of parameters uploaded to the board when a
//! session starts. It is validated against the board limits before any
//! command frame is built.
//!
//! [`Settings`] is the file/env layer used by the CLI. It is loaded with
//! Figment from (in order of precedence):
//!
//! 1. Environment variables prefixed with `ARC1_` (nested keys separated by
//!    `__`, e.g. `ARC1_BOARD__READ_VOLTAGE=0.2`)
//! 2. A TOML file (default: `arc1.toml`)
//! 3. Built-in defaults
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyACM0"
//! baud_rate = 921600
//! timeout = "7s"
//!
//! [board]
//! words = 32
//! bits = 32
//! read_mode = "tia4p"
//! read_voltage = 0.5
//!
//! [logging]
//! level = "info"
//! ```

use crate::error::ArcResult;
use crate::protocol::limits::{self, MAX_BITS, MAX_READ_CYCLES, MAX_WORDS};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Amplifier configuration used for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Voltage divider.
    Classic,
    /// Transimpedance amplifier.
    Tia,
    /// Four-point transimpedance, positive read voltage.
    Tia4p,
    /// Four-point transimpedance, negative read voltage.
    Tia4pNeg,
}

impl ReadMode {
    /// Numeric code sent to the board.
    pub fn wire_code(self) -> u32 {
        match self {
            ReadMode::Classic => 0,
            ReadMode::Tia => 1,
            ReadMode::Tia4p => 2,
            ReadMode::Tia4pNeg => 3,
        }
    }

    /// The mode to use for a given read voltage.
    ///
    /// Four-point reads have a dedicated mode for negative voltages; other
    /// modes are unaffected by the sign.
    pub fn for_voltage(self, volts: f64) -> Self {
        match self {
            ReadMode::Tia4p if volts < 0.0 => ReadMode::Tia4pNeg,
            ReadMode::Tia4pNeg if volts > 0.0 => ReadMode::Tia4p,
            other => other,
        }
    }
}

/// Where the board routes its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// On-board crossbar.
    Local,
    /// External BNC connections.
    ExternalBnc,
    /// BNC routed to the local array.
    BncToLocal,
    /// No device connected.
    Offline,
}

impl SessionType {
    /// Numeric code sent to the board.
    pub fn wire_code(self) -> u32 {
        match self {
            SessionType::Local => 0,
            SessionType::ExternalBnc => 1,
            SessionType::BncToLocal => 2,
            SessionType::Offline => 3,
        }
    }
}

/// Bias applied to unselected lines to limit sneak-path currents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SneakPathLimit {
    /// Unselected lines at V/3.
    OneThird,
    /// Unselected lines at V/2.
    OneHalf,
    /// Unselected lines floating.
    Float,
}

impl SneakPathLimit {
    /// Numeric code sent to the board.
    pub fn wire_code(self) -> u32 {
        match self {
            SneakPathLimit::OneThird => 0,
            SneakPathLimit::OneHalf => 1,
            SneakPathLimit::Float => 2,
        }
    }
}

/// Session configuration uploaded to the board on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Number of averaged read cycles per read.
    pub read_cycles: u32,
    /// Active word-lines.
    pub words: u32,
    /// Active bit-lines.
    pub bits: u32,
    /// Amplifier mode for reads.
    pub read_mode: ReadMode,
    /// Output routing.
    pub session_type: SessionType,
    /// Sneak-path biasing scheme.
    pub sneak_path: SneakPathLimit,
    /// Read voltage in volts.
    pub read_voltage: f64,
    /// Pause after raw writes to the board.
    #[serde(with = "humantime_serde")]
    pub write_delay: Duration,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            read_cycles: 30,
            words: 32,
            bits: 32,
            read_mode: ReadMode::Tia4p,
            session_type: SessionType::Local,
            sneak_path: SneakPathLimit::OneThird,
            read_voltage: 0.5,
            write_delay: Duration::from_millis(1),
        }
    }
}

impl BoardConfig {
    /// Config for a smaller array, other fields at their defaults.
    pub fn with_size(words: u32, bits: u32) -> Self {
        Self {
            words,
            bits,
            ..Default::default()
        }
    }

    /// Check every value against the board's accepted ranges.
    pub fn validate(&self) -> ArcResult<()> {
        limits::check_count("read cycles", self.read_cycles, MAX_READ_CYCLES)?;
        limits::check_count("words", self.words, MAX_WORDS)?;
        limits::check_count("bits", self.bits, MAX_BITS)?;
        limits::check_voltage("read voltage", self.read_voltage)?;
        Ok(())
    }

    /// Apply the read-mode/voltage sign rule and validate.
    pub fn normalized(mut self) -> ArcResult<Self> {
        self.validate()?;
        self.read_mode = self.read_mode.for_voltage(self.read_voltage);
        Ok(self)
    }
}

/// Serial link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyACM0` or `COM3`.
    pub port: String,
    /// Line speed.
    pub baud_rate: u32,
    /// Bound on every round-trip.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Reset the microcontroller before the handshake.
    pub reset_on_connect: bool,
    /// Time the board needs to come back from a reset.
    #[serde(with = "humantime_serde")]
    pub reset_delay: Duration,
    /// Pause after the handshake before the first command.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 921_600,
            timeout: Duration::from_secs(7),
            reset_on_connect: true,
            reset_delay: Duration::from_secs(2),
            settle_delay: Duration::ZERO,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Level filter (trace, debug, info, warn, error).
    pub level: String,
    /// Output format (pretty, compact, json).
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial link.
    pub serial: SerialSettings,
    /// Board session configuration.
    pub board: BoardConfig,
    /// Logging.
    pub logging: LoggingSettings,
}

impl Settings {
    /// Default settings file name.
    pub const DEFAULT_PATH: &'static str = "arc1.toml";

    /// Load from `arc1.toml` in the working directory plus environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::DEFAULT_PATH)
    }

    /// Load from a specific file plus environment. A missing file is not an
    /// error; defaults and environment still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ARC1_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.board
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "baud rate must be positive".to_string(),
            ));
        }
        if self.serial.timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "serial timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
