//! Built-in read modules.
//!
//! - [`ReadAll`] (`RA`): sweep the crossbar word-major
//! - [`ReadMasked`] (`RM`): read an explicit device list in order
//! - [`Retention`] (`RET`): read a device list repeatedly at a fixed step

use super::{boxed, parse_config, Module, ModuleConfig, ModuleDescriptor, RecordSink};
use crate::error::{ArcError, ArcResult};
use crate::instrument::crossbar::{Coordinate, Geometry};
use crate::instrument::session::Session;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Read every device of the crossbar, or of its top-left `words` x `bits`
/// corner when those options are set. The device list is ignored.
#[derive(Debug, Default)]
pub struct ReadAll;

#[derive(Debug, Deserialize)]
struct ReadAllConfig {
    words: Option<u32>,
    bits: Option<u32>,
}

impl ReadAll {
    /// Registry entry.
    pub const DESCRIPTOR: ModuleDescriptor = ModuleDescriptor::new(
        "ReadAll",
        "RA",
        "Read all devices from the crossbar",
        boxed::<ReadAll>,
    );

    fn sweep(config: &ModuleConfig, geometry: Geometry) -> ArcResult<Geometry> {
        let config: ReadAllConfig = parse_config(config)?;
        let words = config.words.unwrap_or(geometry.words());
        let bits = config.bits.unwrap_or(geometry.bits());
        if words == 0 || bits == 0 || words > geometry.words() || bits > geometry.bits() {
            return Err(ArcError::invalid(format!(
                "sweep of {}x{} does not fit the {}x{} crossbar",
                words,
                bits,
                geometry.words(),
                geometry.bits()
            )));
        }
        Ok(Geometry::new(words, bits))
    }
}

#[async_trait]
impl Module for ReadAll {
    fn default_config(&self) -> ModuleConfig {
        let mut config = ModuleConfig::new();
        config.insert("words".into(), Value::Null);
        config.insert("bits".into(), Value::Null);
        config
    }

    fn validate(&self, config: &ModuleConfig, _devices: &[Coordinate], geometry: Geometry) -> ArcResult<()> {
        Self::sweep(config, geometry).map(|_| ())
    }

    async fn run(
        &self,
        session: &mut Session,
        _devices: &[Coordinate],
        config: &ModuleConfig,
        sink: &mut dyn RecordSink,
    ) -> ArcResult<()> {
        let sweep = Self::sweep(config, session.geometry())?;
        debug!(words = sweep.words(), bits = sweep.bits(), "read all");
        for device in sweep.iter_row_major() {
            if sink.should_stop() {
                break;
            }
            let record = session.read_one(device).await?;
            sink.emit(record).await?;
        }
        Ok(())
    }
}

/// Read the given devices once each, in order.
#[derive(Debug, Default)]
pub struct ReadMasked;

impl ReadMasked {
    /// Registry entry.
    pub const DESCRIPTOR: ModuleDescriptor = ModuleDescriptor::new(
        "ReadMasked",
        "RM",
        "Sequentially read a series of crosspoints",
        boxed::<ReadMasked>,
    );
}

#[async_trait]
impl Module for ReadMasked {
    fn default_config(&self) -> ModuleConfig {
        ModuleConfig::new()
    }

    async fn run(
        &self,
        session: &mut Session,
        devices: &[Coordinate],
        _config: &ModuleConfig,
        sink: &mut dyn RecordSink,
    ) -> ArcResult<()> {
        for &device in devices {
            if sink.should_stop() {
                break;
            }
            let record = session.read_one(device).await?;
            sink.emit(record).await?;
        }
        Ok(())
    }
}

/// Read the given devices every `step` seconds for `duration` seconds.
///
/// Runs `floor(duration / step)` rounds. Records carry the round number as
/// their sequence marker and the time since the module started.
#[derive(Debug, Default)]
pub struct Retention;

#[derive(Debug, Deserialize)]
struct RetentionConfig {
    step: f64,
    duration: f64,
}

impl RetentionConfig {
    fn rounds(&self) -> u64 {
        (self.duration / self.step).floor() as u64
    }
}

#[derive(Debug)]
struct RetentionPlan {
    step: Duration,
    rounds: u64,
}

impl Retention {
    /// Registry entry.
    pub const DESCRIPTOR: ModuleDescriptor = ModuleDescriptor::new(
        "Retention",
        "RET",
        "Read devices continuously",
        boxed::<Retention>,
    );

    /// Options for [`Retention`].
    pub fn options(step: Duration, duration: Duration) -> ModuleConfig {
        super::options(json!({
            "step": step.as_secs_f64(),
            "duration": duration.as_secs_f64(),
        }))
    }

    fn parse(config: &ModuleConfig) -> ArcResult<RetentionPlan> {
        let config: RetentionConfig = parse_config(config)?;
        let step = Duration::try_from_secs_f64(config.step)
            .ok()
            .filter(|step| !step.is_zero())
            .ok_or_else(|| {
                ArcError::invalid(format!("retention step {} s out of range", config.step))
            })?;
        Duration::try_from_secs_f64(config.duration).map_err(|_| {
            ArcError::invalid(format!("retention duration {} s out of range", config.duration))
        })?;
        Ok(RetentionPlan {
            step,
            rounds: config.rounds(),
        })
    }
}

#[async_trait]
impl Module for Retention {
    fn default_config(&self) -> ModuleConfig {
        super::options(json!({ "step": 1.0, "duration": 60.0 }))
    }

    fn validate(&self, config: &ModuleConfig, devices: &[Coordinate], _geometry: Geometry) -> ArcResult<()> {
        if devices.is_empty() {
            return Err(ArcError::invalid("retention needs at least one device"));
        }
        Self::parse(config).map(|_| ())
    }

    async fn run(
        &self,
        session: &mut Session,
        devices: &[Coordinate],
        config: &ModuleConfig,
        sink: &mut dyn RecordSink,
    ) -> ArcResult<()> {
        let RetentionPlan { step, rounds } = Self::parse(config)?;
        let started = Instant::now();

        for round in 0..rounds {
            for &device in devices {
                if sink.should_stop() {
                    return Ok(());
                }
                let record = session
                    .read_one(device)
                    .await?
                    .with_sequence(round)
                    .with_elapsed(started.elapsed());
                sink.emit(record).await?;
            }
            if round + 1 < rounds && !sink.idle(step).await {
                break;
            }
        }
        Ok(())
    }
}
