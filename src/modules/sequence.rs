//! Named chains of modules applied device by device.
//!
//! A [`Sequence`] runs every step on the first device, then every step on
//! the second, and so on, all on one worker. The stream carries
//! [`SequenceEvent`]s so the consumer can tell which step produced a record.

use super::engine::{Emitter, Job};
use super::{Module, ModuleConfig, ModuleDescriptor, RecordSink};
use crate::error::ArcResult;
use crate::instrument::crossbar::{Coordinate, Geometry};
use crate::instrument::session::Session;
use crate::measurement::MeasurementRecord;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Progress and output of a sequence run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SequenceEvent {
    /// The sequence began.
    SequenceStarted {
        /// Sequence name.
        name: String,
        /// Devices the sequence will visit.
        devices: Vec<Coordinate>,
    },
    /// A step began on one device.
    ModuleStarted {
        /// Module name.
        module: &'static str,
        /// Module tag.
        tag: &'static str,
        /// Device the step runs on.
        device: Coordinate,
        /// Resolved options.
        config: ModuleConfig,
    },
    /// A record produced by the current step.
    Record(MeasurementRecord),
    /// A step finished on one device.
    ModuleFinished {
        /// Module name.
        module: &'static str,
        /// Module tag.
        tag: &'static str,
        /// Device the step ran on.
        device: Coordinate,
    },
    /// Every step finished on every device.
    SequenceFinished {
        /// Sequence name.
        name: String,
    },
}

/// A named list of module steps and the devices to apply them to.
#[derive(Debug, Clone)]
pub struct Sequence {
    name: String,
    steps: Vec<(ModuleDescriptor, ModuleConfig)>,
    devices: Vec<Coordinate>,
}

impl Sequence {
    /// An empty sequence.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            devices: Vec::new(),
        }
    }

    /// Append a step. `overrides` are overlaid on the module defaults when
    /// the sequence starts.
    pub fn add_module(mut self, descriptor: ModuleDescriptor, overrides: ModuleConfig) -> Self {
        self.steps.push((descriptor, overrides));
        self
    }

    /// Append a device.
    pub fn add_device(mut self, device: Coordinate) -> Self {
        self.devices.push(device);
        self
    }

    /// Sequence name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Devices in visiting order.
    pub fn devices(&self) -> &[Coordinate] {
        &self.devices
    }

    /// Steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &(ModuleDescriptor, ModuleConfig)> {
        self.steps.iter()
    }

    /// Instantiate every step and check it against every device.
    pub(crate) fn prepare(self, geometry: Geometry) -> ArcResult<SequenceJob> {
        for device in &self.devices {
            geometry.validate(*device)?;
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for (descriptor, overrides) in &self.steps {
            let module = descriptor.instantiate();
            let config = descriptor.resolve(module.as_ref(), overrides)?;
            for device in &self.devices {
                module.validate(&config, std::slice::from_ref(device), geometry)?;
            }
            steps.push(Step {
                descriptor: *descriptor,
                module,
                config,
            });
        }

        Ok(SequenceJob {
            name: self.name,
            devices: self.devices,
            steps,
        })
    }
}

struct Step {
    descriptor: ModuleDescriptor,
    module: Box<dyn Module>,
    config: ModuleConfig,
}

pub(crate) struct SequenceJob {
    name: String,
    devices: Vec<Coordinate>,
    steps: Vec<Step>,
}

struct EventSink<'a> {
    out: &'a mut Emitter<SequenceEvent>,
}

#[async_trait]
impl RecordSink for EventSink<'_> {
    async fn emit(&mut self, record: MeasurementRecord) -> ArcResult<()> {
        self.out.send(SequenceEvent::Record(record)).await
    }

    fn should_stop(&self) -> bool {
        self.out.stopped()
    }

    async fn idle(&mut self, period: Duration) -> bool {
        self.out.pause(period).await
    }
}

#[async_trait]
impl Job<SequenceEvent> for SequenceJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, session: &mut Session, out: &mut Emitter<SequenceEvent>) -> ArcResult<()> {
        let job = *self;
        out.send(SequenceEvent::SequenceStarted {
            name: job.name.clone(),
            devices: job.devices.clone(),
        })
        .await?;

        for &device in &job.devices {
            for step in &job.steps {
                let (module, tag) = (step.descriptor.name, step.descriptor.tag);
                out.send(SequenceEvent::ModuleStarted {
                    module,
                    tag,
                    device,
                    config: step.config.clone(),
                })
                .await?;

                let mut sink = EventSink { out: &mut *out };
                step.module
                    .run(session, &[device], &step.config, &mut sink)
                    .await?;

                out.send(SequenceEvent::ModuleFinished {
                    module,
                    tag,
                    device,
                })
                .await?;
            }
        }

        out.send(SequenceEvent::SequenceFinished { name: job.name }).await
    }
}
