//! The caller-facing device controller.
//!
//! A [`Controller`] owns one [`Session`] behind an async mutex plus the
//! [`AccessGate`] that marks it busy while a module run holds the session.
//!
//! ```text
//! Disconnected ──connect──▶ Idle ◀──▶ Selected
//!                            │  ▲
//!                 run_module │  │ run ends / cancelled / dropped
//!                            ▼  │
//!                           Busy
//! ```
//!
//! Single-shot operations check the gate before and after taking the
//! session lock and fail fast with `ControllerBusy` instead of queueing
//! behind a run.

use crate::adapters::Transport;
use crate::config::BoardConfig;
use crate::error::{ArcError, ArcResult};
use crate::instrument::crossbar::{Coordinate, Geometry};
use crate::instrument::session::{ConnectOptions, Session};
use crate::measurement::{MeasurementRecord, Pulse};
use crate::modules::engine::{self, AccessGate, Emitter, Job, RunTicket};
use crate::modules::{
    Module, ModuleConfig, ModuleDescriptor, ModuleRegistry, ModuleRun, ReadAll, ReadMasked,
    Retention, Sequence, SequenceEvent,
};
use crate::protocol::FirmwareVersion;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

/// Device-access state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No session.
    Disconnected,
    /// Connected, nothing latched.
    Idle,
    /// Connected, this crosspoint latched.
    Selected(Coordinate),
    /// A module run holds the session.
    Busy {
        /// Id of the run.
        run: u64,
    },
}

/// Stateful handle on one ArC1 board.
pub struct Controller {
    session: Arc<Mutex<Option<Session>>>,
    gate: Arc<AccessGate>,
    registry: ModuleRegistry,
    geometry: Geometry,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("geometry", &self.geometry)
            .field("active_run", &self.gate.active_run())
            .finish()
    }
}

struct ModuleJob {
    descriptor: ModuleDescriptor,
    module: Box<dyn Module>,
    devices: Vec<Coordinate>,
    config: ModuleConfig,
}

#[async_trait]
impl Job<MeasurementRecord> for ModuleJob {
    fn name(&self) -> &str {
        self.descriptor.name
    }

    async fn run(
        self: Box<Self>,
        session: &mut Session,
        out: &mut Emitter<MeasurementRecord>,
    ) -> ArcResult<()> {
        self.module
            .run(session, &self.devices, &self.config, out)
            .await
    }
}

impl Controller {
    /// Connect with default [`ConnectOptions`].
    pub async fn connect(transport: Transport, config: BoardConfig) -> ArcResult<Self> {
        Self::connect_with(transport, config, ConnectOptions::default()).await
    }

    /// Reset the board, upload `config` and verify the board answers.
    pub async fn connect_with(
        transport: Transport,
        config: BoardConfig,
        options: ConnectOptions,
    ) -> ArcResult<Self> {
        let session = Session::open(transport, config, options).await?;
        let geometry = session.geometry();
        Ok(Self {
            session: Arc::new(Mutex::new(Some(session))),
            gate: AccessGate::new(),
            registry: ModuleRegistry::with_builtins(),
            geometry,
        })
    }

    /// Open the serial port from `settings` and connect.
    #[cfg(feature = "serial")]
    pub async fn open(settings: &crate::config::Settings) -> ArcResult<Self> {
        let transport = crate::adapters::open_serial(&settings.serial)?;
        let options = ConnectOptions::from_settings(&settings.serial);
        Self::connect_with(transport, settings.board.clone(), options).await
    }

    /// Modules runnable by tag.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Make a module runnable by tag.
    pub fn register_module(&mut self, descriptor: ModuleDescriptor) {
        self.registry.register(descriptor);
    }

    /// Extents of the crossbar.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// True while a module run holds the session.
    pub fn is_busy(&self) -> bool {
        self.gate.active_run().is_some()
    }

    /// Current device-access state.
    pub async fn state(&self) -> ControllerState {
        if let Some(run) = self.gate.active_run() {
            return ControllerState::Busy { run };
        }
        match self.session.lock().await.as_ref() {
            None => ControllerState::Disconnected,
            Some(session) => match session.selection().current() {
                Some(device) => ControllerState::Selected(device),
                None => ControllerState::Idle,
            },
        }
    }

    /// Configuration currently applied to the board.
    pub async fn config(&self) -> ArcResult<BoardConfig> {
        let mut guard = self.exclusive().await?;
        Ok(session(&mut guard)?.config().clone())
    }

    async fn exclusive(&self) -> ArcResult<OwnedMutexGuard<Option<Session>>> {
        self.gate.check()?;
        let guard = self.session.clone().lock_owned().await;
        self.gate.check()?;
        Ok(guard)
    }

    /// Latch `(word, bit)`.
    pub async fn select(&self, word: u32, bit: u32) -> ArcResult<()> {
        let mut guard = self.exclusive().await?;
        session(&mut guard)?.select(Coordinate::new(word, bit)).await
    }

    /// Open the latched crosspoint.
    pub async fn deselect(&self) -> ArcResult<()> {
        let mut guard = self.exclusive().await?;
        session(&mut guard)?.deselect().await
    }

    /// Read `(word, bit)`, selecting it first if it is not latched.
    pub async fn read_one(&self, word: u32, bit: u32) -> ArcResult<MeasurementRecord> {
        let mut guard = self.exclusive().await?;
        session(&mut guard)?.read_one(Coordinate::new(word, bit)).await
    }

    /// Pulse the latched device. Never selects.
    pub async fn pulse_active(&self, amplitude: f64, width: Duration) -> ArcResult<()> {
        let mut guard = self.exclusive().await?;
        session(&mut guard)?
            .pulse_active(Pulse::new(amplitude, width))
            .await
    }

    /// Select `(word, bit)` if needed, pulse it and read it, with nothing in
    /// between.
    pub async fn pulseread_one(
        &self,
        word: u32,
        bit: u32,
        amplitude: f64,
        width: Duration,
    ) -> ArcResult<MeasurementRecord> {
        let mut guard = self.exclusive().await?;
        session(&mut guard)?
            .pulseread_one(Coordinate::new(word, bit), Pulse::new(amplitude, width))
            .await
    }

    /// Change the read voltage.
    pub async fn set_read_voltage(&self, volts: f64) -> ArcResult<()> {
        let mut guard = self.exclusive().await?;
        session(&mut guard)?.set_read_voltage(volts).await
    }

    /// Query the firmware version.
    pub async fn status(&self) -> ArcResult<FirmwareVersion> {
        let mut guard = self.exclusive().await?;
        session(&mut guard)?.status().await
    }

    /// Force a microcontroller reset.
    pub async fn reset(&self) -> ArcResult<()> {
        let mut guard = self.exclusive().await?;
        session(&mut guard)?.reset().await
    }

    /// Close the transport. Later operations fail with `NotConnected`.
    pub async fn disconnect(&self) -> ArcResult<()> {
        let mut guard = self.exclusive().await?;
        let session = guard.take().ok_or(ArcError::NotConnected)?;
        info!("disconnecting");
        session.close().await
    }

    /// Sweep every device word-major.
    pub async fn read_all(&self) -> ArcResult<ModuleRun<MeasurementRecord>> {
        self.run_module(&ReadAll::DESCRIPTOR, Vec::new(), ModuleConfig::new())
            .await
    }

    /// Read `devices` once each, in order.
    pub async fn read_masked(
        &self,
        devices: Vec<Coordinate>,
    ) -> ArcResult<ModuleRun<MeasurementRecord>> {
        self.run_module(&ReadMasked::DESCRIPTOR, devices, ModuleConfig::new())
            .await
    }

    /// Read `devices` every `step` for `duration`.
    pub async fn retention(
        &self,
        devices: Vec<Coordinate>,
        step: Duration,
        duration: Duration,
    ) -> ArcResult<ModuleRun<MeasurementRecord>> {
        self.run_module(
            &Retention::DESCRIPTOR,
            devices,
            Retention::options(step, duration),
        )
        .await
    }

    /// Run a registered module by tag.
    pub async fn run_tagged(
        &self,
        tag: &str,
        devices: Vec<Coordinate>,
        overrides: ModuleConfig,
    ) -> ArcResult<ModuleRun<MeasurementRecord>> {
        let descriptor = self.registry.get(tag)?;
        self.run_module(&descriptor, devices, overrides).await
    }

    /// Instantiate the module, mark the controller busy and start it on a
    /// worker. Configuration and devices are validated before the worker
    /// starts; on error the controller stays idle.
    pub async fn run_module(
        &self,
        descriptor: &ModuleDescriptor,
        devices: Vec<Coordinate>,
        overrides: ModuleConfig,
    ) -> ArcResult<ModuleRun<MeasurementRecord>> {
        let module = descriptor.instantiate();
        let config = descriptor.resolve(module.as_ref(), &overrides)?;
        let (guard, ticket) = self.claim().await?;

        let prepared = guard
            .as_ref()
            .ok_or(ArcError::NotConnected)
            .and_then(|session| {
                let geometry = session.geometry();
                for device in &devices {
                    geometry.validate(*device)?;
                }
                module.validate(&config, &devices, geometry)
            });
        if let Err(e) = prepared {
            ticket.release();
            return Err(e);
        }

        info!(
            module = descriptor.name,
            tag = descriptor.tag,
            devices = devices.len(),
            "starting module"
        );
        let job = ModuleJob {
            descriptor: *descriptor,
            module,
            devices,
            config,
        };
        Ok(engine::spawn(Box::new(job), guard, ticket))
    }

    /// Run every step of `sequence` on every device.
    pub async fn run_sequence(&self, sequence: Sequence) -> ArcResult<ModuleRun<SequenceEvent>> {
        let (guard, ticket) = self.claim().await?;

        let prepared = match guard.as_ref() {
            Some(session) => sequence.prepare(session.geometry()),
            None => Err(ArcError::NotConnected),
        };
        let job = match prepared {
            Ok(job) => job,
            Err(e) => {
                ticket.release();
                return Err(e);
            }
        };

        info!(sequence = job.name(), "starting sequence");
        Ok(engine::spawn(Box::new(job), guard, ticket))
    }

    async fn claim(&self) -> ArcResult<(OwnedMutexGuard<Option<Session>>, RunTicket)> {
        let ticket = self.gate.try_acquire()?;
        let guard = self.session.clone().lock_owned().await;
        Ok((guard, ticket))
    }
}

fn session(guard: &mut OwnedMutexGuard<Option<Session>>) -> ArcResult<&mut Session> {
    guard.as_mut().ok_or(ArcError::NotConnected)
}
