//! An open connection to one board.
//!
//! [`Session`] owns the transport, the wire format, the applied
//! [`BoardConfig`] and the [`SelectionState`]. Every method takes `&mut self`,
//! so command/response pairs are strictly sequential and a compound
//! operation (select, pulse, read) can never be interleaved with another.
//!
//! Sequencing policy:
//!
//! - `read_one` and `pulseread_one` select the target first unless it is
//!   already latched; re-selecting the latched device sends nothing.
//! - `pulse_active` never selects; it fails with `NoDeviceSelected` when
//!   nothing is latched.
//! - The selection is updated only after the board acknowledges a select.
//!   Any failure leaves it as it was.

use crate::adapters::Transport;
use crate::config::{BoardConfig, SerialSettings};
use crate::error::{ArcError, ArcResult, ProtocolFault};
use crate::instrument::crossbar::{Coordinate, Geometry, SelectionState};
use crate::measurement::{MeasurementRecord, Pulse};
use crate::protocol::{limits, Command, FirmwareVersion, FrameV1, Response, ResponseKind, WireFormat};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How to bring up a session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Bound on each transport read or write.
    pub timeout: Duration,
    /// Reset the microcontroller before uploading the configuration.
    pub reset_on_connect: bool,
    /// Time the board needs to come back from a reset.
    pub reset_delay: Duration,
    /// Pause after the handshake.
    pub settle_delay: Duration,
    /// Byte-level layout spoken by the firmware.
    pub wire: Arc<dyn WireFormat>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: crate::adapters::DEFAULT_TIMEOUT,
            reset_on_connect: true,
            reset_delay: Duration::from_secs(2),
            settle_delay: Duration::ZERO,
            wire: Arc::new(FrameV1),
        }
    }
}

impl ConnectOptions {
    /// Options taken from the `[serial]` settings section.
    pub fn from_settings(settings: &SerialSettings) -> Self {
        Self {
            timeout: settings.timeout,
            reset_on_connect: settings.reset_on_connect,
            reset_delay: settings.reset_delay,
            settle_delay: settings.settle_delay,
            ..Default::default()
        }
    }

    /// Set the transport timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the post-reset delay.
    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// Use a different wire revision.
    pub fn with_wire(mut self, wire: Arc<dyn WireFormat>) -> Self {
        self.wire = wire;
        self
    }
}

/// Exclusive handle on a connected board.
#[derive(Debug)]
pub struct Session {
    transport: Transport,
    wire: Arc<dyn WireFormat>,
    config: BoardConfig,
    geometry: Geometry,
    selection: SelectionState,
    reset_delay: Duration,
}

impl Session {
    /// Apply `config` to the board on the other end of `transport` and
    /// verify it answers a status query.
    pub(crate) async fn open(
        mut transport: Transport,
        config: BoardConfig,
        options: ConnectOptions,
    ) -> ArcResult<Self> {
        let config = config.normalized()?;
        transport.set_timeout(options.timeout);

        let mut session = Session {
            transport,
            wire: options.wire,
            geometry: Geometry::new(config.words, config.bits),
            config,
            selection: SelectionState::default(),
            reset_delay: options.reset_delay,
        };

        let handshake = |e: ArcError| {
            ArcError::Connection(format!("handshake with the board failed: {}", e))
        };

        if options.reset_on_connect {
            session.reset().await.map_err(handshake)?;
        }
        let init = Command::Init(session.config.clone());
        session.expect_ack(&init).await.map_err(handshake)?;
        let version = session.status().await.map_err(handshake)?;

        if !options.settle_delay.is_zero() {
            tokio::time::sleep(options.settle_delay).await;
        }

        info!(
            port = session.transport.label(),
            firmware = %version,
            wire = session.wire.revision(),
            words = session.geometry.words(),
            bits = session.geometry.bits(),
            "connected to ArC1"
        );
        Ok(session)
    }

    /// Configuration applied to the board.
    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Extents of the active crossbar.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Crosspoint currently latched.
    pub fn selection(&self) -> SelectionState {
        self.selection
    }

    /// Wire revision in use.
    pub fn revision(&self) -> &'static str {
        self.wire.revision()
    }

    /// Send one command and wait for its response.
    pub async fn round_trip(&mut self, command: &Command) -> ArcResult<Response> {
        let bytes = self.wire.encode(command)?;
        debug!(command = command.name(), len = bytes.len(), "send");
        self.transport
            .write_frame(&bytes)
            .await
            .map_err(|e| e.into_arc(command.name()))?;

        if command.expected_response() == ResponseKind::None {
            return Ok(Response::Ack);
        }

        let result = self.receive(command).await;
        if let Err(ArcError::Protocol { fault, raw, .. }) = &result {
            warn!(command = command.name(), %fault, received = raw.len(), "bad response");
            self.transport.drain().await;
        }
        result
    }

    async fn receive(&mut self, command: &Command) -> ArcResult<Response> {
        let name = command.name();
        let header = self
            .transport
            .read_exact(self.wire.header_len())
            .await
            .map_err(|e| e.into_arc(name))?;
        let remaining = self.wire.remaining_len(command, &header)?;
        let tail = self
            .transport
            .read_exact(remaining)
            .await
            .map_err(|e| e.after_prefix(&header).into_arc(name))?;

        let frame = [header, tail].concat();
        let response = self.wire.decode(command, &frame)?;
        debug!(command = name, ?response, "receive");
        Ok(response)
    }

    async fn expect_ack(&mut self, command: &Command) -> ArcResult<()> {
        match self.round_trip(command).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(command, other)),
        }
    }

    async fn expect_value(&mut self, command: &Command) -> ArcResult<f64> {
        match self.round_trip(command).await? {
            Response::Value(ohms) => Ok(ohms),
            other => Err(unexpected(command, other)),
        }
    }

    /// Latch `device`.
    pub async fn select(&mut self, device: Coordinate) -> ArcResult<()> {
        let command = self.geometry.selection_command(device)?;
        self.expect_ack(&command).await?;
        self.selection.latch(device);
        debug!(%device, "selected");
        Ok(())
    }

    async fn ensure_selected(&mut self, device: Coordinate) -> ArcResult<()> {
        if self.selection.is_selected(device) {
            return Ok(());
        }
        self.select(device).await
    }

    /// Open the latched crosspoint.
    pub async fn deselect(&mut self) -> ArcResult<()> {
        self.expect_ack(&Command::Deselect).await?;
        self.selection.clear();
        Ok(())
    }

    /// Select `device` if needed, then read it.
    pub async fn read_one(&mut self, device: Coordinate) -> ArcResult<MeasurementRecord> {
        self.geometry.validate(device)?;
        self.ensure_selected(device).await?;
        let ohms = self.expect_value(&Command::Read(device)).await?;
        Ok(MeasurementRecord::read(device, ohms, self.config.read_voltage))
    }

    /// Pulse whatever is latched.
    pub async fn pulse_active(&mut self, pulse: Pulse) -> ArcResult<()> {
        limits::check_pulse(&pulse)?;
        let device = self.selection.active()?;
        self.expect_ack(&Command::PulseActive(pulse)).await?;
        debug!(%device, amplitude = pulse.amplitude, width = ?pulse.width, "pulsed");
        Ok(())
    }

    /// Select `device` if needed, pulse it, then read it.
    pub async fn pulseread_one(
        &mut self,
        device: Coordinate,
        pulse: Pulse,
    ) -> ArcResult<MeasurementRecord> {
        self.geometry.validate(device)?;
        limits::check_pulse(&pulse)?;
        self.ensure_selected(device).await?;
        let ohms = self.expect_value(&Command::PulseRead(device, pulse)).await?;
        Ok(MeasurementRecord::read(device, ohms, self.config.read_voltage).with_pulse(pulse))
    }

    /// Change the read voltage. The four-point read mode follows the sign
    /// of the voltage.
    pub async fn set_read_voltage(&mut self, volts: f64) -> ArcResult<()> {
        limits::check_voltage("read voltage", volts)?;
        let read_mode = self.config.read_mode.for_voltage(volts);
        self.expect_ack(&Command::Configure {
            read_mode,
            read_voltage: volts,
        })
        .await?;
        self.config.read_voltage = volts;
        self.config.read_mode = read_mode;
        info!(volts, ?read_mode, "read voltage updated");
        Ok(())
    }

    /// Query the firmware version.
    pub async fn status(&mut self) -> ArcResult<FirmwareVersion> {
        match self.round_trip(&Command::Status).await? {
            Response::Status(version) => Ok(version),
            other => Err(unexpected(&Command::Status, other)),
        }
    }

    /// Force a microcontroller reset and wait for the board to come back.
    pub async fn reset(&mut self) -> ArcResult<()> {
        self.round_trip(&Command::Reset).await?;
        self.selection.clear();
        tokio::time::sleep(self.config.write_delay + self.reset_delay).await;
        self.transport.drain().await;
        Ok(())
    }

    pub(crate) async fn close(self) -> ArcResult<()> {
        self.transport
            .close()
            .await
            .map_err(|e| e.into_arc("close"))
    }
}

fn unexpected(command: &Command, response: Response) -> ArcError {
    debug!(command = command.name(), ?response, "unexpected response");
    ArcError::protocol(
        command.name(),
        ProtocolFault::Malformed("unexpected response type"),
        Vec::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Fault, MockBoard};

    fn fast() -> ConnectOptions {
        ConnectOptions::default()
            .with_reset_delay(Duration::ZERO)
            .with_timeout(Duration::from_millis(200))
    }

    async fn open(words: u32, bits: u32) -> (Session, crate::adapters::MockHandle) {
        let (transport, board) = MockBoard::spawn();
        let session = Session::open(transport, BoardConfig::with_size(words, bits), fast())
            .await
            .unwrap();
        (session, board)
    }

    #[tokio::test]
    async fn test_open_uploads_configuration() {
        let (session, board) = open(8, 8).await;
        assert_eq!(session.geometry(), Geometry::new(8, 8));
        assert_eq!(board.count("00"), 1);
        assert_eq!(board.count("0"), 1);
        assert_eq!(board.count("05"), 1);
        assert_eq!(session.revision(), "arc1-v1");
    }

    #[tokio::test]
    async fn test_open_fails_when_board_is_silent() {
        let (transport, board) = MockBoard::spawn();
        board.inject(Fault::Silence);
        let err = Session::open(transport, BoardConfig::with_size(8, 8), fast())
            .await
            .unwrap_err();
        assert!(matches!(err, ArcError::Connection(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_sends_nothing() {
        let (transport, board) = MockBoard::spawn();
        let config = BoardConfig {
            read_voltage: 20.0,
            ..Default::default()
        };
        let err = Session::open(transport, config, fast()).await.unwrap_err();
        assert!(matches!(err, ArcError::InvalidConfiguration(_)));
        tokio::task::yield_now().await;
        assert_eq!(board.bytes_received(), 0);
    }

    #[tokio::test]
    async fn test_pulseread_selects_once() {
        let (mut session, board) = open(8, 8).await;
        let device = Coordinate::new(3, 4);
        let pulse = Pulse::new(2.0, Duration::from_micros(50));

        let first = session.pulseread_one(device, pulse).await.unwrap();
        let second = session.pulseread_one(device, pulse).await.unwrap();
        assert_eq!(board.count("02"), 1);
        assert_eq!(board.count("3"), 2);
        assert_eq!(first.pulse, Some(pulse));
        assert!(second.resistance < first.resistance);
    }

    #[tokio::test]
    async fn test_set_read_voltage_updates_config_on_ack() {
        let (mut session, board) = open(8, 8).await;
        session.set_read_voltage(-0.2).await.unwrap();
        assert_eq!(session.config().read_voltage, -0.2);
        assert_eq!(session.config().read_mode, crate::config::ReadMode::Tia4pNeg);
        assert_eq!(board.read_voltage(), -0.2);

        board.inject(Fault::CorruptChecksum);
        assert!(session.set_read_voltage(0.3).await.is_err());
        assert_eq!(session.config().read_voltage, -0.2);
    }

    #[tokio::test]
    async fn test_bad_sync_does_not_poison_next_command() {
        let (mut session, board) = open(8, 8).await;
        board.inject(Fault::BadSync);
        let err = session.status().await.unwrap_err();
        assert!(matches!(
            err,
            ArcError::Protocol {
                fault: ProtocolFault::BadSync(0x55),
                ..
            }
        ));
        assert_eq!(session.status().await.unwrap(), MockBoard::FIRMWARE);
    }

    #[tokio::test]
    async fn test_truncated_frame_reports_partial_bytes() {
        let (mut session, board) = open(8, 8).await;
        session.select(Coordinate::new(0, 0)).await.unwrap();
        board.inject(Fault::Truncate);
        match session.read_one(Coordinate::new(0, 0)).await {
            Err(ArcError::Protocol { fault, raw, .. }) => {
                assert!(matches!(fault, ProtocolFault::Timeout(_)));
                assert_eq!(raw.len(), 4);
                assert_eq!(raw[0], 0xAA);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_clears_selection() {
        let (mut session, _board) = open(8, 8).await;
        session.select(Coordinate::new(1, 1)).await.unwrap();
        session.reset().await.unwrap();
        assert_eq!(session.selection().current(), None);
    }
}
