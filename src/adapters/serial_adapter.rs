//! Serial port transport.
//!
//! The ArC1 enumerates as a USB CDC serial device and expects 8 data bits,
//! even parity and one stop bit.

use super::Transport;
use crate::config::SerialSettings;
use crate::error::{ArcError, ArcResult};
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

/// Open the serial port described by `settings`.
pub fn open_serial(settings: &SerialSettings) -> ArcResult<Transport> {
    let port = tokio_serial::new(&settings.port, settings.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::Even)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| {
            ArcError::Connection(format!(
                "Failed to open serial port '{}' at {} baud: {}",
                settings.port, settings.baud_rate, e
            ))
        })?;

    info!(port = %settings.port, baud = settings.baud_rate, "serial port opened");
    Ok(Transport::new(port, settings.port.clone()).with_timeout(settings.timeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_port_is_connection_error() {
        let settings = SerialSettings {
            port: "/dev/arc1-does-not-exist".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            open_serial(&settings),
            Err(ArcError::Connection(_))
        ));
    }
}
