//! CLI entry point for the ArC1 driver.
//!
//! Every record is printed to stdout as one JSON object per line; logs go to
//! stderr.
//!
//! ```bash
//! arc1 --port /dev/ttyACM0 status
//! arc1 read 2 7
//! arc1 pulse-read 2 7 --amplitude 2.5 --width-us 100
//! arc1 --mock read-all
//! arc1 retention 0,0 1,3 --step 1 --duration 60
//! ```

use anyhow::{Context, Result};
use arc1::config::Settings;
use arc1::logging::init_tracing;
use arc1::modules::ModuleRegistry;
use arc1::{ConnectOptions, Controller, Coordinate, MeasurementRecord, MockBoard, ModuleRun};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "arc1")]
#[command(about = "Drive an ArC1 crossbar characterisation board", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, default_value = Settings::DEFAULT_PATH)]
    config: PathBuf,

    /// Serial port, overrides the settings file
    #[arg(long)]
    port: Option<String>,

    /// Talk to a simulated board instead of a serial port
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query the firmware version
    Status,

    /// Read one device
    Read {
        /// Word-line (0-based)
        word: u32,
        /// Bit-line (0-based)
        bit: u32,
    },

    /// Pulse then read one device
    PulseRead {
        /// Word-line (0-based)
        word: u32,
        /// Bit-line (0-based)
        bit: u32,
        /// Pulse amplitude in volts
        #[arg(long, allow_hyphen_values = true)]
        amplitude: f64,
        /// Pulse width in microseconds
        #[arg(long, default_value = "100")]
        width_us: f64,
    },

    /// Read every device of the crossbar
    ReadAll,

    /// Read devices repeatedly
    Retention {
        /// Devices as `word,bit`
        #[arg(required = true, value_parser = parse_device)]
        devices: Vec<Coordinate>,
        /// Seconds between rounds
        #[arg(long, default_value = "1")]
        step: f64,
        /// Total seconds
        #[arg(long, default_value = "60")]
        duration: f64,
    },

    /// List the built-in modules
    Modules,
}

fn parse_device(s: &str) -> Result<Coordinate, String> {
    let (word, bit) = s
        .split_once(',')
        .ok_or_else(|| format!("expected `word,bit`, got `{}`", s))?;
    let word = word.trim().parse().map_err(|e| format!("bad word `{}`: {}", word, e))?;
    let bit = bit.trim().parse().map_err(|e| format!("bad bit `{}`: {}", bit, e))?;
    Ok(Coordinate::new(word, bit))
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {}: {}", what, value))
}

fn print_record(record: &MeasurementRecord) -> Result<()> {
    println!("{}", serde_json::to_string(record)?);
    Ok(())
}

async fn drain(mut run: ModuleRun<MeasurementRecord>) -> Result<usize> {
    let mut count = 0;
    while let Some(record) = run.next().await {
        print_record(&record?)?;
        count += 1;
    }
    Ok(count)
}

async fn connect(cli: &Cli, settings: &Settings) -> Result<Controller> {
    if cli.mock {
        let (transport, _board) = MockBoard::spawn();
        let options = ConnectOptions::from_settings(&settings.serial).with_reset_delay(Duration::ZERO);
        return Ok(Controller::connect_with(transport, settings.board.clone(), options).await?);
    }

    #[cfg(feature = "serial")]
    {
        Controller::open(settings)
            .await
            .with_context(|| format!("connecting to {}", settings.serial.port))
    }

    #[cfg(not(feature = "serial"))]
    {
        anyhow::bail!("built without serial support; use --mock")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    if let Some(port) = &cli.port {
        settings.serial.port = port.clone();
    }
    init_tracing(&settings.logging);

    if let Commands::Modules = cli.command {
        for module in ModuleRegistry::with_builtins().iter() {
            println!("{:<4} {:<12} {}", module.tag, module.name, module.description);
        }
        return Ok(());
    }

    let arc = connect(&cli, &settings).await?;

    let outcome = match &cli.command {
        Commands::Status => {
            let version = arc.status().await?;
            println!("{}", serde_json::json!({ "firmware": version.to_string() }));
            Ok(())
        }
        Commands::Read { word, bit } => print_record(&arc.read_one(*word, *bit).await?),
        Commands::PulseRead {
            word,
            bit,
            amplitude,
            width_us,
        } => {
            let width = seconds(width_us * 1e-6, "pulse width")?;
            print_record(&arc.pulseread_one(*word, *bit, *amplitude, width).await?)
        }
        Commands::ReadAll => {
            let count = drain(arc.read_all().await?).await?;
            info!(count, "sweep complete");
            Ok(())
        }
        Commands::Retention {
            devices,
            step,
            duration,
        } => {
            let step = seconds(*step, "step")?;
            let duration = seconds(*duration, "duration")?;
            let count = drain(arc.retention(devices.clone(), step, duration).await?).await?;
            info!(count, "retention complete");
            Ok(())
        }
        Commands::Modules => Ok(()),
    };

    if let Err(e) = arc.disconnect().await {
        warn!(error = %e, "disconnect failed");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(parse_device("2,7").unwrap(), Coordinate::new(2, 7));
        assert_eq!(parse_device(" 0 , 31 ").unwrap(), Coordinate::new(0, 31));
        assert!(parse_device("2;7").is_err());
        assert!(parse_device("a,1").is_err());
    }

    #[test]
    fn test_cli_parses_retention() {
        let cli = Cli::try_parse_from(["arc1", "--mock", "retention", "0,0", "1,3", "--step", "0.5"])
            .unwrap();
        assert!(cli.mock);
        match cli.command {
            Commands::Retention { devices, step, duration } => {
                assert_eq!(devices, vec![Coordinate::new(0, 0), Coordinate::new(1, 3)]);
                assert_eq!(step, 0.5);
                assert_eq!(duration, 60.0);
            }
            _ => panic!("expected retention"),
        }
    }
}
