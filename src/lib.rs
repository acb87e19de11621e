//! Host-side driver for the ArC1 memristor crossbar characterisation board.
//!
//! The crate is layered leaf-first:
//!
//! - [`adapters`]: byte transports (serial port, simulated board)
//! - [`protocol`]: the command codec and board limits
//! - [`instrument`]: crossbar addressing, the board session and the
//!   [`Controller`] callers interact with
//! - [`modules`]: the module contract and the engine that runs modules on a
//!   worker and streams their records
//!
//! ```rust,no_run
//! use arc1::{BoardConfig, Controller, MockBoard};
//! use futures::TryStreamExt;
//!
//! # async fn example() -> arc1::ArcResult<()> {
//! let (transport, _board) = MockBoard::spawn();
//! let arc = Controller::connect(transport, BoardConfig::with_size(8, 8)).await?;
//!
//! let record = arc.read_one(2, 7).await?;
//! println!("R(2, 7) = {} ohm", record.resistance);
//!
//! let sweep: Vec<_> = arc.read_all().await?.try_collect().await?;
//! assert_eq!(sweep.len(), 64);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod modules;
pub mod protocol;

pub use adapters::{MockBoard, Transport};
pub use config::{BoardConfig, Settings};
pub use error::{ArcError, ArcResult};
pub use instrument::{ConnectOptions, Controller, ControllerState, Coordinate};
pub use measurement::{MeasurementRecord, Pulse};
pub use modules::{Module, ModuleConfig, ModuleDescriptor, ModuleRun, RecordSink, Sequence};
