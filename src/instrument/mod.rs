//! Crossbar addressing, the board session and the caller-facing controller.

pub mod controller;
pub mod crossbar;
pub mod session;

pub use controller::{Controller, ControllerState};
pub use crossbar::{Coordinate, Geometry, SelectionState};
pub use session::{ConnectOptions, Session};
