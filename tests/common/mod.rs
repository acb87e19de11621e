//! Shared helpers for integration tests.

#![allow(dead_code)]

use arc1::adapters::MockHandle;
use arc1::{BoardConfig, ConnectOptions, Controller, MockBoard};
use std::time::Duration;

/// Options tuned for the simulated board: no reset wait, short timeout.
pub fn fast_options() -> ConnectOptions {
    ConnectOptions::default()
        .with_reset_delay(Duration::ZERO)
        .with_timeout(Duration::from_millis(200))
}

/// Connect a controller for a `words` x `bits` crossbar to a fresh mock board.
pub async fn connect(words: u32, bits: u32) -> (Controller, MockHandle) {
    let (transport, board) = MockBoard::spawn();
    let controller = Controller::connect_with(transport, BoardConfig::with_size(words, bits), fast_options())
        .await
        .expect("Failed to connect to mock board");
    (controller, board)
}
