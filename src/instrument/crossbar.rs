//! Crossbar addressing model.
//!
//! A device is addressed by a 0-based `(word, bit)` pair. [`Geometry`] holds
//! the extents configured for the session and validates coordinates without
//! any I/O. [`SelectionState`] records which crosspoint the board currently
//! has latched; only the session mutates it.

use crate::error::{ArcError, ArcResult};
use crate::protocol::Command;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 0-based word-line/bit-line pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coordinate {
    /// Word-line.
    pub word: u32,
    /// Bit-line.
    pub bit: u32,
}

impl Coordinate {
    /// Build a coordinate.
    pub const fn new(word: u32, bit: u32) -> Self {
        Self { word, bit }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.word, self.bit)
    }
}

impl From<(u32, u32)> for Coordinate {
    fn from((word, bit): (u32, u32)) -> Self {
        Self::new(word, bit)
    }
}

/// Extents of the active crossbar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    words: u32,
    bits: u32,
}

impl Geometry {
    /// Geometry with `words` word-lines and `bits` bit-lines.
    pub const fn new(words: u32, bits: u32) -> Self {
        Self { words, bits }
    }

    /// Word-lines.
    pub fn words(&self) -> u32 {
        self.words
    }

    /// Bit-lines.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Total number of devices.
    pub fn len(&self) -> usize {
        self.words as usize * self.bits as usize
    }

    /// True for a degenerate 0-line geometry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that the coordinate lies within the array.
    pub fn validate(&self, device: Coordinate) -> ArcResult<()> {
        if device.word >= self.words || device.bit >= self.bits {
            return Err(ArcError::Address {
                word: device.word,
                bit: device.bit,
                words: self.words,
                bits: self.bits,
            });
        }
        Ok(())
    }

    /// The select command that latches `device`.
    pub fn selection_command(&self, device: Coordinate) -> ArcResult<Command> {
        self.validate(device)?;
        Ok(Command::Select(device))
    }

    /// Every device, word-major then bit.
    pub fn iter_row_major(&self) -> impl Iterator<Item = Coordinate> + Send + 'static {
        let bits = self.bits;
        (0..self.words).flat_map(move |word| (0..bits).map(move |bit| Coordinate::new(word, bit)))
    }
}

/// The crosspoint latched on the board, if any.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectionState {
    latched: Option<Coordinate>,
}

impl SelectionState {
    /// Currently latched device.
    pub fn current(&self) -> Option<Coordinate> {
        self.latched
    }

    /// True when `device` is the latched crosspoint.
    pub fn is_selected(&self, device: Coordinate) -> bool {
        self.latched == Some(device)
    }

    /// The latched device, for operations on the active device.
    pub fn active(&self) -> ArcResult<Coordinate> {
        self.latched.ok_or(ArcError::NoDeviceSelected)
    }

    pub(crate) fn latch(&mut self, device: Coordinate) {
        self.latched = Some(device);
    }

    pub(crate) fn clear(&mut self) {
        self.latched = None;
    }
}
