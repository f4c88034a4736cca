//! Byte layout of the population table
//!
//! ```text
//! offset 0              header (8 bytes)
//!   0..4   resource_count  i32 LE
//!   4      event_flag      u8 (0 | 1)
//!   5..8   padding         zero
//! offset 8 + i * 8      slot i (8 bytes)
//!   0      kind            u8 (0 empty, 1 prey, 2 predator)
//!   1..4   padding         zero
//!   4..8   energy          i32 LE
//! ```
//!
//! Every multi-byte field is little-endian and word aligned. The size depends
//! on the population limit only and never changes during a run.

use crate::species::Species;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const HEADER_SIZE: usize = 8;
pub const SLOT_SIZE: usize = 8;

const RESOURCE_OFFSET: usize = 0;
const EVENT_FLAG_OFFSET: usize = 4;
const KIND_OFFSET: usize = 0;
pub(crate) const ENERGY_OFFSET: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("unknown slot kind byte {code} in slot {slot}")]
    UnknownKind { slot: SlotId, code: u8 },
    #[error("slot {slot} outside population limit {limit}")]
    OutOfRange { slot: SlotId, limit: usize },
    #[error("invalid event flag byte {0}")]
    InvalidFlag(u8),
}

/// Index of a population slot; identical to the allocator id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const fn table_size(population_limit: usize) -> usize {
    HEADER_SIZE + population_limit * SLOT_SIZE
}

pub const fn slot_offset(slot: SlotId) -> usize {
    HEADER_SIZE + slot.0 * SLOT_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub resource_count: i32,
    pub event_flag: bool,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[RESOURCE_OFFSET..RESOURCE_OFFSET + 4]
            .copy_from_slice(&self.resource_count.to_le_bytes());
        bytes[EVENT_FLAG_OFFSET] = u8::from(self.event_flag);
        bytes
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, LayoutError> {
        let event_flag = match bytes[EVENT_FLAG_OFFSET] {
            0 => false,
            1 => true,
            other => return Err(LayoutError::InvalidFlag(other)),
        };
        Ok(Self {
            resource_count: read_i32(bytes, RESOURCE_OFFSET),
            event_flag,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotKind {
    #[default]
    Empty,
    Occupied(Species),
}

impl SlotKind {
    pub fn code(&self) -> u8 {
        match self {
            SlotKind::Empty => 0,
            SlotKind::Occupied(species) => species.code(),
        }
    }

    pub fn species(&self) -> Option<Species> {
        match self {
            SlotKind::Empty => None,
            SlotKind::Occupied(species) => Some(*species),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotRecord {
    pub kind: SlotKind,
    pub energy: i32,
}

impl SlotRecord {
    pub const EMPTY: SlotRecord = SlotRecord {
        kind: SlotKind::Empty,
        energy: 0,
    };

    pub fn occupied(species: Species, energy: i32) -> Self {
        Self {
            kind: SlotKind::Occupied(species),
            energy,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == SlotKind::Empty
    }

    /// Living entry of the given species (the listing filter).
    pub fn is_alive_as(&self, species: Species) -> bool {
        self.kind == SlotKind::Occupied(species) && self.energy > 0
    }

    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut bytes = [0u8; SLOT_SIZE];
        bytes[KIND_OFFSET] = self.kind.code();
        bytes[ENERGY_OFFSET..ENERGY_OFFSET + 4].copy_from_slice(&self.energy.to_le_bytes());
        bytes
    }

    pub fn decode(slot: SlotId, bytes: &[u8; SLOT_SIZE]) -> Result<Self, LayoutError> {
        let kind = match bytes[KIND_OFFSET] {
            0 => SlotKind::Empty,
            code => SlotKind::Occupied(
                Species::from_code(code).ok_or(LayoutError::UnknownKind { slot, code })?,
            ),
        };
        Ok(Self {
            kind,
            energy: read_i32(bytes, ENERGY_OFFSET),
        })
    }
}

pub(crate) fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(word)
}
