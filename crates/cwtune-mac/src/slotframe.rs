//! Slotframe: the repeating schedule used once the fleet runs TDMA.
//!
//! Loaded from a small CSV file:
//!
//! ```text
//! # slot,channel_offset,kind,node
//! slot,channel_offset,kind,node
//! 0,0,beacon,
//! 1,0,tx,2
//! 2,0,rx,1
//! 3,0,shared,
//! ```
//!
//! Blank lines and `#` comments are ignored. The header line is optional.

use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, Result};

/// What a node does in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SlotKind {
    Tx,
    Rx,
    Shared,
    Beacon,
}

impl std::str::FromStr for SlotKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tx" => Ok(Self::Tx),
            "rx" => Ok(Self::Rx),
            "shared" => Ok(Self::Shared),
            "beacon" => Ok(Self::Beacon),
            other => Err(format!("unknown slot kind '{}'", other)),
        }
    }
}

/// One cell of the schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Slot {
    pub slot: u16,
    pub channel_offset: u8,
    pub kind: SlotKind,
    /// Node the slot is reserved for, if any.
    pub owner: Option<String>,
}

/// An ordered slotframe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Slotframe {
    slots: Vec<Slot>,
}

impl Slotframe {
    /// Build a slotframe, sorting by slot number and rejecting duplicates.
    pub fn new(mut slots: Vec<Slot>) -> Result<Self> {
        slots.sort_by_key(|s| s.slot);
        if let Some(pair) = slots.windows(2).find(|w| w[0].slot == w[1].slot) {
            return Err(Error::Slotframe {
                line: 0,
                reason: format!("slot {} defined twice", pair[0].slot),
            });
        }
        Ok(Self { slots })
    }

    /// Read and parse a slotframe file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse slotframe CSV text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut slots = Vec::new();
        let mut seen = HashSet::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with("slot") {
                continue;
            }

            let slot = parse_line(line).map_err(|reason| Error::Slotframe {
                line: line_no,
                reason,
            })?;
            if !seen.insert(slot.slot) {
                return Err(Error::Slotframe {
                    line: line_no,
                    reason: format!("slot {} defined twice", slot.slot),
                });
            }
            slots.push(slot);
        }

        slots.sort_by_key(|s| s.slot);
        Ok(Self { slots })
    }

    /// Slots in schedule order.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Number of slots in the frame.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn parse_line(line: &str) -> std::result::Result<Slot, String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 3 || fields.len() > 4 {
        return Err(format!("expected 3 or 4 fields, got {}", fields.len()));
    }

    let slot = fields[0]
        .parse()
        .map_err(|e| format!("bad slot number '{}': {}", fields[0], e))?;
    let channel_offset = fields[1]
        .parse()
        .map_err(|e| format!("bad channel offset '{}': {}", fields[1], e))?;
    let kind = fields[2].parse()?;
    let owner = fields
        .get(3)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    Ok(Slot {
        slot,
        channel_offset,
        kind,
        owner,
    })
}
