//! Memory-map layouts
//!
//! A `MemMap` describes a versioned address layout over one backing store:
//! named entries with byte offsets, sizes and optional bit windows. Layouts
//! are plain serde values, so hosts can load them from JSON documents.
//!
//! Offsets resolve at registration: an entry declaring offset 0 inherits the
//! cursor at its predecessor's end. The reserved `_version` entry (offset 0,
//! size 1) is prepended when a layout does not declare it.

use super::super::error::{FlowError, Result};
use serde::{Deserialize, Serialize};

/// Reserved entry carrying the map version.
pub const VERSION_ENTRY: &str = "_version";

fn default_timeout_ms() -> u64 {
    5000
}

/// Named region of a memory map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapEntry {
    pub name: String,
    /// Byte offset; 0 inherits the running cursor at resolution time.
    #[serde(default)]
    pub offset: u64,
    /// Window size in bytes.
    pub size: u64,
    /// First bit of the sub-window within the first byte, 0-7.
    #[serde(default)]
    pub bit_offset: u8,
    /// Sub-window width in bits; 0 means the whole window.
    #[serde(default)]
    pub bit_size: u32,
}

impl MapEntry {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            offset: 0,
            size,
            bit_offset: 0,
            bit_size: 0,
        }
    }

    pub fn at_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_bits(mut self, bit_offset: u8, bit_size: u32) -> Self {
        self.bit_offset = bit_offset;
        self.bit_size = bit_size;
        self
    }

    /// Entries wider than 8 bytes, or covering their whole window, carry a
    /// trivial mask and are copied verbatim.
    pub(crate) fn is_trivial_mask(&self) -> bool {
        self.size > 8
            || self.bit_size == 0
            || (self.bit_offset == 0 && u64::from(self.bit_size) == self.size * 8)
    }

    /// Bit mask over the little-endian accumulator of this entry's window,
    /// or `None` when trivial.
    pub(crate) fn mask(&self) -> Option<u64> {
        if self.is_trivial_mask() {
            return None;
        }
        let ones = if self.bit_size >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bit_size) - 1
        };
        Some(ones << self.bit_offset)
    }

    fn occupied_bits(&self) -> (u64, u64) {
        let base = self.offset * 8;
        if self.is_trivial_mask() {
            (base, base + self.size * 8)
        } else {
            let start = base + u64::from(self.bit_offset);
            (start, start + u64::from(self.bit_size))
        }
    }
}

/// Versioned address layout over one backing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemMap {
    /// Declared layout version, 1-254. 0x00 and 0xFF are blank-media
    /// sentinels on disk and can never be declared.
    pub version: u8,
    /// Backing-store path, or a `create,i2c,…` device URL resolved at
    /// registration.
    pub path: String,
    /// Write-coalescing window.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub entries: Vec<MapEntry>,
}

impl MemMap {
    pub fn new(version: u8, path: impl Into<String>) -> Self {
        Self {
            version,
            path: path.into(),
            timeout_ms: default_timeout_ms(),
            entries: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn entry(mut self, entry: MapEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| FlowError::InvalidArgument(format!("bad map layout: {}", err)))
    }

    pub fn find_entry(&self, name: &str) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Validate the layout and resolve inherited offsets. Called once at
    /// registration; the map is immutable afterwards.
    pub(crate) fn resolve(&mut self) -> Result<()> {
        if self.version == 0x00 || self.version == 0xFF {
            return Err(FlowError::InvalidArgument(format!(
                "map version must be in [1, 254], got {:#04x}",
                self.version
            )));
        }
        if self.find_entry(VERSION_ENTRY).is_none() {
            self.entries.insert(0, MapEntry::new(VERSION_ENTRY, 1));
        }

        let mut cursor = 0u64;
        for entry in &mut self.entries {
            if entry.size == 0 {
                return Err(FlowError::InvalidArgument(format!(
                    "entry '{}' has zero size",
                    entry.name
                )));
            }
            if entry.bit_offset >= 8 {
                return Err(FlowError::InvalidArgument(format!(
                    "entry '{}' bit offset {} out of range",
                    entry.name, entry.bit_offset
                )));
            }
            if u64::from(entry.bit_size) > entry.size * 8 {
                return Err(FlowError::InvalidArgument(format!(
                    "entry '{}' bit size {} exceeds its {}-byte window",
                    entry.name, entry.bit_size, entry.size
                )));
            }
            if entry.size <= 8
                && entry.bit_size > 0
                && u64::from(entry.bit_offset) + u64::from(entry.bit_size) > entry.size * 8
            {
                return Err(FlowError::InvalidArgument(format!(
                    "entry '{}' bit window spills past its {}-byte window",
                    entry.name, entry.size
                )));
            }
            if entry.offset == 0 {
                entry.offset = cursor;
            }
            cursor = entry.offset + entry.size;
        }

        for (idx, entry) in self.entries.iter().enumerate() {
            if self.entries[..idx].iter().any(|e| e.name == entry.name) {
                return Err(FlowError::InvalidArgument(format!(
                    "duplicate entry name '{}'",
                    entry.name
                )));
            }
        }

        let mut ranges: Vec<(u64, u64, &str)> = self
            .entries
            .iter()
            .map(|e| {
                let (start, end) = e.occupied_bits();
                (start, end, e.name.as_str())
            })
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(FlowError::InvalidArgument(format!(
                    "entries '{}' and '{}' overlap",
                    pair[0].2, pair[1].2
                )));
            }
        }
        Ok(())
    }
}
