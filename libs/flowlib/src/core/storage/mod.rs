//! Memory-mapped persistence: versioned layouts, coalesced bit-precise writes.

pub mod engine;
pub mod map;

pub use engine::{I2cResolver, Storage, WriteCallback};
pub use map::{MapEntry, MemMap, VERSION_ENTRY};
