//! Memory-mapped storage engine
//!
//! Maintains the registry of memory maps and serves reads and writes against
//! them. Writes never hit the backing store directly: each one becomes a
//! pending record on its map, and a single timer per map (armed with the
//! map's coalescing timeout) replays the records FIFO through the
//! bit-precise writer. A later write to the same entry supersedes the
//! pending one in place — its callback observes `Cancelled`.
//!
//! Reads consult pending records across all maps first, which preserves
//! read-your-writes inside the coalescing window.

use super::super::blob::Blob;
use super::super::error::{FlowError, Result};
use super::super::scheduling::{MainLoop, TimerHandle};
use super::map::{MapEntry, MemMap, VERSION_ENTRY};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Completion callback of one write. Receives `Err(Cancelled)` when a later
/// write supersedes it, the flush status otherwise.
pub type WriteCallback = Box<dyn FnOnce(&Result<()>) + Send>;

/// Resolver for `create,i2c,…` device URLs. Out-of-tree collaborator; the
/// engine only consumes the sysfs directory it returns.
pub trait I2cResolver: Send + Sync {
    fn create(&self, rel_path: &str, dev_name: &str, dev_number: u32) -> Result<PathBuf>;
}

const DEVICE_CREATE_PREFIX: &str = "create,i2c,";
const DEVICE_POLL_TOTAL: Duration = Duration::from_secs(1);
const DEVICE_POLL_STEP: Duration = Duration::from_millis(10);

struct PendingWrite {
    entry: String,
    blob: Blob,
    callback: Option<WriteCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionState {
    Unchecked,
    Checked,
    Failed(u8),
}

struct MapSlot {
    map: MemMap,
    pending: Vec<PendingWrite>,
    timer: Option<TimerHandle>,
    version: VersionState,
}

struct StorageInner {
    main_loop: MainLoop,
    slots: Mutex<Vec<MapSlot>>,
    resolver: Mutex<Option<Box<dyn I2cResolver>>>,
}

/// Registry of memory maps plus their pending-write state.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    pub fn new(main_loop: MainLoop) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                main_loop,
                slots: Mutex::new(Vec::new()),
                resolver: Mutex::new(None),
            }),
        }
    }

    pub fn set_i2c_resolver(&self, resolver: impl I2cResolver + 'static) {
        *self.inner.resolver.lock() = Some(Box::new(resolver));
    }

    /// Validate and register `map`. Device URLs are resolved to their sysfs
    /// EEPROM path before use.
    pub fn add_map(&self, mut map: MemMap) -> Result<()> {
        map.resolve()?;
        if map.path.starts_with(DEVICE_CREATE_PREFIX) {
            map.path = self.resolve_device_path(&map.path)?;
        }
        let mut slots = self.inner.slots.lock();
        if slots.iter().any(|s| s.map.path == map.path) {
            return Err(FlowError::InvalidArgument(format!(
                "map '{}' is already registered",
                map.path
            )));
        }
        debug!(path = map.path, version = map.version, "registered memory map");
        slots.push(MapSlot {
            map,
            pending: Vec::new(),
            timer: None,
            version: VersionState::Unchecked,
        });
        Ok(())
    }

    /// Unregister the map backed by `path`, draining pending writes
    /// synchronously. Their callbacks get the flush status, not cancellation.
    pub fn remove_map(&self, path: &str) -> Result<()> {
        let slot = {
            let mut slots = self.inner.slots.lock();
            let index = slots
                .iter()
                .position(|s| s.map.path == path)
                .ok_or_else(|| FlowError::NotFound(format!("map '{}'", path)))?;
            slots.remove(index)
        };
        if let Some(timer) = &slot.timer {
            self.inner.main_loop.cancel(timer);
        }
        self.flush_records(&slot.map, slot.pending);
        Ok(())
    }

    /// Paths of all registered maps.
    pub fn map_paths(&self) -> Vec<String> {
        self.inner
            .slots
            .lock()
            .iter()
            .map(|s| s.map.path.clone())
            .collect()
    }

    pub(crate) fn remove_all(&self) -> Result<()> {
        for path in self.map_paths() {
            self.remove_map(&path)?;
        }
        Ok(())
    }

    /// Queue a write of `blob` to the entry named `name`.
    ///
    /// The write is performed when the map's coalescing timer fires. A
    /// pending write to the same entry is superseded in place: its callback
    /// runs with `Err(Cancelled)` before this call returns.
    pub fn write(&self, name: &str, blob: Blob, callback: Option<WriteCallback>) -> Result<()> {
        let mut cancelled = None;
        {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.iter_mut().find(|s| s.map.find_entry(name).is_some()) else {
                return Err(FlowError::NotFound(format!("map entry '{}'", name)));
            };
            if let Err(err) = self.ensure_version(slot) {
                return Err(err);
            }
            let record = PendingWrite {
                entry: name.to_string(),
                blob,
                callback,
            };
            if let Some(existing) = slot.pending.iter_mut().find(|p| p.entry == name) {
                let old = std::mem::replace(existing, record);
                cancelled = old.callback;
            } else {
                slot.pending.push(record);
            }
            self.arm_timer(slot);
        }
        if let Some(callback) = cancelled {
            callback(&Err(FlowError::Cancelled));
        }
        Ok(())
    }

    /// Read the entry named `name` into a fresh buffer of the entry's size.
    ///
    /// A pending write for the entry is served verbatim from its blob; the
    /// backing store is only consulted otherwise.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let mut slots = self.inner.slots.lock();

        for slot in slots.iter() {
            if let Some(record) = slot.pending.iter().find(|p| p.entry == name) {
                let entry = slot.map.find_entry(name).ok_or_else(|| {
                    FlowError::NotFound(format!("map entry '{}'", name))
                })?;
                return Ok(copy_pending(entry, &record.blob));
            }
        }

        let Some(slot) = slots.iter_mut().find(|s| s.map.find_entry(name).is_some()) else {
            return Err(FlowError::NotFound(format!("map entry '{}'", name)));
        };
        self.ensure_version(slot)?;
        // The gate may have just queued the self-initialization write; a
        // read of `_version` inside the window must see it.
        if let Some(record) = slot.pending.iter().find(|p| p.entry == name) {
            let entry = slot.map.find_entry(name).ok_or_else(|| {
                FlowError::NotFound(format!("map entry '{}'", name))
            })?;
            return Ok(copy_pending(entry, &record.blob));
        }
        let entry = slot
            .map
            .find_entry(name)
            .ok_or_else(|| FlowError::NotFound(format!("map entry '{}'", name)))?;
        match open_read(&slot.map.path)? {
            Some(file) => read_entry(&file, entry),
            None => Ok(vec![0u8; entry.size as usize]),
        }
    }

    fn arm_timer(&self, slot: &mut MapSlot) {
        if slot.timer.is_some() {
            return;
        }
        let storage = self.clone();
        let path = slot.map.path.clone();
        slot.timer = Some(
            self.inner
                .main_loop
                .after(slot.map.timeout_ms, move || storage.flush_path(&path)),
        );
    }

    /// Version gate: runs once per map on its first read or write. Blank
    /// media (0x00 or 0xFF, or a missing backing file) self-initializes by
    /// writing the declared version through the normal deferred path.
    fn ensure_version(&self, slot: &mut MapSlot) -> Result<()> {
        match slot.version {
            VersionState::Checked => Ok(()),
            VersionState::Failed(stored) => Err(FlowError::VersionMismatch {
                stored,
                declared: slot.map.version,
            }),
            VersionState::Unchecked => {
                let stored = read_version_byte(&slot.map)?;
                if stored == 0x00 || stored == 0xFF {
                    debug!(
                        path = slot.map.path,
                        version = slot.map.version,
                        "blank media, self-initializing map version"
                    );
                    slot.version = VersionState::Checked;
                    slot.pending.push(PendingWrite {
                        entry: VERSION_ENTRY.to_string(),
                        blob: Blob::from_slice(&[slot.map.version]),
                        callback: None,
                    });
                    self.arm_timer(slot);
                    Ok(())
                } else if stored == slot.map.version {
                    slot.version = VersionState::Checked;
                    Ok(())
                } else {
                    slot.version = VersionState::Failed(stored);
                    Err(FlowError::VersionMismatch {
                        stored,
                        declared: slot.map.version,
                    })
                }
            }
        }
    }

    /// Coalescing timer fired: steal the map's pending records and replay
    /// them against the backing store.
    fn flush_path(&self, path: &str) {
        let (map, records) = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.iter_mut().find(|s| s.map.path == path) else {
                return;
            };
            slot.timer = None;
            (slot.map.clone(), std::mem::take(&mut slot.pending))
        };
        self.flush_records(&map, records);
    }

    fn flush_records(&self, map: &MemMap, records: Vec<PendingWrite>) {
        if records.is_empty() {
            return;
        }
        debug!(path = map.path, count = records.len(), "flushing pending writes");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&map.path);
        match file {
            Ok(file) => {
                for record in records {
                    let status = match map.find_entry(&record.entry) {
                        Some(entry) => write_entry(&file, entry, &record.blob),
                        None => Err(FlowError::NotFound(format!(
                            "map entry '{}'",
                            record.entry
                        ))),
                    };
                    if let Err(err) = &status {
                        warn!(
                            path = map.path,
                            entry = record.entry,
                            error = %err,
                            "pending write failed"
                        );
                    }
                    if let Some(callback) = record.callback {
                        callback(&status);
                    }
                }
            }
            Err(err) => {
                warn!(
                    path = map.path,
                    error = %err,
                    "cannot open backing store, failing pending writes"
                );
                let kind = err.kind();
                for record in records {
                    if let Some(callback) = record.callback {
                        let status = Err(FlowError::Io(std::io::Error::new(
                            kind,
                            "backing store open failed",
                        )));
                        callback(&status);
                    }
                }
            }
        }
    }

    /// `create,i2c,<sysfs-rel-path>,<dev-number>,<dev-name>`: hand the
    /// device fields to the resolver, then wait for the EEPROM node to
    /// appear under the returned sysfs directory.
    fn resolve_device_path(&self, url: &str) -> Result<String> {
        let fields: Vec<&str> = url.split(',').collect();
        if fields.len() != 5 {
            return Err(FlowError::InvalidArgument(format!(
                "malformed device URL '{}'",
                url
            )));
        }
        let dev_number: u32 = fields[3].parse().map_err(|_| {
            FlowError::InvalidArgument(format!("bad device number '{}'", fields[3]))
        })?;
        let resolver = self.inner.resolver.lock();
        let Some(resolver) = resolver.as_ref() else {
            return Err(FlowError::NotSupported(
                "no I2C device resolver installed".into(),
            ));
        };
        let sysfs = resolver.create(fields[2], fields[4], dev_number)?;
        let eeprom = sysfs.join("eeprom");
        let deadline = Instant::now() + DEVICE_POLL_TOTAL;
        while !eeprom.exists() {
            if Instant::now() >= deadline {
                return Err(FlowError::NotFound(format!(
                    "EEPROM node '{}' did not appear",
                    eeprom.display()
                )));
            }
            std::thread::sleep(DEVICE_POLL_STEP);
        }
        Ok(eeprom.to_string_lossy().into_owned())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.inner.slots.lock();
        f.debug_struct("Storage").field("maps", &slots.len()).finish()
    }
}

fn open_read(path: &str) -> Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn read_version_byte(map: &MemMap) -> Result<u8> {
    let entry = map
        .find_entry(VERSION_ENTRY)
        .ok_or_else(|| FlowError::InvalidArgument("map lacks a _version entry".into()))?;
    match open_read(&map.path)? {
        Some(file) => {
            let window = read_window(&file, entry.offset, 1)?;
            Ok(window[0])
        }
        None => Ok(0),
    }
}

/// Read `size` bytes at `offset`, zero-filling past end-of-file.
fn read_window(file: &File, offset: u64, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut pos = 0;
    while pos < size {
        let n = file.read_at(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    Ok(buf)
}

fn assemble_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (i * 8)))
}

fn spread_le(value: u64, out: &mut [u8]) {
    for (i, byte) in out.iter_mut().take(8).enumerate() {
        *byte = (value >> (i * 8)) as u8;
    }
}

/// Bit-precise read: mask the little-endian accumulator and shift the value
/// down to bit 0 of the output. Trivial-mask entries are copied verbatim.
fn read_entry(file: &File, entry: &MapEntry) -> Result<Vec<u8>> {
    let size = entry.size as usize;
    let raw = read_window(file, entry.offset, size)?;
    match entry.mask() {
        Some(mask) => {
            let acc = assemble_le(&raw);
            let value = (acc & mask) >> entry.bit_offset;
            let mut out = vec![0u8; size];
            spread_le(value, &mut out);
            Ok(out)
        }
        None => Ok(raw),
    }
}

/// Bit-precise read-modify-write. Bits outside the entry's window are
/// preserved; oversized blobs are truncated with a warning.
fn write_entry(file: &File, entry: &MapEntry, blob: &Blob) -> Result<()> {
    let size = entry.size as usize;
    if blob.len() > size {
        warn!(
            entry = entry.name,
            blob_len = blob.len(),
            size,
            "write larger than entry, truncating"
        );
    }
    match entry.mask() {
        Some(mask) => {
            let old = read_window(file, entry.offset, size)?;
            let old_acc = assemble_le(&old);
            let value = assemble_le(blob.as_slice());
            let new_acc = (old_acc & !mask) | ((value << entry.bit_offset) & mask);
            let mut out = vec![0u8; size];
            spread_le(new_acc, &mut out);
            file.write_all_at(&out, entry.offset)?;
        }
        None => {
            let n = size.min(blob.len());
            file.write_all_at(&blob.as_slice()[..n], entry.offset)?;
        }
    }
    Ok(())
}

fn copy_pending(entry: &MapEntry, blob: &Blob) -> Vec<u8> {
    let size = entry.size as usize;
    let mut out = vec![0u8; size];
    let n = size.min(blob.len());
    out[..n].copy_from_slice(&blob.as_slice()[..n]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_and_spread_round_trip() {
        let bytes = [0x78, 0x56, 0x34, 0x12];
        let value = assemble_le(&bytes);
        assert_eq!(value, 0x1234_5678);
        let mut out = [0u8; 4];
        spread_le(value, &mut out);
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_masked_write_preserves_outside_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        std::fs::write(&path, [0xA5]).unwrap();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        // Window is bits [2, 5): write value 0b101 into it.
        let entry = MapEntry::new("field", 1).at_offset(0).with_bits(2, 3);
        write_entry(&file, &entry, &Blob::from_slice(&[0b101])).unwrap();

        let stored = std::fs::read(&path).unwrap()[0];
        // 0xA5 = 0b1010_0101; bits [2,5) replaced with 101 -> 0b1011_0101.
        assert_eq!(stored, 0b1011_0101);

        let got = read_entry(&file, &entry).unwrap();
        assert_eq!(got, vec![0b101]);
    }

    #[test]
    fn test_trivial_write_truncates_to_entry_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        let entry = MapEntry::new("pair", 2).at_offset(1);
        write_entry(&file, &entry, &Blob::from_slice(&[0x11, 0x22, 0x33])).unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[1..3], &[0x11, 0x22]);
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn test_read_window_zero_fills_short_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [0x42]).unwrap();
        let file = File::open(&path).unwrap();
        let window = read_window(&file, 0, 4).unwrap();
        assert_eq!(window, vec![0x42, 0, 0, 0]);
    }

    #[test]
    fn test_wide_entry_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.bin");
        let payload: Vec<u8> = (0u8..12).collect();
        std::fs::write(&path, &payload).unwrap();
        let file = File::open(&path).unwrap();
        // bit fields on a >8-byte entry are forced trivial
        let entry = MapEntry::new("wide", 12).at_offset(0).with_bits(3, 5);
        assert_eq!(read_entry(&file, &entry).unwrap(), payload);
    }
}
