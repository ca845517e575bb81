use std::path::Path;

use log::{debug, info};
use thiserror::Error;

use mapfile::{MapFile, Region};

/// Growth increment for the backing file. One chunk tracks 524288 slots.
const CHUNK_BYTES: u64 = 65536;

/// Suffix appended to the logical index path on disk.
const IDX_SUFFIX: &str = ".idx";

/// Set-bit counts for every nibble value. The popcount of a byte is two
/// table lookups, one per nibble.
const NIBBLE_BITS: [u8; 16] = [0, 1, 1, 2, 1, 2, 2, 3, 1, 2, 2, 3, 2, 3, 3, 4];

fn popcount(b: u8) -> usize {
    (NIBBLE_BITS[(b >> 4) as usize] + NIBBLE_BITS[(b & 0x0F) as usize]) as usize
}

fn count_used(bytes: &[u8]) -> usize {
    bytes.iter().map(|&b| popcount(b)).sum()
}

#[derive(Error, Debug)]
pub enum IdxError {
    #[error("slot {0} is already reserved")]
    AlreadyReserved(usize),
    #[error("slot {0} is already free")]
    AlreadyFree(usize),
    #[error("index storage failure")]
    Storage(#[from] std::io::Error),
}

/// A persistent map of slot occupancy, one bit per slot, backed by a
/// memory-mapped file.
///
/// Slots are small non-negative integers handed out lowest-first and
/// reclaimable in any order; a record store can use them as stable row
/// identifiers. The on-disk format is the raw bitmap bytes and nothing
/// else: no header, no length field. The file's own length is the
/// capacity, always a whole multiple of one growth chunk, and it only
/// ever grows.
///
/// Bit `k` lives in byte `k / 8` at position `k % 8`, least significant
/// bit first. A cached count of reserved slots is kept in step with every
/// mutation, so occupancy queries never rescan the map.
///
/// The index owns its mapping exclusively and performs no locking of its
/// own. One writer at a time; share it behind a mutex if several threads
/// need it.
pub struct SlotIndex {
    map: Region,
    store: MapFile,
    used: usize,
}

impl SlotIndex {
    /// Opens the index whose backing file is `path` plus a fixed `.idx`
    /// suffix, creating it with one chunk of capacity if it does not
    /// exist, and derives the reserved-slot count with a single scan.
    ///
    /// # Errors
    ///
    /// Any failure from the backing file layer is surfaced as
    /// [`IdxError::Storage`] and leaves nothing to clean up. There is no
    /// retry at this layer.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SlotIndex, IdxError> {
        let mut file_name = path.as_ref().as_os_str().to_os_string();
        file_name.push(IDX_SUFFIX);

        let mut store = MapFile::open(&file_name)?;
        if store.is_empty() {
            store.grow(CHUNK_BYTES)?;
        }

        let map = store.map()?;
        let used = count_used(&map);
        info!(
            "Opened slot index {:?} with {} of {} slots reserved.",
            store.path(),
            used,
            map.len() * 8
        );

        Ok(SlotIndex { map, store, used })
    }

    /// Returns whether `slot` is reserved. Panics if `slot` lies beyond
    /// the current capacity; callers only ever pass slots this index
    /// issued.
    pub fn contains(&self, slot: usize) -> bool {
        self.map[slot / 8] & (1 << (slot % 8)) != 0
    }

    /// Finds the lowest free slot without reserving it, growing the
    /// backing file first if the map has no room left. `Ok(None)` means
    /// the map is full, which growth makes unreachable in normal
    /// operation.
    pub fn next_free(&mut self) -> Result<Option<usize>, IdxError> {
        self.grow_if_full()?;
        for (i, &byte) in self.map.iter().enumerate() {
            // A fully reserved byte costs one comparison, not eight.
            if popcount(byte) < 8 {
                for j in 0..8 {
                    if byte & (1 << j) == 0 {
                        return Ok(Some(i * 8 + j));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Reserves and returns the lowest free slot. This is the normal
    /// allocation entry point; [`SlotIndex::next_free`] alone is
    /// read-only discovery.
    pub fn acquire(&mut self) -> Result<Option<usize>, IdxError> {
        let slot = match self.next_free()? {
            Some(slot) => slot,
            None => return Ok(None),
        };
        self.set_unchecked(slot);
        debug!("Acquired slot {}.", slot);
        Ok(Some(slot))
    }

    /// Reserves `slot` directly, e.g. when replaying state from another
    /// store. Fails without touching the map or the count if the slot is
    /// already reserved.
    pub fn reserve(&mut self, slot: usize) -> Result<(), IdxError> {
        if self.contains(slot) {
            return Err(IdxError::AlreadyReserved(slot));
        }
        self.set_unchecked(slot);
        Ok(())
    }

    /// Frees a reserved slot so it can be issued again. Fails without
    /// touching the map or the count if the slot is already free.
    pub fn release(&mut self, slot: usize) -> Result<(), IdxError> {
        if !self.contains(slot) {
            return Err(IdxError::AlreadyFree(slot));
        }
        self.clear_unchecked(slot);
        Ok(())
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of reserved slots, recomputed by scanning the whole map.
    /// Verification counterpart of [`SlotIndex::used`]; the cached count
    /// is the fast path.
    pub fn recount(&self) -> usize {
        count_used(&self.map)
    }

    /// Total slots the current backing file can track.
    pub fn capacity(&self) -> usize {
        self.map.len() * 8
    }

    /// Every reserved slot, in ascending order. Scans the full map
    /// unconditionally.
    pub fn slots(&self) -> Vec<usize> {
        let mut all = Vec::with_capacity(self.used);
        for (i, &byte) in self.map.iter().enumerate() {
            for j in 0..8 {
                if byte & (1 << j) != 0 {
                    all.push(i * 8 + j);
                }
            }
        }
        all
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Forces all bitmap writes so far to durable storage.
    pub fn sync(&self) -> Result<(), IdxError> {
        self.map.sync()?;
        Ok(())
    }

    /// Flushes, unmaps, and closes the backing file, in that order.
    /// Consumes the index; reopen from the same path to continue.
    pub fn close(self) -> Result<(), IdxError> {
        let SlotIndex { map, store, used } = self;
        map.sync()?;
        drop(map);
        debug!("Closed slot index {:?} with {} slots reserved.", store.path(), used);
        Ok(())
    }

    fn set_unchecked(&mut self, slot: usize) {
        self.map[slot / 8] |= 1 << (slot % 8);
        self.used += 1;
    }

    fn clear_unchecked(&mut self, slot: usize) {
        self.map[slot / 8] &= !(1 << (slot % 8));
        self.used -= 1;
    }

    /// Extends the backing file by one chunk once the map cannot take
    /// one more reservation. The only place capacity changes after open.
    fn grow_if_full(&mut self) -> Result<(), IdxError> {
        if self.used + 1 < self.capacity() {
            return Ok(());
        }
        let new_len = self.store.grow(self.store.len() + CHUNK_BYTES)?;
        // Remap the full extent; the old mapping is released when replaced.
        self.map = self.store.map()?;
        info!("Grew slot index {:?} to {} bytes.", self.store.path(), new_len);
        Ok(())
    }
}
