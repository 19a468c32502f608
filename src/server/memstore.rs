//! In-memory mutation buffer of one column-family store.
//!
//! Holds the cells written since the last flush, plus a snapshot slot: when
//! a cache flush begins, the live map is swapped out whole into the snapshot
//! so new updates keep landing in a fresh map while the snapshot is written
//! to disk. Reads consult both.

use std::collections::BTreeMap;

use crate::keys::StoreKey;
use crate::utils::TesseraError;

use bytes::Bytes;

pub(crate) struct MemStore {
    /// Live cells, receiving updates.
    cells: BTreeMap<StoreKey, Option<Bytes>>,

    /// Cells frozen by an in-progress flush.
    snapshot: BTreeMap<StoreKey, Option<Bytes>>,

    /// Heap footprint of the live cells.
    size: usize,
}

impl MemStore {
    pub(crate) fn new() -> Self {
        MemStore {
            cells: BTreeMap::new(),
            snapshot: BTreeMap::new(),
            size: 0,
        }
    }

    /// Buffers one cell version. Returns the growth in heap footprint.
    pub(crate) fn add(
        &mut self,
        key: StoreKey,
        value: Option<Bytes>,
    ) -> usize {
        let key_size = key.heap_size();
        let new_len = value.as_ref().map_or(0, |v| v.len());
        match self.cells.insert(key, value) {
            Some(old) => {
                // an exact-version overwrite replaces rather than accumulates
                let old_len = old.as_ref().map_or(0, |v| v.len());
                self.size = (self.size + new_len).saturating_sub(old_len);
                new_len.saturating_sub(old_len)
            }
            None => {
                self.size += key_size + new_len;
                key_size + new_len
            }
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Freezes the live cells into the snapshot slot. The previous snapshot
    /// must have been cleared; two outstanding snapshots would mean two
    /// interleaved flushes, which the region-level flush flag rules out.
    pub(crate) fn snapshot(&mut self) -> Result<(), TesseraError> {
        if !self.snapshot.is_empty() {
            return Err(TesseraError::msg(
                "snapshot called again without clearing previous",
            ));
        }
        self.snapshot = std::mem::take(&mut self.cells);
        self.size = 0;
        Ok(())
    }

    /// A copy of the frozen snapshot, for writing out to a store file while
    /// reads continue to be served from the original.
    pub(crate) fn snapshot_data(&self) -> BTreeMap<StoreKey, Option<Bytes>> {
        self.snapshot.clone()
    }

    /// Drops the snapshot once its contents are durable in a store file.
    pub(crate) fn clear_snapshot(&mut self) {
        self.snapshot.clear();
    }

    pub(crate) fn live_cells(&self) -> &BTreeMap<StoreKey, Option<Bytes>> {
        &self.cells
    }

    pub(crate) fn snapshot_cells(&self) -> &BTreeMap<StoreKey, Option<Bytes>> {
        &self.snapshot
    }
}
