//! The region container: serves reads and writes for one contiguous key
//! range of one table, buffering writes in memory, persisting them through
//! the shared write-ahead log, and periodically reconciling into the
//! per-family stores.
//!
//! Lifecycle is one-way: a region is OPEN until `close` starts draining it,
//! and once CLOSED it is never reopened; the hosting server constructs a
//! fresh container from disk when needed. Every mutation takes the row lock
//! for its row, and commits to the log + memstore under the update lock
//! that flush snapshotting also takes, so a flush snapshot always holds a
//! gap-free prefix of the log's sequence order: all of a batch or none of
//! it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::descriptors::RegionInfo;
use crate::keys::{family_of, is_family_wildcard, now_millis, StoreKey, LATEST_TIMESTAMP};
use crate::server::host::ServerConfig;
use crate::server::store::FamilyStore;
use crate::server::wal::{read_log_file, SeqId, Wal, WalPayload};
use crate::server::{
    region_dir, MERGES_DIR_NAME, OLD_LOG_FILE_NAME, SPLITS_DIR_NAME,
};
use crate::server::store::StoreSize;
use crate::utils::TesseraError;

use bytes::Bytes;

use rand::Rng;

use tokio::fs;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};

/// One operation of a batch update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
    Put { column: String, value: Bytes },
    Delete { column: String },
}

/// An atomic set of mutations to one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchUpdate {
    pub row: Bytes,
    pub ops: Vec<BatchOperation>,
}

impl BatchUpdate {
    pub fn new(row: impl Into<Bytes>) -> Self {
        BatchUpdate {
            row: row.into(),
            ops: Vec::new(),
        }
    }

    pub fn put(mut self, column: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.ops.push(BatchOperation::Put {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, column: impl Into<String>) -> Self {
        self.ops.push(BatchOperation::Delete {
            column: column.into(),
        });
        self
    }
}

/// Hooks invoked around a split's close of the parent region, so the caller
/// can move its bookkeeping before and after the region goes unavailable.
pub trait RegionUnavailableListener: Send + Sync {
    /// The region is about to close; no more updates will be accepted.
    fn closing(&self, region_name: &str);

    /// The region has finished closing.
    fn closed(&self, region_name: &str);
}

struct WriteState {
    /// Set while a memstore flush is happening.
    flushing: bool,

    /// Set while a compaction is running.
    compacting: bool,

    /// Cleared by close; once cleared, no further flush or compaction.
    writes_enabled: bool,
}

struct RowLockTable {
    rows_to_locks: HashMap<Bytes, u64>,
    locks_to_rows: HashMap<u64, Bytes>,
}

/// A region of a table, holding one contiguous key range.
pub struct Region {
    info: RegionInfo,
    root_dir: PathBuf,
    region_dir: PathBuf,
    log: Arc<Wal>,
    stores: BTreeMap<String, FamilyStore>,
    config: Arc<ServerConfig>,

    /// Lowest valid sequence id for fresh writes: everything at or below is
    /// already durable in the stores.
    min_sequence_id: SeqId,

    /// Row locks: a logical mutual-exclusion token per row. Unfair (no
    /// queueing order) but correct; release notifies all waiters.
    row_locks: StdMutex<RowLockTable>,
    row_lock_notify: Notify,

    /// Pairs the log append + memstore insert of a batch, and excludes the
    /// flush snapshot swap.
    update_lock: Mutex<()>,

    write_state: StdMutex<WriteState>,
    state_notify: Notify,

    closed: AtomicBool,

    /// Aggregate unflushed memstore bytes across families.
    memstore_size: AtomicUsize,

    /// Wakes writers blocked on memory pressure once a flush completes.
    flushed_notify: Notify,

    active_scanners: AtomicUsize,
    scanner_notify: Notify,

    /// Held shared by row operations and flushes, exclusively by close and
    /// split, so a close blocks new operations and waits out in-flight ones.
    region_lock: RwLock<()>,

    /// Flush-request channel into the host's flusher task.
    flush_tx: Option<mpsc::UnboundedSender<String>>,
}

impl Region {
    /// Creates a brand-new region's directory skeleton on disk (one
    /// subdirectory per family). Used by table creation and bootstrap.
    pub async fn create(
        root_dir: &Path,
        info: &RegionInfo,
    ) -> Result<(), TesseraError> {
        let dir = region_dir(root_dir, info.encoded_name());
        for family in info.table_desc.families.keys() {
            fs::create_dir_all(dir.join(family)).await?;
        }
        pf_info!("created region '{}' at '{}'", info.region_name(), dir.display());
        Ok(())
    }

    /// Deletes all files of a region.
    pub async fn delete_region(
        root_dir: &Path,
        encoded: u32,
    ) -> Result<(), TesseraError> {
        let dir = region_dir(root_dir, encoded);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Opens a region from its on-disk state: loads every family store,
    /// clears leftover split/merge staging directories from an unclean
    /// restart, replays the per-region recovery log if one is present, and
    /// bumps the shared log's sequence counter past everything flushed.
    pub async fn open(
        root_dir: impl Into<PathBuf>,
        log: Arc<Wal>,
        info: RegionInfo,
        config: Arc<ServerConfig>,
        flush_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Region, TesseraError> {
        let root_dir = root_dir.into();
        let dir = region_dir(&root_dir, info.encoded_name());
        fs::create_dir_all(&dir).await?;

        // staging directories must not survive an unclean restart
        for staging in [SPLITS_DIR_NAME, MERGES_DIR_NAME] {
            let path = dir.join(staging);
            if fs::try_exists(&path).await? {
                pf_warn!("deleting leftover staging directory '{}'", path.display());
                fs::remove_dir_all(&path).await?;
            }
        }

        let mut stores = BTreeMap::new();
        for family in info.table_desc.families.values() {
            let store = FamilyStore::open(
                &root_dir,
                &dir,
                family.clone(),
                config.compaction_threshold,
            )
            .await?;
            stores.insert(family.name.clone(), store);
        }
        let min_sequence_id =
            stores.values().map(|s| s.max_sequence_id()).max().unwrap_or(0);
        pf_debug!(
            "next sequence id for region '{}' is {}",
            info.region_name(),
            min_sequence_id + 1
        );

        let region = Region {
            region_dir: dir,
            root_dir,
            log,
            stores,
            config,
            min_sequence_id,
            row_locks: StdMutex::new(RowLockTable {
                rows_to_locks: HashMap::new(),
                locks_to_rows: HashMap::new(),
            }),
            row_lock_notify: Notify::new(),
            update_lock: Mutex::new(()),
            write_state: StdMutex::new(WriteState {
                flushing: false,
                compacting: false,
                writes_enabled: true,
            }),
            state_notify: Notify::new(),
            closed: AtomicBool::new(false),
            memstore_size: AtomicUsize::new(0),
            flushed_notify: Notify::new(),
            active_scanners: AtomicUsize::new(0),
            scanner_notify: Notify::new(),
            region_lock: RwLock::new(()),
            flush_tx: None,
            info,
        };

        let replayed = region.replay_recovery_log().await?;
        region.log.set_sequence_number(region.min_sequence_id + 1);

        let mut region = region;
        region.flush_tx = flush_tx;
        if replayed > 0 {
            pf_info!(
                "replayed {} edit(s) into region '{}'; requesting flush",
                replayed,
                region.info.region_name()
            );
            region.request_flush();
        }
        pf_info!("region '{}' available", region.info.region_name());
        Ok(region)
    }

    /// Replays the per-region recovery log written by `split_log`, skipping
    /// edits already reflected in the stores.
    async fn replay_recovery_log(&self) -> Result<usize, TesseraError> {
        let path = self.region_dir.join(OLD_LOG_FILE_NAME);
        if !fs::try_exists(&path).await? {
            return Ok(0);
        }
        let mut replayed = 0usize;
        for record in read_log_file(&path).await? {
            if record.region != self.info.region_name() {
                continue;
            }
            if let WalPayload::Cell {
                row,
                column,
                timestamp,
                value,
            } = record.payload
            {
                let family = match family_of(&column) {
                    Ok(f) => f.to_string(),
                    Err(_) => continue,
                };
                if let Some(store) = self.stores.get(&family) {
                    if record.seq > store.max_sequence_id() {
                        let delta = store.add(
                            StoreKey::new(row, column, timestamp),
                            value,
                        );
                        self.memstore_size.fetch_add(delta, Ordering::SeqCst);
                        replayed += 1;
                    }
                }
            }
        }
        Ok(replayed)
    }

    pub fn info(&self) -> &RegionInfo {
        &self.info
    }

    pub fn region_name(&self) -> &str {
        self.info.region_name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Updates must carry sequence ids above this value.
    pub fn min_sequence_id(&self) -> SeqId {
        self.min_sequence_id
    }

    pub fn memstore_size(&self) -> usize {
        self.memstore_size.load(Ordering::SeqCst)
    }

    fn check_row(&self, row: &[u8]) -> Result<(), TesseraError> {
        if self.info.contains_row(row) {
            Ok(())
        } else {
            Err(TesseraError::WrongRegion(format!(
                "requested row {:?} out of range for region '{}', start_key={:?}, end_key={:?}",
                row,
                self.info.region_name(),
                self.info.start_key,
                self.info.end_key
            )))
        }
    }

    fn check_column(&self, column: &str) -> Result<(), TesseraError> {
        let family = family_of(column)?;
        if !self.stores.contains_key(family) {
            return Err(TesseraError::InvalidColumn(format!(
                "family '{}' does not exist in region '{}'",
                family,
                self.info.region_name()
            )));
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), TesseraError> {
        if self.is_closed() {
            Err(TesseraError::RegionClosed(
                self.info.region_name().to_string(),
            ))
        } else {
            Ok(())
        }
    }

    //
    // reads
    //

    /// Point read: up to `versions` values of one cell at or before
    /// `timestamp`, newest first. No row lock needed.
    pub fn get(
        &self,
        row: &[u8],
        column: &str,
        timestamp: u64,
        versions: usize,
    ) -> Result<Vec<Bytes>, TesseraError> {
        self.check_open()?;
        self.check_row(row)?;
        self.check_column(column)?;
        let family = family_of(column)?;
        let key = StoreKey::new(row.to_vec(), column, timestamp);
        Ok(self.stores[family].get(&key, versions))
    }

    /// All visible columns of one row across families, under the row lock.
    pub async fn get_full(
        &self,
        row: &[u8],
        timestamp: u64,
    ) -> Result<BTreeMap<String, Bytes>, TesseraError> {
        self.check_open()?;
        let lockid = self.obtain_row_lock(row).await?;
        let mut results = BTreeMap::new();
        for store in self.stores.values() {
            store.get_full(row, timestamp, &mut results);
        }
        self.release_row_lock_by_id(lockid);
        Ok(results)
    }

    //
    // writes
    //

    /// Applies an atomic batch of mutations to one row: obtains the row
    /// lock (blocking until available), then appends to the log and inserts
    /// into the memstores under the update lock. A delete at the latest
    /// timestamp tombstones every currently-visible version of the column.
    pub async fn batch_update(
        &self,
        timestamp: u64,
        batch: BatchUpdate,
    ) -> Result<(), TesseraError> {
        self.check_resources().await;

        let _r = self.region_lock.read().await;
        self.check_open()?;
        self.check_row(&batch.row)?;
        for op in &batch.ops {
            let column = match op {
                BatchOperation::Put { column, .. } => column,
                BatchOperation::Delete { column } => column,
            };
            self.check_column(column)?;
        }

        let lockid = self.obtain_row_lock(&batch.row).await?;
        let result = self.apply_batch(timestamp, &batch).await;
        self.release_row_lock_by_id(lockid);
        result
    }

    async fn apply_batch(
        &self,
        timestamp: u64,
        batch: &BatchUpdate,
    ) -> Result<(), TesseraError> {
        let commit_ts = if timestamp == LATEST_TIMESTAMP {
            now_millis()
        } else {
            timestamp
        };

        let mut edits: BTreeMap<StoreKey, Option<Bytes>> = BTreeMap::new();
        for op in &batch.ops {
            match op {
                BatchOperation::Put { column, value } => {
                    edits.insert(
                        StoreKey::new(batch.row.clone(), column.clone(), commit_ts),
                        Some(value.clone()),
                    );
                }
                BatchOperation::Delete { column } => {
                    if timestamp == LATEST_TIMESTAMP {
                        // tombstone every currently-visible version
                        let family = family_of(column)?;
                        let origin = StoreKey::new(
                            batch.row.clone(),
                            column.clone(),
                            LATEST_TIMESTAMP,
                        );
                        for key in
                            self.stores[family].get_keys(&origin, usize::MAX)
                        {
                            edits.insert(key, None);
                        }
                    } else {
                        edits.insert(
                            StoreKey::new(
                                batch.row.clone(),
                                column.clone(),
                                commit_ts,
                            ),
                            None,
                        );
                    }
                }
            }
        }
        self.update(edits).await
    }

    /// Deletes all versions of a cell at or older than `timestamp`, under
    /// the row lock.
    pub async fn delete_all(
        &self,
        row: &[u8],
        column: &str,
        timestamp: u64,
    ) -> Result<(), TesseraError> {
        let _r = self.region_lock.read().await;
        self.check_open()?;
        self.check_row(row)?;
        self.check_column(column)?;

        let lockid = self.obtain_row_lock(row).await?;
        let family = match family_of(column) {
            Ok(f) => f,
            Err(e) => {
                self.release_row_lock_by_id(lockid);
                return Err(e);
            }
        };
        let origin = StoreKey::new(row.to_vec(), column, timestamp);
        let mut edits: BTreeMap<StoreKey, Option<Bytes>> = BTreeMap::new();
        for key in self.stores[family].get_keys(&origin, usize::MAX) {
            edits.insert(key, None);
        }
        let result = self.update(edits).await;
        self.release_row_lock_by_id(lockid);
        result
    }

    /// Adds updates first to the log and then to the memstores. Assumes the
    /// caller holds the row lock for the row involved.
    async fn update(
        &self,
        edits: BTreeMap<StoreKey, Option<Bytes>>,
    ) -> Result<(), TesseraError> {
        if edits.is_empty() {
            return Ok(());
        }
        let _u = self.update_lock.lock().await; // prevent a flush snapshot
        self.log
            .append(self.info.region_name(), self.info.table_name(), &edits)
            .await?;

        let mut total = 0;
        for (key, value) in edits {
            let family = family_of(&key.column)?;
            let delta = self.stores[family].add(key, value);
            total = self.memstore_size.fetch_add(delta, Ordering::SeqCst) + delta;
        }
        if total > self.config.memstore_flush_size {
            self.request_flush();
        }
        Ok(())
    }

    fn request_flush(&self) {
        if let Some(tx) = &self.flush_tx {
            let _ = tx.send(self.info.region_name().to_string());
        }
    }

    /// Blocks the caller while the memstore is over the blocking threshold,
    /// released by flush completion.
    async fn check_resources(&self) {
        let blocking =
            self.config.memstore_flush_size * self.config.memstore_block_multiplier;
        let mut blocked = false;
        loop {
            let notified = self.flushed_notify.notified();
            tokio::pin!(notified);
            if self.memstore_size.load(Ordering::SeqCst) < blocking {
                break;
            }
            if !blocked {
                pf_info!(
                    "blocking updates for region '{}': memstore size {} >= blocking size {}",
                    self.info.region_name(),
                    self.memstore_size.load(Ordering::SeqCst),
                    blocking
                );
                blocked = true;
                self.request_flush();
            }
            notified.await;
        }
        if blocked {
            pf_info!("unblocking updates for region '{}'", self.info.region_name());
        }
    }

    //
    // row locks
    //

    /// Obtains the exclusive lock on one row, blocking until available.
    /// Returns an opaque lock id the holder can be identified by.
    pub async fn obtain_row_lock(&self, row: &[u8]) -> Result<u64, TesseraError> {
        self.check_row(row)?;
        self.check_open()?;
        let row = Bytes::copy_from_slice(row);
        loop {
            let notified = self.row_lock_notify.notified();
            tokio::pin!(notified);
            {
                let mut table = self.row_locks.lock().unwrap();
                if !table.rows_to_locks.contains_key(&row) {
                    let lockid: u64 = rand::thread_rng().gen();
                    table.rows_to_locks.insert(row.clone(), lockid);
                    table.locks_to_rows.insert(lockid, row);
                    return Ok(lockid);
                }
            }
            notified.await;
        }
    }

    /// The row a lock id maps to, if the lock is still held.
    pub fn row_from_lock(&self, lockid: u64) -> Option<Bytes> {
        let table = self.row_locks.lock().unwrap();
        table.locks_to_rows.get(&lockid).cloned()
    }

    /// Releases the lock on a row and wakes all waiters.
    pub fn release_row_lock(&self, row: &[u8]) {
        let mut table = self.row_locks.lock().unwrap();
        if let Some(lockid) = table.rows_to_locks.remove(row as &[u8]) {
            table.locks_to_rows.remove(&lockid);
        }
        drop(table);
        self.row_lock_notify.notify_waiters();
    }

    /// Releases a lock by its id.
    pub fn release_row_lock_by_id(&self, lockid: u64) {
        let mut table = self.row_locks.lock().unwrap();
        if let Some(row) = table.locks_to_rows.remove(&lockid) {
            table.rows_to_locks.remove(&row);
        }
        drop(table);
        self.row_lock_notify.notify_waiters();
    }

    fn row_locks_outstanding(&self) -> usize {
        self.row_locks.lock().unwrap().rows_to_locks.len()
    }

    //
    // flush
    //

    /// Flushes the memstores to the family stores. No-op returning false if
    /// the region is closed, a flush is already in progress, writes are
    /// disabled, or the buffer is empty.
    pub async fn flushcache(&self) -> Result<bool, TesseraError> {
        if self.is_closed() {
            return Ok(false);
        }
        let _r = self.region_lock.read().await; // prevent close/split
        {
            let mut ws = self.write_state.lock().unwrap();
            if !ws.flushing && ws.writes_enabled {
                ws.flushing = true;
            } else {
                pf_debug!(
                    "NOT flushing memstore for region '{}': flushing={}, writes_enabled={}",
                    self.info.region_name(),
                    ws.flushing,
                    ws.writes_enabled
                );
                return Ok(false);
            }
        }
        let result = self.internal_flushcache().await;
        {
            let mut ws = self.write_state.lock().unwrap();
            ws.flushing = false;
        }
        self.state_notify.notify_waiters();
        result
    }

    /// The two-phase flush: (a) swap the memstores out as snapshots under
    /// the update lock; (b) obtain the log's flush checkpoint; (c) write
    /// each snapshot to its store; (d) write the flush-complete marker. A
    /// failure in (c) aborts the log flush and surfaces the fatal
    /// dropped-snapshot condition: the snapshot is the only remaining
    /// source of truth and the partial on-disk state cannot be trusted, so
    /// the hosting process must restart and replay the log.
    async fn internal_flushcache(&self) -> Result<bool, TesseraError> {
        let snapshotted = {
            let _u = self.update_lock.lock().await;
            if self.memstore_size.load(Ordering::SeqCst) == 0 {
                false
            } else {
                self.memstore_size.store(0, Ordering::SeqCst);
                for store in self.stores.values() {
                    store.snapshot_memstore()?;
                }
                true
            }
        };
        if !snapshotted {
            pf_debug!(
                "not flushing region '{}': nothing to do",
                self.info.region_name()
            );
            return Ok(false);
        }

        let token = self.log.start_cache_flush().await;
        let seq = token.seq;

        let written = async {
            for store in self.stores.values() {
                store.flush_cache(seq).await?;
            }
            Ok::<(), TesseraError>(())
        }
        .await;

        match written {
            Ok(()) => {
                self.log
                    .complete_cache_flush(
                        token,
                        self.info.region_name(),
                        self.info.table_name(),
                    )
                    .await?;
            }
            Err(e) => {
                // the snapshot was not persisted; only a log replay after
                // restart can restore it
                self.log.abort_cache_flush(token);
                return Err(TesseraError::DroppedSnapshot(format!(
                    "region '{}': {}",
                    self.info.region_name(),
                    e
                )));
            }
        }

        self.flushed_notify.notify_waiters();
        pf_debug!(
            "finished memstore flush for region '{}' at sequence id {}",
            self.info.region_name(),
            seq
        );
        Ok(true)
    }

    //
    // compaction
    //

    /// Compacts stores only if one of them wants it.
    pub async fn compact_if_needed(&self) -> Result<bool, TesseraError> {
        if !self.stores.values().any(|s| s.needs_compaction()) {
            pf_debug!(
                "region '{}' does not need compaction",
                self.info.region_name()
            );
            return Ok(false);
        }
        self.compact_stores().await
    }

    /// Compacts all stores. Never concurrent with another compaction on the
    /// same region, nor with close; safe alongside flushes and gets.
    pub async fn compact_stores(&self) -> Result<bool, TesseraError> {
        if self.is_closed() {
            return Ok(false);
        }
        {
            let mut ws = self.write_state.lock().unwrap();
            if !ws.compacting && ws.writes_enabled {
                ws.compacting = true;
            } else {
                pf_info!(
                    "NOT compacting region '{}': compacting={}, writes_enabled={}",
                    self.info.region_name(),
                    ws.compacting,
                    ws.writes_enabled
                );
                return Ok(false);
            }
        }
        pf_info!("starting compaction on region '{}'", self.info.region_name());

        let mut status = true;
        let result = async {
            for store in self.stores.values() {
                if !store.compact().await? {
                    status = false;
                }
            }
            Ok::<(), TesseraError>(())
        }
        .await;

        {
            let mut ws = self.write_state.lock().unwrap();
            ws.compacting = false;
        }
        self.state_notify.notify_waiters();
        result?;
        pf_info!("compaction completed on region '{}'", self.info.region_name());
        Ok(status)
    }

    //
    // close and split
    //

    /// Closes the region: waits out any in-flight compaction or flush,
    /// disables writes, cooperatively drains active scanners and row locks
    /// (no forced cancellation), performs a final flush unless aborting,
    /// then closes every store. Idempotent; a second call returns an empty
    /// list without side effects.
    pub async fn close(&self, abort: bool) -> Result<Vec<PathBuf>, TesseraError> {
        if self.is_closed() {
            pf_info!("region '{}' already closed", self.info.region_name());
            return Ok(Vec::new());
        }
        let _w = self.region_lock.write().await;
        if self.is_closed() {
            return Ok(Vec::new());
        }

        // wait for in-flight compaction/flush, then disable further ones
        loop {
            let notified = self.state_notify.notified();
            tokio::pin!(notified);
            {
                let mut ws = self.write_state.lock().unwrap();
                if !ws.flushing && !ws.compacting {
                    ws.writes_enabled = false;
                    break;
                }
            }
            notified.await;
        }

        // the write lock we hold prevents new scanners; wait for active
        // ones to finish
        loop {
            let notified = self.scanner_notify.notified();
            tokio::pin!(notified);
            if self.active_scanners.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        // no more row locks can be given out; wait on outstanding ones so
        // we do not drop updates mid-commit
        loop {
            let notified = self.row_lock_notify.notified();
            tokio::pin!(notified);
            if self.row_locks_outstanding() == 0 {
                break;
            }
            notified.await;
        }

        if !abort {
            self.internal_flushcache().await?;
        }

        let mut files = Vec::new();
        for store in self.stores.values() {
            files.extend(store.close());
        }
        self.closed.store(true, Ordering::SeqCst);
        pf_info!("closed region '{}'", self.info.region_name());
        Ok(files)
    }

    fn largest_store(&self) -> Option<StoreSize> {
        let mut splitable = true;
        let mut biggest: Option<StoreSize> = None;
        for store in self.stores.values() {
            let size = store.size();
            splitable &= size.splitable;
            if biggest
                .as_ref()
                .map_or(true, |b| size.aggregate > b.aggregate)
            {
                biggest = Some(size);
            }
        }
        biggest.map(|mut b| {
            b.splitable = splitable;
            b
        })
    }

    /// Decides whether the region should split, returning the split key if
    /// so: the largest store's aggregate size exceeds 1.5x the configured
    /// max file size, and no store holds unresolved reference files.
    pub fn needs_split(&self) -> Option<Bytes> {
        let biggest = self.largest_store()?;
        let trigger = self.config.max_file_size + self.config.max_file_size / 2;
        if biggest.aggregate < trigger {
            return None;
        }
        if !biggest.splitable {
            pf_warn!(
                "region '{}' is NOT splitable though its aggregate size is {}",
                self.info.region_name(),
                biggest.aggregate
            );
            return None;
        }
        let mid = biggest.mid_key?;
        if !self.info.contains_row(&mid) || mid == self.info.start_key {
            return None;
        }
        Some(mid)
    }

    /// This region's descriptor as a tombstoned split parent.
    pub fn split_parent_info(&self) -> RegionInfo {
        let mut info = self.info.clone();
        info.offline = true;
        info.split = true;
        info
    }

    /// Splits the region in two at the computed mid key, closing it in the
    /// process. Cheap: store files are not rewritten; each daughter gets
    /// reference files onto its half of every parent file. Returns `None`
    /// if a split is not needed.
    pub async fn split_region(
        &self,
        listener: Option<&dyn RegionUnavailableListener>,
    ) -> Result<Option<(Region, Region)>, TesseraError> {
        let mid = match self.needs_split() {
            Some(mid) => mid,
            None => return Ok(None),
        };
        pf_info!(
            "splitting region '{}' at key {:?}",
            self.info.region_name(),
            mid
        );

        let a_info = RegionInfo::new(
            self.info.table_desc.clone(),
            self.info.start_key.clone(),
            mid.clone(),
        );
        let b_info = RegionInfo::new(
            self.info.table_desc.clone(),
            mid.clone(),
            self.info.end_key.clone(),
        );
        let splits_dir = self.region_dir.join(SPLITS_DIR_NAME);
        for daughter in [&a_info, &b_info] {
            let staged = region_dir(&splits_dir, daughter.encoded_name());
            if fs::try_exists(&staged).await? {
                return Err(TesseraError::Io(format!(
                    "cannot split; target file collision at '{}'",
                    staged.display()
                )));
            }
        }

        // let the caller retire its bookkeeping, then drain and close
        if let Some(listener) = listener {
            listener.closing(self.info.region_name());
        }
        self.close(false).await?;
        if let Some(listener) = listener {
            listener.closed(self.info.region_name());
        }

        for store in self.stores.values() {
            store
                .write_split_references(
                    &splits_dir,
                    self.info.encoded_name(),
                    a_info.encoded_name(),
                    b_info.encoded_name(),
                    &mid,
                )
                .await?;
        }

        // move the staged daughters into place and open them
        for daughter in [&a_info, &b_info] {
            fs::rename(
                region_dir(&splits_dir, daughter.encoded_name()),
                region_dir(&self.root_dir, daughter.encoded_name()),
            )
            .await?;
        }
        fs::remove_dir_all(&splits_dir).await?;

        let region_a = Region::open(
            &self.root_dir,
            self.log.clone(),
            a_info,
            self.config.clone(),
            self.flush_tx.clone(),
        )
        .await?;
        let region_b = Region::open(
            &self.root_dir,
            self.log.clone(),
            b_info,
            self.config.clone(),
            self.flush_tx.clone(),
        )
        .await?;

        pf_info!(
            "region split of '{}' complete; new regions: '{}', '{}'",
            self.info.region_name(),
            region_a.region_name(),
            region_b.region_name()
        );
        Ok(Some((region_a, region_b)))
    }

    //
    // scanning
    //

    /// Opens a scanner over the region, merging the per-store scanners for
    /// the requested columns. Column selectors are either exact
    /// `family:qualifier` names or whole-family `family:` wildcards.
    pub fn get_scanner(
        self: &Arc<Self>,
        columns: &[&str],
        first_row: &[u8],
        timestamp: u64,
    ) -> Result<RegionScanner, TesseraError> {
        self.check_open()?;

        let mut by_family: HashMap<String, Vec<String>> = HashMap::new();
        let mut wildcard = false;
        for column in columns {
            let family = family_of(column)?;
            if !self.stores.contains_key(family) {
                continue;
            }
            if is_family_wildcard(column) {
                wildcard = true;
            }
            by_family
                .entry(family.to_string())
                .or_default()
                .push(column.to_string());
        }
        let multiple_matchers = columns.len() > 1;

        let mut sources = Vec::new();
        for (family, selectors) in by_family {
            let cells =
                self.stores[&family].scan_cells(&selectors, first_row, timestamp);
            sources.push(cells.into_iter().peekable());
        }

        self.active_scanners.fetch_add(1, Ordering::SeqCst);
        Ok(RegionScanner {
            region: self.clone(),
            sources,
            wildcard,
            multiple_matchers,
            closed: false,
        })
    }
}

type CellIter = std::iter::Peekable<std::vec::IntoIter<(StoreKey, Bytes)>>;

/// Iterator over a region's rows: a k-way merge of independent per-store
/// cell sequences, yielding one `(row, columns)` entry at a time.
pub struct RegionScanner {
    region: Arc<Region>,
    sources: Vec<CellIter>,
    wildcard: bool,
    multiple_matchers: bool,
    closed: bool,
}

impl RegionScanner {
    /// The next row with any matching columns, or `None` at the end.
    pub fn next_row(&mut self) -> Option<(Bytes, BTreeMap<String, Bytes>)> {
        // smallest row at the head of any source
        let row = self
            .sources
            .iter_mut()
            .filter_map(|s| s.peek().map(|(k, _)| k.row.clone()))
            .min()?;

        let mut columns = BTreeMap::new();
        for source in self.sources.iter_mut() {
            while source.peek().map_or(false, |(k, _)| k.row == row) {
                if let Some((k, v)) = source.next() {
                    columns.insert(k.column, v);
                }
            }
        }
        Some((row, columns))
    }

    pub fn is_wildcard_scanner(&self) -> bool {
        self.wildcard
    }

    pub fn is_multiple_match_scanner(&self) -> bool {
        self.multiple_matchers
    }

    /// Ends the scan, releasing this scanner's slot in the region's drain
    /// accounting.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let before =
                self.region.active_scanners.fetch_sub(1, Ordering::SeqCst);
            if before == 1 {
                self.region.scanner_notify.notify_waiters();
            }
        }
    }
}

impl Drop for RegionScanner {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod region_tests {
    use super::*;
    use crate::descriptors::{FamilyDescriptor, TableDescriptor};

    fn table_t() -> TableDescriptor {
        TableDescriptor::new("t")
            .unwrap()
            .add_family(FamilyDescriptor::new("f").unwrap())
    }

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            memstore_flush_size: 64 * 1024,
            max_file_size: 1024,
            ..Default::default()
        })
    }

    async fn open_region(
        root: &Path,
        info: RegionInfo,
        config: Arc<ServerConfig>,
    ) -> (Arc<Wal>, Arc<Region>) {
        let logdir = root.join(format!("log_{}", rand::thread_rng().gen::<u32>()));
        let log = Arc::new(
            Wal::new_and_setup(logdir, 100_000, false, None).await.unwrap(),
        );
        let region = Region::open(root, log.clone(), info, config, None)
            .await
            .unwrap();
        (log, Arc::new(region))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_update_then_get() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let (_log, region) = open_region(
            tmp.path(),
            RegionInfo::with_id(1, table_t(), "", ""),
            test_config(),
        )
        .await;

        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(&b"a"[..]).put("f:c1", "v1").put("f:c2", "v2"),
            )
            .await?;

        assert_eq!(
            region.get(b"a", "f:c1", LATEST_TIMESTAMP, 1)?,
            vec![Bytes::from("v1")]
        );
        let full = region.get_full(b"a", LATEST_TIMESTAMP).await?;
        assert_eq!(full.len(), 2);
        assert_eq!(full["f:c2"], Bytes::from("v2"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn row_bounds_and_column_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let info = RegionInfo::with_id(2, table_t(), &b"b"[..], &b"m"[..]);
        let (_log, region) = open_region(tmp.path(), info, test_config()).await;

        assert!(matches!(
            region.get(b"z", "f:c1", LATEST_TIMESTAMP, 1),
            Err(TesseraError::WrongRegion(_))
        ));
        assert!(matches!(
            region
                .batch_update(
                    LATEST_TIMESTAMP,
                    BatchUpdate::new(&b"c"[..]).put("nope:c1", "v"),
                )
                .await,
            Err(TesseraError::InvalidColumn(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn row_locks_are_exclusive_and_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let (_log, region) = open_region(
            tmp.path(),
            RegionInfo::with_id(3, table_t(), "", ""),
            test_config(),
        )
        .await;

        let holders = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let region = region.clone();
            let holders = holders.clone();
            handles.push(tokio::spawn(async move {
                let lockid = region.obtain_row_lock(b"contended").await.unwrap();
                assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
                assert_eq!(holders.fetch_sub(1, Ordering::SeqCst), 1);
                region.release_row_lock_by_id(lockid);
                lockid
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(region.row_locks_outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_latest_tombstones_all_visible_versions(
    ) -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let (_log, region) = open_region(
            tmp.path(),
            RegionInfo::with_id(4, table_t(), "", ""),
            test_config(),
        )
        .await;

        for (ts, v) in [(10u64, "v10"), (20, "v20"), (30, "v30")] {
            region
                .batch_update(ts, BatchUpdate::new(&b"a"[..]).put("f:c1", v))
                .await?;
        }
        assert_eq!(region.get(b"a", "f:c1", LATEST_TIMESTAMP, 10)?.len(), 3);

        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(&b"a"[..]).delete("f:c1"),
            )
            .await?;
        assert!(region.get(b"a", "f:c1", LATEST_TIMESTAMP, 10)?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_empty_buffer_is_a_noop() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let (log, region) = open_region(
            tmp.path(),
            RegionInfo::with_id(5, table_t(), "", ""),
            test_config(),
        )
        .await;

        let entries_before = log.num_entries().await;
        assert!(!region.flushcache().await?);
        assert_eq!(log.num_entries().await, entries_before);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_idempotent() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let (_log, region) = open_region(
            tmp.path(),
            RegionInfo::with_id(6, table_t(), "", ""),
            test_config(),
        )
        .await;

        region
            .batch_update(LATEST_TIMESTAMP, BatchUpdate::new(&b"a"[..]).put("f:c1", "v"))
            .await?;
        let files = region.close(false).await?;
        assert!(!files.is_empty());

        let again = region.close(false).await?;
        assert!(again.is_empty());

        assert!(matches!(
            region.get(b"a", "f:c1", LATEST_TIMESTAMP, 1),
            Err(TesseraError::RegionClosed(_))
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_restart_recovers_value() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config();
        let info = RegionInfo::with_id(7, table_t(), "", "");

        {
            let (log, region) =
                open_region(tmp.path(), info.clone(), config.clone()).await;
            region
                .batch_update(
                    LATEST_TIMESTAMP,
                    BatchUpdate::new(&b"a"[..]).put("f:c1", "v1"),
                )
                .await?;
            assert!(region.flushcache().await?);
            log.close().await?;
            // simulated crash: the region is dropped without close()
        }

        let (_log, region) = open_region(tmp.path(), info, config).await;
        assert_eq!(
            region.get(b"a", "f:c1", LATEST_TIMESTAMP, 1)?,
            vec![Bytes::from("v1")]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crash_without_flush_recovers_via_log_replay(
    ) -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config();
        let info = RegionInfo::with_id(8, table_t(), "", "");

        let logdir = tmp.path().join("log_crashing");
        {
            let log = Arc::new(
                Wal::new_and_setup(&logdir, 100_000, false, None).await?,
            );
            let region = Region::open(
                tmp.path(),
                log.clone(),
                info.clone(),
                config.clone(),
                None,
            )
            .await?;
            region
                .batch_update(
                    LATEST_TIMESTAMP,
                    BatchUpdate::new(&b"a"[..]).put("f:c1", "unflushed"),
                )
                .await?;
            log.close().await?;
            // crash: no flush, no close
        }

        // recovery: split the dead server's log, then reopen the region
        crate::server::split_log(tmp.path(), &logdir).await?;
        let (_log, region) = open_region(tmp.path(), info, config).await;
        assert_eq!(
            region.get(b"a", "f:c1", LATEST_TIMESTAMP, 1)?,
            vec![Bytes::from("unflushed")]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn split_partitions_rows_between_daughters() -> Result<(), TesseraError>
    {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config();
        let (_log, region) = open_region(
            tmp.path(),
            RegionInfo::with_id(9, table_t(), "", ""),
            config.clone(),
        )
        .await;

        for i in 0..1000u32 {
            region
                .batch_update(
                    LATEST_TIMESTAMP,
                    BatchUpdate::new(format!("row-{:04}", i).into_bytes())
                        .put("f:c1", format!("val-{:04}", i)),
                )
                .await?;
        }
        assert!(region.flushcache().await?);

        let mid = region.needs_split().expect("large region must want split");
        let (daughter_a, daughter_b) = region
            .split_region(None)
            .await?
            .expect("split should proceed");
        assert!(region.is_closed());

        let parent = region.split_parent_info();
        assert!(parent.offline && parent.split);
        assert_eq!(daughter_a.info().start_key, Bytes::new());
        assert_eq!(daughter_a.info().end_key, mid);
        assert_eq!(daughter_b.info().start_key, mid);
        assert_eq!(daughter_b.info().end_key, Bytes::new());

        // first row from daughter A, a row at/past the midkey from B
        assert_eq!(
            daughter_a.get(b"row-0000", "f:c1", LATEST_TIMESTAMP, 1)?,
            vec![Bytes::from("val-0000")]
        );
        let high = b"row-0999";
        assert_eq!(
            daughter_b.get(high, "f:c1", LATEST_TIMESTAMP, 1)?,
            vec![Bytes::from("val-0999")]
        );

        // neither daughter serves a row outside its own bound
        assert!(matches!(
            daughter_a.get(high, "f:c1", LATEST_TIMESTAMP, 1),
            Err(TesseraError::WrongRegion(_))
        ));
        assert!(matches!(
            daughter_b.get(b"row-0000", "f:c1", LATEST_TIMESTAMP, 1),
            Err(TesseraError::WrongRegion(_))
        ));

        // every row readable from exactly one daughter
        for i in (0..1000u32).step_by(97) {
            let row = format!("row-{:04}", i).into_bytes();
            let a = daughter_a.get(&row, "f:c1", LATEST_TIMESTAMP, 1);
            let b = daughter_b.get(&row, "f:c1", LATEST_TIMESTAMP, 1);
            assert!(a.is_ok() ^ b.is_ok());
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scanner_merges_rows_and_drains_on_close(
    ) -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let (_log, region) = open_region(
            tmp.path(),
            RegionInfo::with_id(10, table_t(), "", ""),
            test_config(),
        )
        .await;

        for row in ["a", "b", "c"] {
            region
                .batch_update(
                    LATEST_TIMESTAMP,
                    BatchUpdate::new(row.as_bytes().to_vec())
                        .put("f:c1", format!("{}-1", row)),
                )
                .await?;
        }
        // one row only in a flushed file, the rest in the memstore
        assert!(region.flushcache().await?);
        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(&b"b"[..]).put("f:c2", "b-2"),
            )
            .await?;

        let mut scanner = region.get_scanner(&["f:"], b"", LATEST_TIMESTAMP)?;
        assert!(scanner.is_wildcard_scanner());
        let mut rows = Vec::new();
        while let Some((row, columns)) = scanner.next_row() {
            rows.push((row, columns));
        }
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].0, Bytes::from("b"));
        assert_eq!(rows[1].1.len(), 2);
        scanner.close();

        // with no scanners outstanding, close() does not block
        region.close(false).await?;
        Ok(())
    }
}
