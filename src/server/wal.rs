//! Write-ahead log shared by every region hosted on one storage server.
//!
//! Edits are sequence-numbered under a single log-wide counter, so the log
//! totally orders all edits across all regions sharing it. As memstores are
//! flushed into family stores the log becomes obsolete; since it is only
//! practical to delete whole files, a file is deleted once every region's
//! oldest *unflushed* sequence id is newer than the highest id the file
//! holds. Log rolling can never interleave with the two-phase cache-flush
//! protocol: both hold the same flush lock, which keeps a flush's checkpoint
//! id from landing in a file that gets rolled and reclaimed mid-flush.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use crate::descriptors::encoded_name_of;
use crate::keys::StoreKey;
use crate::server::{region_dir, OLD_LOG_FILE_NAME};
use crate::utils::TesseraError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Log-wide edit sequence id type.
pub type SeqId = u64;

/// Payload of one log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalPayload {
    /// One cell mutation. `value` of `None` is a delete tombstone.
    Cell {
        row: Bytes,
        column: String,
        timestamp: u64,
        value: Option<Bytes>,
    },

    /// Synthetic marker: everything for this region at sequence ids up to
    /// and including `seq` is durably reflected in the family stores.
    FlushComplete,
}

/// One durable log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub region: String,
    pub table: String,
    pub seq: SeqId,
    pub payload: WalPayload,
}

/// Token returned by `start_cache_flush`. Holds the log's flush lock for the
/// duration of the caller's two-phase flush; must be consumed by exactly one
/// of `complete_cache_flush` or `abort_cache_flush`.
pub struct FlushToken {
    /// Checkpoint sequence id allocated for this flush.
    pub seq: SeqId,

    _guard: OwnedMutexGuard<()>,
}

/// State mutated under the update lock.
struct WalInner {
    /// Current log file writer; `None` once closed.
    writer: Option<File>,

    /// Index the next log file will get.
    file_num: u64,

    /// Records written to the current file so far.
    num_entries: usize,

    /// All log files but the current one, keyed by the highest sequence id
    /// that could have been written to each.
    output_files: BTreeMap<SeqId, PathBuf>,

    /// Oldest unflushed sequence id per region.
    unflushed: HashMap<String, SeqId>,

    closed: bool,
}

/// The shared write-ahead log of one storage server.
pub struct Wal {
    dir: PathBuf,

    /// Entry count past which a roll request is signalled.
    max_entries: usize,

    /// Whether appends fsync before returning.
    fsync: bool,

    /// Sender side of the roll-request channel, drained by the host's
    /// log-roller task.
    roll_tx: Option<mpsc::UnboundedSender<()>>,

    /// Next sequence id to allocate. Its own short-held lock so allocation
    /// never blocks on I/O.
    seq: StdMutex<SeqId>,

    /// Update lock: serializes appends, marker writes, and the bookkeeping
    /// around rolls.
    inner: Mutex<WalInner>,

    /// Held across the two-phase cache flush; `roll_writer` takes it too,
    /// making roll and flush mutually exclusive.
    flush_lock: Arc<Mutex<()>>,
}

impl Wal {
    /// Creates the log at `dir`, which must not already exist: a leftover
    /// log directory from a previous incarnation must be split/replayed and
    /// removed before a new log can start there.
    pub async fn new_and_setup(
        dir: impl Into<PathBuf>,
        max_entries: usize,
        fsync: bool,
        roll_tx: Option<mpsc::UnboundedSender<()>>,
    ) -> Result<Self, TesseraError> {
        let dir = dir.into();
        if fs::try_exists(&dir).await? {
            return Err(TesseraError::Io(format!(
                "target log directory already exists: '{}'",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir).await?;

        let path = Self::compute_filename(&dir, 0);
        let writer = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await?;
        pf_info!("new log writer created at '{}'", path.display());

        Ok(Wal {
            dir,
            max_entries,
            fsync,
            roll_tx,
            seq: StdMutex::new(0),
            inner: Mutex::new(WalInner {
                writer: Some(writer),
                file_num: 1,
                num_entries: 0,
                output_files: BTreeMap::new(),
                unflushed: HashMap::new(),
                closed: false,
            }),
            flush_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Bumps the sequence counter to at least `newvalue`. Called when a
    /// region is brought online so fresh sequence ids are always greater
    /// than anything already flushed for it.
    pub fn set_sequence_number(&self, newvalue: SeqId) {
        let mut seq = self.seq.lock().unwrap();
        if newvalue > *seq {
            pf_debug!("changing sequence number from {} to {}", *seq, newvalue);
            *seq = newvalue;
        }
    }

    /// Allocates a contiguous block of `n` sequence ids, returning the first.
    fn obtain_seq_block(&self, n: u64) -> SeqId {
        let mut seq = self.seq.lock().unwrap();
        let start = *seq;
        *seq += n;
        start
    }

    fn next_seq(&self) -> SeqId {
        *self.seq.lock().unwrap()
    }

    /// Appends a batch of edits for one region. Sequence ids for the whole
    /// batch are allocated atomically; the first one becomes the region's
    /// oldest-unflushed watermark if it has none. Signals an asynchronous
    /// roll request when the current file grows past the entry threshold.
    pub async fn append(
        &self,
        region: &str,
        table: &str,
        edits: &BTreeMap<StoreKey, Option<Bytes>>,
    ) -> Result<(), TesseraError> {
        if edits.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(TesseraError::Io("cannot append; log is closed".into()));
        }

        let start = self.obtain_seq_block(edits.len() as u64);
        inner.unflushed.entry(region.into()).or_insert(start);

        let mut buf = Vec::new();
        for (i, (key, value)) in edits.iter().enumerate() {
            let record = WalRecord {
                region: region.into(),
                table: table.into(),
                seq: start + i as SeqId,
                payload: WalPayload::Cell {
                    row: key.row.clone(),
                    column: key.column.clone(),
                    timestamp: key.timestamp,
                    value: value.clone(),
                },
            };
            encode_record(&mut buf, &record)?;
        }

        let writer = match inner.writer.as_mut() {
            Some(w) => w,
            None => {
                return Err(TesseraError::Io(
                    "cannot append; log writer gone".into(),
                ))
            }
        };
        writer.write_all(&buf).await?;
        if self.fsync {
            writer.sync_data().await?;
        }
        inner.num_entries += edits.len();
        let want_roll = inner.num_entries > self.max_entries;
        drop(inner);

        if want_roll {
            if let Some(tx) = &self.roll_tx {
                // asynchronous; never blocks the append
                let _ = tx.send(());
            }
        }
        Ok(())
    }

    /// Begins the two-phase cache-flush protocol: takes the flush lock (so
    /// no roll can interleave) and allocates the checkpoint sequence id.
    pub async fn start_cache_flush(&self) -> FlushToken {
        let guard = self.flush_lock.clone().lock_owned().await;
        FlushToken {
            seq: self.obtain_seq_block(1),
            _guard: guard,
        }
    }

    /// Completes a cache flush: appends the flush-complete marker at the
    /// token's sequence id and clears the region's watermark if the flush
    /// covered it. Consuming the token releases the flush lock.
    pub async fn complete_cache_flush(
        &self,
        token: FlushToken,
        region: &str,
        table: &str,
    ) -> Result<(), TesseraError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }

        let record = WalRecord {
            region: region.into(),
            table: table.into(),
            seq: token.seq,
            payload: WalPayload::FlushComplete,
        };
        let mut buf = Vec::new();
        encode_record(&mut buf, &record)?;
        if let Some(writer) = inner.writer.as_mut() {
            writer.write_all(&buf).await?;
            writer.sync_data().await?;
        }
        inner.num_entries += 1;

        if let Some(&watermark) = inner.unflushed.get(region) {
            if token.seq >= watermark {
                inner.unflushed.remove(region);
            }
        }
        drop(inner);
        drop(token);
        Ok(())
    }

    /// Aborts a cache flush: releases the flush lock without writing a
    /// marker. The only recovery for the dropped snapshot is a restart of
    /// the hosting process so the log gets replayed into the memstores.
    pub fn abort_cache_flush(&self, token: FlushToken) {
        drop(token);
    }

    /// Rolls to a new log file. Mutually exclusive with an in-progress
    /// flush. Old files whose highest sequence id predates every region's
    /// unflushed watermark are deleted; with no outstanding watermarks at
    /// all, every old file goes.
    pub async fn roll_writer(&self) -> Result<(), TesseraError> {
        let _flush = self.flush_lock.lock().await;
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }

        if let Some(writer) = inner.writer.take() {
            writer.sync_all().await?;
            let old_path = Self::compute_filename(&self.dir, inner.file_num - 1);
            pf_debug!(
                "closing current log writer '{}' to get a new one",
                old_path.display()
            );
            if inner.num_entries == 0 {
                // nothing was written to it; no region can need it
                fs::remove_file(&old_path).await?;
            } else {
                let boundary = self.next_seq().saturating_sub(1);
                inner.output_files.insert(boundary, old_path);
            }
        }

        let new_path = Self::compute_filename(&self.dir, inner.file_num);
        inner.file_num += 1;
        inner.writer = Some(
            OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&new_path)
                .await?,
        );
        pf_info!("new log writer created at '{}'", new_path.display());

        // reclaim old files no region still needs
        if !inner.output_files.is_empty() {
            let deletable: Vec<SeqId> = match inner.unflushed.values().min() {
                None => {
                    pf_debug!("no unflushed regions; deleting all old log files");
                    inner.output_files.keys().copied().collect()
                }
                Some(&oldest) => inner
                    .output_files
                    .range(..oldest)
                    .map(|(&s, _)| s)
                    .collect(),
            };
            for seqno in deletable {
                if let Some(path) = inner.output_files.remove(&seqno) {
                    pf_info!(
                        "removing old log file '{}' whose highest sequence id is {}",
                        path.display(),
                        seqno
                    );
                    fs::remove_file(&path).await?;
                }
            }
        }

        inner.num_entries = 0;
        Ok(())
    }

    /// Shuts the log down.
    pub async fn close(&self) -> Result<(), TesseraError> {
        let _flush = self.flush_lock.lock().await;
        let mut inner = self.inner.lock().await;
        pf_debug!("closing log writer in '{}'", self.dir.display());
        if let Some(writer) = inner.writer.take() {
            writer.sync_all().await?;
        }
        inner.closed = true;
        Ok(())
    }

    /// Shuts the log down and removes its directory.
    pub async fn close_and_delete(&self) -> Result<(), TesseraError> {
        self.close().await?;
        fs::remove_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Records written to the current log file so far.
    pub async fn num_entries(&self) -> usize {
        self.inner.lock().await.num_entries
    }

    /// Number of retired (non-current) log files still on disk.
    pub async fn num_log_files(&self) -> usize {
        self.inner.lock().await.output_files.len()
    }

    fn compute_filename(dir: &Path, file_num: u64) -> PathBuf {
        dir.join(format!("wal.{:06}", file_num))
    }
}

fn encode_record(buf: &mut Vec<u8>, record: &WalRecord) -> Result<(), TesseraError> {
    let bytes = rmp_serde::to_vec(record)?;
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(&bytes);
    Ok(())
}

/// Reads all records out of one log file, stopping at (and warning about) a
/// truncated tail left by a crash mid-append.
pub async fn read_log_file(path: &Path) -> Result<Vec<WalRecord>, TesseraError> {
    let data = fs::read(path).await?;
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= data.len() {
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&data[offset..offset + 8]);
        let len = u64::from_be_bytes(len_bytes) as usize;
        if offset + 8 + len > data.len() {
            pf_warn!(
                "truncated record at offset {} in '{}'",
                offset,
                path.display()
            );
            break;
        }
        match rmp_serde::from_slice(&data[offset + 8..offset + 8 + len]) {
            Ok(record) => records.push(record),
            Err(e) => {
                pf_warn!(
                    "undecodable record at offset {} in '{}': {}",
                    offset,
                    path.display(),
                    e
                );
                break;
            }
        }
        offset += 8 + len;
    }
    if offset < data.len() {
        pf_warn!(
            "{} trailing bytes ignored in '{}'",
            data.len() - offset,
            path.display()
        );
    }
    Ok(records)
}

/// Splits a dead server's log files, no longer being written to, into one
/// replay log per region under each region's directory. Deletes the source
/// directory when finished. Returns the number of regions that got a replay
/// log.
pub async fn split_log(
    root_dir: &Path,
    src_dir: &Path,
) -> Result<usize, TesseraError> {
    let mut log_files = Vec::new();
    let mut dir = fs::read_dir(src_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        if entry.file_type().await?.is_file() {
            log_files.push(entry.path());
        }
    }
    log_files.sort();
    pf_info!(
        "splitting {} log file(s) in '{}'",
        log_files.len(),
        src_dir.display()
    );

    let mut by_region: HashMap<String, Vec<WalRecord>> = HashMap::new();
    for path in &log_files {
        for record in read_log_file(path).await? {
            by_region.entry(record.region.clone()).or_default().push(record);
        }
    }

    let num_regions = by_region.len();
    for (region, mut records) in by_region {
        records.sort_by_key(|r| r.seq);
        let dir = region_dir(root_dir, encoded_name_of(&region));
        fs::create_dir_all(&dir).await?;
        let logfile = dir.join(OLD_LOG_FILE_NAME);
        pf_debug!("writing replay log '{}'", logfile.display());
        let mut buf = Vec::new();
        for record in &records {
            encode_record(&mut buf, record)?;
        }
        let mut writer = File::create(&logfile).await?;
        writer.write_all(&buf).await?;
        writer.sync_all().await?;
    }

    fs::remove_dir_all(src_dir).await?;
    pf_info!("log file splitting completed for '{}'", src_dir.display());
    Ok(num_regions)
}

/// Renders a textual dump of one log file, one line per record.
pub async fn dump_log(path: &Path) -> Result<Vec<String>, TesseraError> {
    let mut lines = Vec::new();
    for record in read_log_file(path).await? {
        match &record.payload {
            WalPayload::Cell {
                row,
                column,
                timestamp,
                value,
            } => lines.push(format!(
                "{} {} seq={} row={:?} col={} ts={} {}",
                record.region,
                record.table,
                record.seq,
                row,
                column,
                timestamp,
                match value {
                    Some(v) => format!("value[{}B]", v.len()),
                    None => "tombstone".into(),
                },
            )),
            WalPayload::FlushComplete => lines.push(format!(
                "{} {} seq={} FLUSH-COMPLETE",
                record.region, record.table, record.seq
            )),
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod wal_tests {
    use super::*;
    use std::sync::Arc;

    fn edits_for(rows: &[&str]) -> BTreeMap<StoreKey, Option<Bytes>> {
        rows.iter()
            .map(|r| {
                (
                    StoreKey::new(r.as_bytes().to_vec(), "f:c", 1),
                    Some(Bytes::from_static(b"v")),
                )
            })
            .collect()
    }

    async fn all_records(dir: &Path) -> Vec<WalRecord> {
        let mut files = Vec::new();
        let mut rd = fs::read_dir(dir).await.unwrap();
        while let Some(entry) = rd.next_entry().await.unwrap() {
            files.push(entry.path());
        }
        files.sort();
        let mut records = Vec::new();
        for f in files {
            records.extend(read_log_file(&f).await.unwrap());
        }
        records
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sequence_ids_contiguous_under_concurrency() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("log");
        let wal =
            Arc::new(Wal::new_and_setup(&dir, 100_000, false, None).await.unwrap());

        let mut handles = Vec::new();
        for t in 0..8 {
            let wal = wal.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let edits = edits_for(&[
                        &format!("r{}-{}-a", t, i),
                        &format!("r{}-{}-b", t, i),
                        &format!("r{}-{}-c", t, i),
                    ]);
                    wal.append(&format!("region-{}", t), "t", &edits)
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        wal.close().await.unwrap();

        let mut seqs: Vec<SeqId> = all_records(&dir)
            .await
            .into_iter()
            .map(|r| r.seq)
            .collect();
        seqs.sort_unstable();
        let expect: Vec<SeqId> = (0..(8 * 50 * 3)).collect();
        assert_eq!(seqs, expect);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn roll_deletes_only_fully_flushed_files() {
        let tmp = tempfile::tempdir().unwrap();
        let wal = Wal::new_and_setup(tmp.path().join("log"), 100_000, false, None)
            .await
            .unwrap();

        wal.append("ra", "t", &edits_for(&["a1"])).await.unwrap();
        wal.append("rb", "t", &edits_for(&["b1"])).await.unwrap();
        wal.roll_writer().await.unwrap();
        // both regions unflushed: file must survive
        assert_eq!(wal.num_log_files().await, 1);

        // flush only region ra
        let token = wal.start_cache_flush().await;
        let seq = token.seq;
        wal.complete_cache_flush(token, "ra", "t").await.unwrap();
        wal.roll_writer().await.unwrap();
        // rb's watermark still holds the first file back
        assert_eq!(wal.num_log_files().await, 2);

        // flush rb too; everything old is reclaimable
        let token = wal.start_cache_flush().await;
        assert!(token.seq > seq);
        wal.complete_cache_flush(token, "rb", "t").await.unwrap();
        wal.roll_writer().await.unwrap();
        assert_eq!(wal.num_log_files().await, 0);

        wal.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn append_after_close_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let wal = Wal::new_and_setup(tmp.path().join("log"), 10, false, None)
            .await
            .unwrap();
        wal.close().await.unwrap();
        assert!(matches!(
            wal.append("r", "t", &edits_for(&["a"])).await,
            Err(TesseraError::Io(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_flush_writes_no_marker_and_unblocks_roll() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("log");
        let wal = Wal::new_and_setup(&dir, 100_000, false, None).await.unwrap();

        wal.append("ra", "t", &edits_for(&["a1"])).await.unwrap();
        let token = wal.start_cache_flush().await;
        wal.abort_cache_flush(token);
        // roll must not be blocked by the aborted flush
        wal.roll_writer().await.unwrap();
        wal.close().await.unwrap();

        let markers = all_records(&dir)
            .await
            .into_iter()
            .filter(|r| r.payload == WalPayload::FlushComplete)
            .count();
        assert_eq!(markers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn roll_threshold_signals_listener() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let wal = Wal::new_and_setup(tmp.path().join("log"), 2, false, Some(tx))
            .await
            .unwrap();
        wal.append("ra", "t", &edits_for(&["a1", "a2", "a3"]))
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());
        wal.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn split_log_groups_records_per_region() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let logdir = root.join("log_dead_server");
        let wal = Wal::new_and_setup(&logdir, 100_000, false, None)
            .await
            .unwrap();

        wal.append("region-a", "t", &edits_for(&["a1", "a2"]))
            .await
            .unwrap();
        wal.append("region-b", "t", &edits_for(&["b1"])).await.unwrap();
        wal.roll_writer().await.unwrap();
        wal.append("region-a", "t", &edits_for(&["a3"])).await.unwrap();
        wal.close().await.unwrap();

        let n = split_log(&root, &logdir).await.unwrap();
        assert_eq!(n, 2);
        assert!(!logdir.exists());

        let a_log = region_dir(&root, encoded_name_of("region-a"))
            .join(OLD_LOG_FILE_NAME);
        let recs = read_log_file(&a_log).await.unwrap();
        assert_eq!(recs.len(), 3);
        assert!(recs.iter().all(|r| r.region == "region-a"));
        assert!(recs.windows(2).all(|w| w[0].seq < w[1].seq));
    }
}
