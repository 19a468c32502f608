//! One column family's store: flushed store files plus the in-memory
//! mutation buffer, with compaction and split-reference support.
//!
//! Store files are immutable once written. A file is either a flat file
//! (sorted cells, written by a cache flush or a compaction) or a reference:
//! a lightweight pointer to the top or bottom half of a pre-split parent
//! file, created during a region split instead of copying data. References
//! are resolved by reading only the qualifying half of the parent file, and
//! are replaced with rewritten standalone files only by a later compaction.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::ops::Bound::{Included, Unbounded};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};

use crate::descriptors::FamilyDescriptor;
use crate::keys::{column_matches, StoreKey};
use crate::server::wal::SeqId;
use crate::server::{region_dir, MemStore};
use crate::utils::TesseraError;

use bytes::Bytes;

use rand::Rng;

use serde::{Deserialize, Serialize};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Which half of the parent file a reference covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefHalf {
    /// Rows below the split key.
    Bottom,
    /// Rows at or above the split key.
    Top,
}

/// On-disk payload of a reference file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reference {
    parent_encoded: u32,
    parent_file: u64,
    mid_key: Bytes,
    half: RefHalf,
}

/// On-disk payload of a flat store file.
#[derive(Debug, Serialize, Deserialize)]
struct FlatPayload {
    /// Highest write-ahead-log sequence id reflected in this file.
    max_seq: SeqId,
    cells: Vec<(StoreKey, Option<Bytes>)>,
}

/// One loaded store file.
struct StoreFile {
    id: u64,
    path: PathBuf,
    max_seq: SeqId,
    is_reference: bool,
    disk_size: u64,
    cells: BTreeMap<StoreKey, Option<Bytes>>,
}

/// Size report of one store, used by the split decision.
#[derive(Debug, Clone)]
pub struct StoreSize {
    /// Sum of this store's file sizes in bytes.
    pub aggregate: u64,

    /// Middle row of the largest file, the candidate split key.
    pub mid_key: Option<Bytes>,

    /// False while the store holds unresolved reference files; a region
    /// with references cannot be split again.
    pub splitable: bool,
}

/// The store of one column family within one region.
pub struct FamilyStore {
    root_dir: PathBuf,
    family: FamilyDescriptor,
    dir: PathBuf,

    mem: StdMutex<MemStore>,

    /// Flushed files, oldest first (by max sequence id, then id).
    files: StdRwLock<Vec<StoreFile>>,

    /// Highest flushed sequence id across the files.
    max_seq: AtomicU64,

    /// File count past which compaction is wanted.
    compaction_threshold: usize,

    compact_lock: Mutex<()>,
}

/// Directory of one family's store files within a region directory.
pub fn family_dir(region_dir: &Path, family: &str) -> PathBuf {
    region_dir.join(family)
}

/// True if any file in the given family directory is a reference back to
/// the parent region with the given encoded name. Used by the master's
/// split-parent cleanup, which must not delete a parent while a daughter
/// still reads through it.
pub async fn dir_has_reference_to(
    family_dir: &Path,
    parent_encoded: u32,
) -> Result<bool, TesseraError> {
    if !fs::try_exists(family_dir).await? {
        return Ok(false);
    }
    let suffix = format!(".{}.ref", parent_encoded);
    let mut dir = fs::read_dir(family_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        if entry.file_name().to_string_lossy().ends_with(&suffix) {
            return Ok(true);
        }
    }
    Ok(false)
}

impl FamilyStore {
    /// Opens the store under `<region_dir>/<family>`, loading every store
    /// file found there. Reference files are resolved against their parent
    /// region's directory, reading only the qualifying half.
    pub async fn open(
        root_dir: impl Into<PathBuf>,
        region_dir: &Path,
        family: FamilyDescriptor,
        compaction_threshold: usize,
    ) -> Result<Self, TesseraError> {
        let root_dir = root_dir.into();
        let dir = family_dir(region_dir, &family.name);
        fs::create_dir_all(&dir).await?;

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            let parts: Vec<&str> = name.split('.').collect();
            match parts.as_slice() {
                [id, "sf"] => {
                    let id: u64 = id.parse()?;
                    files.push(load_flat_file(id, &path).await?);
                }
                [id, _parent, "ref"] => {
                    let id: u64 = id.parse()?;
                    files.push(
                        load_reference_file(&root_dir, &family.name, id, &path)
                            .await?,
                    );
                }
                _ => {
                    pf_warn!("skipping unrecognized store file '{}'", name);
                }
            }
        }
        files.sort_by_key(|f| (f.max_seq, f.id));
        let max_seq = files.iter().map(|f| f.max_seq).max().unwrap_or(0);
        pf_debug!(
            "loaded {} store file(s) for family '{}', max sequence id {}",
            files.len(),
            family.name,
            max_seq
        );

        Ok(FamilyStore {
            root_dir,
            family,
            dir,
            mem: StdMutex::new(MemStore::new()),
            files: StdRwLock::new(files),
            max_seq: AtomicU64::new(max_seq),
            compaction_threshold,
            compact_lock: Mutex::new(()),
        })
    }

    pub fn family_name(&self) -> &str {
        &self.family.name
    }

    /// Buffers one cell version in the memstore. Returns the change in the
    /// memstore's heap footprint.
    pub fn add(&self, key: StoreKey, value: Option<Bytes>) -> usize {
        self.mem.lock().unwrap().add(key, value)
    }

    pub fn mem_size(&self) -> usize {
        self.mem.lock().unwrap().size()
    }

    /// Freezes the memstore into its snapshot slot. Caller must be holding
    /// the region's update lock so no batch is split across the swap.
    pub fn snapshot_memstore(&self) -> Result<(), TesseraError> {
        self.mem.lock().unwrap().snapshot()
    }

    /// Writes the frozen snapshot to a new store file stamped with the
    /// flush's checkpoint sequence id. Returns false if the snapshot was
    /// empty. The snapshot stays readable until the file is durable.
    pub async fn flush_cache(&self, seq: SeqId) -> Result<bool, TesseraError> {
        let data = self.mem.lock().unwrap().snapshot_data();
        if data.is_empty() {
            return Ok(false);
        }

        let id: u64 = rand::thread_rng().gen();
        let payload = FlatPayload {
            max_seq: seq,
            cells: data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let path = self.dir.join(format!("{}.sf", id));
        let disk_size = write_payload_atomic(&path, &payload).await?;

        {
            let mut files = self.files.write().unwrap();
            files.push(StoreFile {
                id,
                path,
                max_seq: seq,
                is_reference: false,
                disk_size,
                cells: data,
            });
            files.sort_by_key(|f| (f.max_seq, f.id));
        }
        self.max_seq.fetch_max(seq, Ordering::SeqCst);
        self.mem.lock().unwrap().clear_snapshot();
        pf_debug!(
            "flushed family '{}' to store file at sequence id {}",
            self.family.name,
            seq
        );
        Ok(true)
    }

    /// Point read: up to `versions` visible values of one cell at or before
    /// the key's timestamp, newest first.
    pub fn get(&self, key: &StoreKey, versions: usize) -> Vec<Bytes> {
        let mut picks: BTreeMap<Reverse<u64>, Option<Bytes>> = BTreeMap::new();
        self.fold_sources(|cells| {
            collect_versions(cells, key, &mut picks);
        });
        picks
            .into_values()
            .flatten()
            .take(versions)
            .collect()
    }

    /// The visible version keys of one cell at or before the origin's
    /// timestamp, newest first, up to `versions`.
    pub fn get_keys(&self, origin: &StoreKey, versions: usize) -> Vec<StoreKey> {
        let mut picks: BTreeMap<Reverse<u64>, Option<Bytes>> = BTreeMap::new();
        self.fold_sources(|cells| {
            collect_versions(cells, origin, &mut picks);
        });
        picks
            .into_iter()
            .filter(|(_, v)| v.is_some())
            .map(|(Reverse(ts), _)| {
                StoreKey::new(origin.row.clone(), origin.column.clone(), ts)
            })
            .take(versions)
            .collect()
    }

    /// Adds this family's visible cells of one row (newest version at or
    /// before `ts` per column) into `results`.
    pub fn get_full(
        &self,
        row: &[u8],
        ts: u64,
        results: &mut BTreeMap<String, Bytes>,
    ) {
        let mut merged: BTreeMap<StoreKey, Option<Bytes>> = BTreeMap::new();
        self.fold_sources(|cells| {
            let start = StoreKey::new(row.to_vec(), "", u64::MAX);
            for (k, v) in cells.range((Included(start), Unbounded)) {
                if k.row.as_ref() != row {
                    break;
                }
                merged.insert(k.clone(), v.clone());
            }
        });
        let mut current: Option<String> = None;
        for (k, v) in merged {
            if k.timestamp > ts {
                continue;
            }
            if current.as_deref() == Some(k.column.as_str()) {
                continue; // newest visible version already decided
            }
            current = Some(k.column.clone());
            if let Some(value) = v {
                results.insert(k.column, value);
            }
        }
    }

    /// Materializes this store's visible cells matching the column
    /// selectors, from `first_row` on, at or before `ts`. One entry per
    /// (row, column): the newest visible version. Tombstoned cells are
    /// omitted.
    pub fn scan_cells(
        &self,
        selectors: &[String],
        first_row: &[u8],
        ts: u64,
    ) -> Vec<(StoreKey, Bytes)> {
        let mut merged: BTreeMap<StoreKey, Option<Bytes>> = BTreeMap::new();
        self.fold_sources(|cells| {
            for (k, v) in cells {
                if k.row.as_ref() < first_row || k.timestamp > ts {
                    continue;
                }
                if !selectors.iter().any(|s| column_matches(s, &k.column)) {
                    continue;
                }
                merged.insert(k.clone(), v.clone());
            }
        });

        let mut out = Vec::new();
        let mut current: Option<(Bytes, String)> = None;
        for (k, v) in merged {
            let cell = (k.row.clone(), k.column.clone());
            if current.as_ref() == Some(&cell) {
                continue;
            }
            current = Some(cell);
            if let Some(value) = v {
                out.push((k, value));
            }
        }
        out
    }

    /// Runs `f` over every cell source from oldest to newest, so that later
    /// sources overwrite earlier ones on exact-key collisions: files in
    /// flush order, then the flush snapshot, then the live memstore.
    fn fold_sources(
        &self,
        mut f: impl FnMut(&BTreeMap<StoreKey, Option<Bytes>>),
    ) {
        let files = self.files.read().unwrap();
        for file in files.iter() {
            f(&file.cells);
        }
        let mem = self.mem.lock().unwrap();
        f(mem.snapshot_cells());
        f(mem.live_cells());
    }

    pub fn needs_compaction(&self) -> bool {
        self.files.read().unwrap().len() >= self.compaction_threshold
    }

    /// Compacts all current store files into one flat file, resolving any
    /// reference files, dropping tombstones and versions beyond the
    /// family's retention. Returns false if there was nothing to do. Safe
    /// to run concurrently with flushes and reads; a flush landing during
    /// the rewrite keeps its file.
    pub async fn compact(&self) -> Result<bool, TesseraError> {
        let _c = self.compact_lock.lock().await;

        let (input_ids, input_paths, merged, max_seq, had_refs) = {
            let files = self.files.read().unwrap();
            let had_refs = files.iter().any(|f| f.is_reference);
            if files.len() < self.compaction_threshold && !had_refs {
                return Ok(false);
            }
            if files.is_empty() {
                return Ok(false);
            }
            let mut merged: BTreeMap<StoreKey, Option<Bytes>> = BTreeMap::new();
            for file in files.iter() {
                for (k, v) in &file.cells {
                    merged.insert(k.clone(), v.clone());
                }
            }
            (
                files.iter().map(|f| f.id).collect::<Vec<_>>(),
                files.iter().map(|f| f.path.clone()).collect::<Vec<_>>(),
                merged,
                files.iter().map(|f| f.max_seq).max().unwrap_or(0),
                had_refs,
            )
        };
        pf_debug!(
            "compacting {} file(s) of family '{}' (references: {})",
            input_ids.len(),
            self.family.name,
            had_refs
        );

        let retained =
            retain_versions(merged, self.family.max_versions as usize);

        let id: u64 = rand::thread_rng().gen();
        let payload = FlatPayload {
            max_seq,
            cells: retained
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let path = self.dir.join(format!("{}.sf", id));
        let disk_size = write_payload_atomic(&path, &payload).await?;

        {
            let mut files = self.files.write().unwrap();
            files.retain(|f| !input_ids.contains(&f.id));
            files.push(StoreFile {
                id,
                path,
                max_seq,
                is_reference: false,
                disk_size,
                cells: retained,
            });
            files.sort_by_key(|f| (f.max_seq, f.id));
        }
        for path in input_paths {
            fs::remove_file(&path).await?;
        }
        Ok(true)
    }

    /// Size report used by the split decision.
    pub fn size(&self) -> StoreSize {
        let files = self.files.read().unwrap();
        let aggregate = files.iter().map(|f| f.disk_size).sum();
        let splitable = !files.iter().any(|f| f.is_reference);
        let mid_key = files
            .iter()
            .max_by_key(|f| f.disk_size)
            .and_then(|f| f.cells.keys().nth(f.cells.len() / 2))
            .map(|k| k.row.clone());
        StoreSize {
            aggregate,
            mid_key,
            splitable,
        }
    }

    pub fn max_sequence_id(&self) -> SeqId {
        self.max_seq.load(Ordering::SeqCst)
    }

    /// Writes top/bottom reference files for every store file into the two
    /// daughter family directories under the splits staging directory. The
    /// caller guarantees this store holds no references itself.
    pub async fn write_split_references(
        &self,
        splits_dir: &Path,
        parent_encoded: u32,
        daughter_a_encoded: u32,
        daughter_b_encoded: u32,
        mid_key: &Bytes,
    ) -> Result<(), TesseraError> {
        let files = {
            let files = self.files.read().unwrap();
            files.iter().map(|f| f.id).collect::<Vec<_>>()
        };
        for parent_file in files {
            for (daughter, half) in [
                (daughter_a_encoded, RefHalf::Bottom),
                (daughter_b_encoded, RefHalf::Top),
            ] {
                let dir = family_dir(
                    &region_dir(splits_dir, daughter),
                    &self.family.name,
                );
                fs::create_dir_all(&dir).await?;
                let id: u64 = rand::thread_rng().gen();
                let reference = Reference {
                    parent_encoded,
                    parent_file,
                    mid_key: mid_key.clone(),
                    half,
                };
                let path =
                    dir.join(format!("{}.{}.ref", id, parent_encoded));
                let bytes = rmp_serde::to_vec(&reference)?;
                let mut writer = fs::File::create(&path).await?;
                writer.write_all(&bytes).await?;
                writer.sync_all().await?;
            }
        }
        Ok(())
    }

    /// Shuts the store down, returning the paths of its files.
    pub fn close(&self) -> Vec<PathBuf> {
        let files = self.files.read().unwrap();
        files.iter().map(|f| f.path.clone()).collect()
    }
}

/// Applies version retention to a fully merged cell map: per (row, column),
/// keep at most `max_versions` visible values, newest first, and drop
/// tombstones entirely (a full-store compaction has nothing left for them
/// to mask).
fn retain_versions(
    merged: BTreeMap<StoreKey, Option<Bytes>>,
    max_versions: usize,
) -> BTreeMap<StoreKey, Option<Bytes>> {
    let mut out = BTreeMap::new();
    let mut current: Option<(Bytes, String)> = None;
    let mut kept = 0usize;
    for (k, v) in merged {
        let cell = (k.row.clone(), k.column.clone());
        if current.as_ref() != Some(&cell) {
            current = Some(cell);
            kept = 0;
        }
        if let Some(value) = v {
            if kept < max_versions {
                out.insert(k, Some(value));
                kept += 1;
            }
        }
    }
    out
}

fn collect_versions(
    cells: &BTreeMap<StoreKey, Option<Bytes>>,
    origin: &StoreKey,
    picks: &mut BTreeMap<Reverse<u64>, Option<Bytes>>,
) {
    let from = StoreKey::new(
        origin.row.clone(),
        origin.column.clone(),
        origin.timestamp,
    );
    let to = StoreKey::new(origin.row.clone(), origin.column.clone(), 0);
    for (k, v) in cells.range(from..=to) {
        picks.insert(Reverse(k.timestamp), v.clone());
    }
}

async fn write_payload_atomic(
    path: &Path,
    payload: &FlatPayload,
) -> Result<u64, TesseraError> {
    let bytes = rmp_serde::to_vec(payload)?;
    let tmp = path.with_extension("tmp");
    let mut writer = fs::File::create(&tmp).await?;
    writer.write_all(&bytes).await?;
    writer.sync_all().await?;
    drop(writer);
    fs::rename(&tmp, path).await?;
    Ok(bytes.len() as u64)
}

async fn load_flat_file(
    id: u64,
    path: &Path,
) -> Result<StoreFile, TesseraError> {
    let bytes = fs::read(path).await?;
    let payload: FlatPayload = rmp_serde::from_slice(&bytes)?;
    Ok(StoreFile {
        id,
        path: path.to_path_buf(),
        max_seq: payload.max_seq,
        is_reference: false,
        disk_size: bytes.len() as u64,
        cells: payload.cells.into_iter().collect(),
    })
}

async fn load_reference_file(
    root_dir: &Path,
    family: &str,
    id: u64,
    path: &Path,
) -> Result<StoreFile, TesseraError> {
    let bytes = fs::read(path).await?;
    let reference: Reference = rmp_serde::from_slice(&bytes)?;

    let parent_path =
        family_dir(&region_dir(root_dir, reference.parent_encoded), family)
            .join(format!("{}.sf", reference.parent_file));
    let parent_bytes = fs::read(&parent_path).await?;
    let parent: FlatPayload = rmp_serde::from_slice(&parent_bytes)?;

    let cells: BTreeMap<StoreKey, Option<Bytes>> = parent
        .cells
        .into_iter()
        .filter(|(k, _)| match reference.half {
            RefHalf::Bottom => k.row < reference.mid_key,
            RefHalf::Top => k.row >= reference.mid_key,
        })
        .collect();

    Ok(StoreFile {
        id,
        path: path.to_path_buf(),
        max_seq: parent.max_seq,
        is_reference: true,
        disk_size: parent_bytes.len() as u64 / 2,
        cells,
    })
}
