//! Storage-server-side functionality modules: the shared write-ahead log,
//! per-family stores, the region container, and the hosting context.

use std::path::{Path, PathBuf};

mod wal;
mod memstore;
mod store;
mod region;
mod host;

pub use host::{RegionHost, ServerConfig};
pub use region::{
    BatchOperation, BatchUpdate, Region, RegionScanner,
    RegionUnavailableListener,
};
pub use store::{dir_has_reference_to, family_dir, FamilyStore, StoreSize};
pub use wal::{
    dump_log, read_log_file, split_log, FlushToken, SeqId, Wal, WalPayload,
    WalRecord,
};

pub(crate) use memstore::MemStore;

/// Name of the per-region replay log produced by splitting a dead server's
/// write-ahead log.
pub const OLD_LOG_FILE_NAME: &str = "oldlogfile.log";

/// Name of the transient staging directory used while splitting a region.
pub const SPLITS_DIR_NAME: &str = "splits";

/// Name of the transient staging directory reserved for region merges.
pub const MERGES_DIR_NAME: &str = "merges";

/// Directory holding one region's stores and replay log.
pub fn region_dir(root: &Path, encoded: u32) -> PathBuf {
    root.join(format!("region_{}", encoded))
}

/// Directory holding one server's write-ahead log files.
pub fn log_dir(root: &Path, address: &str, start_code: u64) -> PathBuf {
    let safe = address.replace([':', '/'], "_");
    root.join(format!("log_{}_{}", safe, start_code))
}
