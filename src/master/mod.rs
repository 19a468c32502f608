//! Master-side functionality modules: catalog access, region assignment,
//! server tracking, and the master daemon tying them together.

use crate::descriptors::RegionInfo;
use crate::utils::TesseraError;

mod catalog;
mod region_manager;
mod server_manager;
mod daemon;

pub use catalog::{
    CatalogAccess, CatalogEntry, LocalCatalog, COL_REGIONINFO, COL_SERVER,
    COL_SPLIT_A, COL_SPLIT_B, COL_STARTCODE,
};
pub use daemon::Master;
pub use region_manager::RegionManager;
pub use server_manager::ServerManager;

/// Master configuration. Overridable from a TOML string through
/// `parsed_config!`.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterConfig {
    /// Storage-server lease length and check frequency.
    pub lease_period_ms: u64,
    pub lease_check_interval_ms: u64,

    /// Period of the root/meta catalog scanner chores.
    pub catalog_scan_interval_ms: u64,

    /// How long an assignment offer may go unacknowledged before the
    /// region is offered again.
    pub max_region_open_time_ms: u64,

    /// Bounded retries (with doubling backoff) for catalog mutations.
    pub catalog_retries: usize,
    pub retry_backoff_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            lease_period_ms: 30_000,
            lease_check_interval_ms: 15_000,
            catalog_scan_interval_ms: 60_000,
            max_region_open_time_ms: 30_000,
            catalog_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl MasterConfig {
    /// Composes a config from defaults overlaid with a TOML string.
    pub fn parsed(config_str: Option<&str>) -> Result<Self, TesseraError> {
        parsed_config!(config_str => MasterConfig;
                       lease_period_ms, lease_check_interval_ms,
                       catalog_scan_interval_ms, max_region_open_time_ms,
                       catalog_retries, retry_backoff_ms)
    }
}

/// One queued unit of master work, drained by the to-do worker. Operations
/// are idempotent: a transiently failing operation is re-queued whole.
#[derive(Debug, Clone)]
pub enum MasterOp {
    /// A server died or was superseded: split its write-ahead log into
    /// per-region replay logs, then release every region it was serving.
    ServerShutdown { address: String, start_code: u64 },

    /// A server confirmed a region open: record the location in the
    /// catalog.
    RegionOpened {
        info: RegionInfo,
        server: String,
        start_code: u64,
    },

    /// A region was closed: update the catalog and decide its future.
    RegionClosed {
        info: RegionInfo,
        offline: bool,
        reassign: bool,
    },

    /// A region split: rewrite the parent's catalog row and add daughter
    /// rows.
    RegionSplit {
        parent: RegionInfo,
        daughter_a: RegionInfo,
        daughter_b: RegionInfo,
    },
}
