//! Messages exchanged between storage servers and the master on each
//! heartbeat, plus the server identity/load records the master keeps.

use crate::descriptors::RegionInfo;

use serde::{Deserialize, Serialize};

/// Load statistics a storage server submits with its report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLoad {
    /// Number of regions currently served.
    pub regions: u32,

    /// Aggregate unflushed memstore bytes.
    pub memstore_bytes: u64,
}

/// Identity and load of one storage server. The start code is a
/// monotonically-distinguishing nonce taken at process start, so the master
/// can tell a restarted server apart from its previous incarnation at the
/// same address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub address: String,
    pub start_code: u64,
    pub load: ServerLoad,
}

impl ServerInfo {
    pub fn new(address: impl Into<String>, start_code: u64) -> Self {
        ServerInfo {
            address: address.into(),
            start_code,
            load: ServerLoad::default(),
        }
    }

    /// The key under which the master tracks this server.
    pub fn server_name(&self) -> &str {
        &self.address
    }
}

/// One instruction or report riding on a heartbeat, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionMsg {
    /// Master -> server: open and serve this region.
    OpenRegion(RegionInfo),

    /// Master -> server: stop serving this region. If `report` is false the
    /// close must not be reported back (duplicate-assignment cleanup).
    CloseRegion { info: RegionInfo, report: bool },

    /// Master -> server: this master does not know you; run startup again.
    CallServerStartup,

    /// Master -> server: shut down for good.
    StopServer,

    /// Server -> master: region is now open and serving.
    ReportOpen(RegionInfo),

    /// Server -> master: region has been closed.
    ReportClose(RegionInfo),

    /// Server -> master: region was split locally; the parent is offline and
    /// the two daughters need catalog rows and assignment.
    ReportSplit {
        parent: RegionInfo,
        daughter_a: RegionInfo,
        daughter_b: RegionInfo,
    },

    /// Server -> master (first message of a report): shutting down cleanly;
    /// the remaining messages list the regions that were being served.
    ReportExiting,
}
