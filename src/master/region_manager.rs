//! Master-side region assignment bookkeeping and catalog reconciliation.
//!
//! Regions are discovered by scanning the catalog: every row is compared
//! against the live server set, and a region whose recorded server is gone,
//! restarted, or never recorded gets marked unassigned. Unassigned regions
//! are handed out on heartbeats, bounded per server, and re-offered only
//! after an assignment attempt has gone unacknowledged past a deadline. A
//! region already unassigned or pending open acknowledgment is never
//! double-scheduled, even if its catalog row looks stale.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use crate::descriptors::RegionInfo;
use crate::master::catalog::{CatalogAccess, CatalogEntry};
use crate::master::MasterConfig;
use crate::msgs::{RegionMsg, ServerInfo};
use crate::server::{dir_has_reference_to, family_dir, region_dir, Region};
use crate::utils::TesseraError;

use bytes::Bytes;

use tokio::time::{Duration, Instant};

struct UnassignedRegion {
    info: RegionInfo,

    /// When we last offered this region to a server; `None` if never.
    last_attempt: Option<Instant>,
}

struct OnlineMeta {
    name: String,
    server: String,
}

/// The master's record of region assignment state.
pub struct RegionManager {
    config: Arc<MasterConfig>,

    /// Regions needing a server, by region name.
    unassigned: StdMutex<BTreeMap<String, UnassignedRegion>>,

    /// Regions a server reported open, awaiting the catalog location write;
    /// maps region name to the opening server so a server death releases
    /// them.
    pending: StdMutex<HashMap<String, (String, RegionInfo)>>,

    /// Close instructions waiting for each server's next heartbeat.
    to_close: StdMutex<HashMap<String, HashMap<String, RegionInfo>>>,

    /// Regions queued for close (table disable/delete); not reassigned.
    queued_close: StdMutex<HashSet<String>>,

    /// Regions queued for deletion once closed.
    to_delete: StdMutex<HashSet<String>>,

    /// Where the root catalog region is currently served.
    root_location: StdRwLock<Option<String>>,

    /// Online meta catalog regions by start key.
    online_metas: StdMutex<BTreeMap<Bytes, OnlineMeta>>,
}

impl RegionManager {
    pub fn new(config: Arc<MasterConfig>) -> Self {
        RegionManager {
            config,
            unassigned: StdMutex::new(BTreeMap::new()),
            pending: StdMutex::new(HashMap::new()),
            to_close: StdMutex::new(HashMap::new()),
            queued_close: StdMutex::new(HashSet::new()),
            to_delete: StdMutex::new(HashSet::new()),
            root_location: StdRwLock::new(None),
            online_metas: StdMutex::new(BTreeMap::new()),
        }
    }

    //
    // unassigned / pending bookkeeping
    //

    /// Marks a region unassigned, unless it is already unassigned or
    /// pending open acknowledgment (never double-schedule).
    pub fn set_unassigned(&self, info: RegionInfo) {
        if self.pending.lock().unwrap().contains_key(info.region_name()) {
            return;
        }
        let mut unassigned = self.unassigned.lock().unwrap();
        if !unassigned.contains_key(info.region_name()) {
            pf_debug!("region unassigned: '{}'", info.region_name());
            unassigned.insert(
                info.region_name().to_string(),
                UnassignedRegion {
                    info,
                    last_attempt: None,
                },
            );
        }
    }

    pub fn is_unassigned(&self, region_name: &str) -> bool {
        self.unassigned.lock().unwrap().contains_key(region_name)
    }

    pub fn no_longer_unassigned(&self, region_name: &str) {
        self.unassigned.lock().unwrap().remove(region_name);
    }

    pub fn num_unassigned(&self) -> usize {
        self.unassigned.lock().unwrap().len()
    }

    /// Marks a region as opened on a server, awaiting its catalog location
    /// write.
    pub fn set_pending(&self, info: RegionInfo, server: &str) {
        self.pending.lock().unwrap().insert(
            info.region_name().to_string(),
            (server.to_string(), info),
        );
    }

    pub fn is_pending(&self, region_name: &str) -> bool {
        self.pending.lock().unwrap().contains_key(region_name)
    }

    pub fn no_longer_pending(&self, region_name: &str) {
        self.pending.lock().unwrap().remove(region_name);
    }

    /// Removes and returns the regions pending open acknowledgment on one
    /// server; used when that server dies mid-open.
    pub fn take_pending_on_server(&self, server: &str) -> Vec<RegionInfo> {
        let mut pending = self.pending.lock().unwrap();
        let names: Vec<String> = pending
            .iter()
            .filter(|(_, (s, _))| s == server)
            .map(|(name, _)| name.clone())
            .collect();
        names
            .into_iter()
            .filter_map(|name| pending.remove(&name).map(|(_, info)| info))
            .collect()
    }

    //
    // close / delete bookkeeping
    //

    /// Queues a close instruction for a region on a specific server,
    /// delivered on that server's next heartbeat.
    pub fn mark_to_close(&self, server: &str, info: RegionInfo) {
        self.queued_close
            .lock()
            .unwrap()
            .insert(info.region_name().to_string());
        self.to_close
            .lock()
            .unwrap()
            .entry(server.to_string())
            .or_default()
            .insert(info.region_name().to_string(), info);
    }

    pub fn is_marked_to_close(&self, server: &str, region_name: &str) -> bool {
        self.to_close
            .lock()
            .unwrap()
            .get(server)
            .map_or(false, |m| m.contains_key(region_name))
    }

    /// Takes the close instructions queued for one server.
    pub fn remove_marked_to_close(&self, server: &str) -> Vec<RegionInfo> {
        self.to_close
            .lock()
            .unwrap()
            .remove(server)
            .map(|m| m.into_values().collect())
            .unwrap_or_default()
    }

    pub fn is_queued_close(&self, region_name: &str) -> bool {
        self.queued_close.lock().unwrap().contains(region_name)
    }

    pub fn done_closing(&self, region_name: &str) {
        self.queued_close.lock().unwrap().remove(region_name);
    }

    pub fn mark_to_delete(&self, region_name: &str) {
        self.to_delete
            .lock()
            .unwrap()
            .insert(region_name.to_string());
    }

    pub fn is_marked_to_delete(&self, region_name: &str) -> bool {
        self.to_delete.lock().unwrap().contains(region_name)
    }

    pub fn done_deleting(&self, region_name: &str) {
        self.to_delete.lock().unwrap().remove(region_name);
    }

    //
    // root and meta locations
    //

    pub fn set_root_location(&self, server: Option<String>) {
        *self.root_location.write().unwrap() = server;
    }

    pub fn root_location(&self) -> Option<String> {
        self.root_location.read().unwrap().clone()
    }

    pub fn set_meta_online(&self, info: &RegionInfo, server: &str) {
        self.online_metas.lock().unwrap().insert(
            info.start_key.clone(),
            OnlineMeta {
                name: info.region_name().to_string(),
                server: server.to_string(),
            },
        );
    }

    pub fn offline_meta(&self, start_key: &Bytes) {
        self.online_metas.lock().unwrap().remove(start_key);
    }

    /// Names of all currently online meta regions.
    pub fn online_meta_names(&self) -> Vec<String> {
        self.online_metas
            .lock()
            .unwrap()
            .values()
            .map(|m| m.name.clone())
            .collect()
    }

    /// The online meta region whose key range covers the given region name
    /// (region names are the catalog's row keys).
    pub fn meta_region_covering(&self, region_name: &str) -> Option<String> {
        let metas = self.online_metas.lock().unwrap();
        metas
            .range(..=Bytes::copy_from_slice(region_name.as_bytes()))
            .next_back()
            .map(|(_, m)| m.name.clone())
    }

    /// Servers of online meta regions (used to skip reassignment races).
    pub fn meta_servers(&self) -> Vec<String> {
        self.online_metas
            .lock()
            .unwrap()
            .values()
            .map(|m| m.server.clone())
            .collect()
    }

    //
    // assignment
    //

    /// Hands out unassigned regions to a reporting server: up to
    /// `ceil(unassigned / live_servers)` per heartbeat, and an individual
    /// region only if its last offer is older than the max-open-time
    /// deadline (covers servers that accept an open but never confirm).
    /// Eligible servers are simply served in heartbeat arrival order.
    pub fn assign_regions(
        &self,
        server: &ServerInfo,
        live_servers: usize,
        msgs: &mut Vec<RegionMsg>,
    ) {
        let mut unassigned = self.unassigned.lock().unwrap();
        if unassigned.is_empty() {
            return;
        }
        let target = unassigned.len().div_ceil(live_servers.max(1));
        let deadline = Duration::from_millis(self.config.max_region_open_time_ms);
        let now = Instant::now();

        let mut handed = 0;
        for entry in unassigned.values_mut() {
            let due = entry
                .last_attempt
                .map_or(true, |at| now.duration_since(at) > deadline);
            if due {
                pf_debug!(
                    "assigning region '{}' to server '{}'",
                    entry.info.region_name(),
                    server.address
                );
                msgs.push(RegionMsg::OpenRegion(entry.info.clone()));
                entry.last_attempt = Some(now);
                handed += 1;
            }
            if handed >= target {
                break;
            }
        }
    }

    //
    // catalog reconciliation
    //

    /// Reconciles one catalog row against the live server set.
    pub fn check_assigned(
        &self,
        entry: &CatalogEntry,
        servers: &HashMap<String, ServerInfo>,
    ) {
        let info = &entry.info;
        let name = info.region_name();

        if info.offline
            || self.is_queued_close(name)
            || self.is_marked_to_delete(name)
        {
            self.unassigned.lock().unwrap().remove(name);
            pf_debug!("not assigning region '{}'", name);
            return;
        }
        if let Some(server) = &entry.server {
            if self.is_marked_to_close(server, name) {
                pf_debug!("not assigning region '{}' (on close list)", name);
                return;
            }
        }
        if self.is_unassigned(name) || self.is_pending(name) {
            // already scheduled; a stale catalog row must not reschedule
            return;
        }

        let valid = match (&entry.server, entry.start_code) {
            (Some(server), Some(start_code)) => servers
                .get(server)
                .map_or(false, |si| si.start_code == start_code),
            _ => false,
        };
        if !valid {
            self.set_unassigned(info.clone());
        }
    }

    /// Scans one catalog region: reconciles every row, tracks online meta
    /// regions when scanning root, and garbage-collects split parents whose
    /// daughters no longer reference them. Idempotent and safe to repeat.
    pub async fn scan_one(
        &self,
        catalog: &dyn CatalogAccess,
        catalog_region: &str,
        is_root: bool,
        servers: &HashMap<String, ServerInfo>,
        root_dir: &Path,
    ) -> Result<usize, TesseraError> {
        let entries = catalog.scan_catalog(catalog_region).await?;
        for entry in &entries {
            if entry.info.split {
                self.maybe_cleanup_split_parent(
                    catalog,
                    catalog_region,
                    root_dir,
                    entry,
                )
                .await?;
                continue;
            }
            if is_root && entry.info.is_meta_table() {
                match (&entry.server, entry.start_code) {
                    (Some(server), Some(sc))
                        if servers
                            .get(server)
                            .map_or(false, |si| si.start_code == sc) =>
                    {
                        self.set_meta_online(&entry.info, server);
                    }
                    _ => self.offline_meta(&entry.info.start_key),
                }
            }
            self.check_assigned(entry, servers);
        }
        pf_debug!(
            "scan of catalog region '{}' complete, {} row(s)",
            catalog_region,
            entries.len()
        );
        Ok(entries.len())
    }

    /// Deletes a split parent once neither daughter's stores hold reference
    /// files pointing back at it. Advisory and repeated on every scan.
    async fn maybe_cleanup_split_parent(
        &self,
        catalog: &dyn CatalogAccess,
        catalog_region: &str,
        root_dir: &Path,
        entry: &CatalogEntry,
    ) -> Result<(), TesseraError> {
        let parent = &entry.info;
        for daughter in
            [entry.split_a.as_ref(), entry.split_b.as_ref()].into_iter().flatten()
        {
            let daughter_dir = region_dir(root_dir, daughter.encoded_name());
            for family in parent.table_desc.families.keys() {
                if dir_has_reference_to(
                    &family_dir(&daughter_dir, family),
                    parent.encoded_name(),
                )
                .await?
                {
                    return Ok(()); // still referenced; try again next scan
                }
            }
        }
        pf_info!(
            "deleting split parent '{}': daughters no longer reference it",
            parent.region_name()
        );
        catalog
            .delete_row(catalog_region, parent.region_name())
            .await?;
        Region::delete_region(root_dir, parent.encoded_name()).await?;
        Ok(())
    }
}
