//! The master daemon: bootstrap, catalog scanner chores, the to-do queue
//! worker, and table operations.
//!
//! The master never serves data itself. It discovers regions by scanning
//! the catalog regions, reconciles what it finds against the live server
//! set, and drives open/close instructions through heartbeat replies. All
//! catalog mutations funnel through the to-do worker or the bounded-retry
//! helpers here, so an unreachable catalog region (mid-reassignment) delays
//! work instead of losing it.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::descriptors::{RegionInfo, TableDescriptor};
use crate::keys::LATEST_TIMESTAMP;
use crate::master::catalog::{CatalogAccess, CatalogEntry, COL_REGIONINFO};
use crate::master::region_manager::RegionManager;
use crate::master::server_manager::ServerManager;
use crate::master::{MasterConfig, MasterOp};
use crate::server::{
    log_dir, split_log, BatchUpdate, Region, ServerConfig, Wal,
};
use crate::utils::TesseraError;

use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// The master of one cluster.
pub struct Master {
    config: Arc<MasterConfig>,
    root_dir: PathBuf,
    catalog: Arc<dyn CatalogAccess>,
    region_manager: Arc<RegionManager>,
    server_manager: Arc<ServerManager>,
    tx_todo: mpsc::UnboundedSender<MasterOp>,

    /// Cached name of the root catalog region.
    root_region_name: String,

    /// Set when the filesystem is gone; master processing stops for good.
    halted: AtomicBool,

    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Master {
    /// Creates the master: bootstraps the catalog regions on first start,
    /// then spawns the to-do worker, the lease expiry handler, and the
    /// root/meta scanner chores.
    pub async fn new_and_setup(
        root_dir: impl Into<PathBuf>,
        config: MasterConfig,
        catalog: Arc<dyn CatalogAccess>,
    ) -> Result<Arc<Self>, TesseraError> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir).await?;
        let config = Arc::new(config);

        let region_manager = Arc::new(RegionManager::new(config.clone()));
        let (tx_todo, rx_todo) = mpsc::unbounded_channel();
        let (server_manager, rx_expired) = ServerManager::new_and_setup(
            &config,
            region_manager.clone(),
            tx_todo.clone(),
        );

        let root_info = RegionInfo::root_region();
        let root_region_name = root_info.region_name().to_string();
        bootstrap_if_needed(&root_dir, &root_info).await?;

        // the root region always starts out needing a server
        region_manager.set_unassigned(root_info);

        let master = Arc::new(Master {
            config,
            root_dir,
            catalog,
            region_manager,
            server_manager: Arc::new(server_manager),
            tx_todo,
            root_region_name,
            halted: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Self::todo_worker(master.clone(), rx_todo)));
        tasks.push(tokio::spawn(Self::expiry_task(master.clone(), rx_expired)));
        tasks.push(tokio::spawn(Self::root_scanner_chore(master.clone())));
        tasks.push(tokio::spawn(Self::meta_scanner_chore(master.clone())));
        *master.tasks.lock().unwrap() = tasks;

        pf_info!("master up over root directory '{}'", master.root_dir.display());
        Ok(master)
    }

    pub fn server_manager(&self) -> &Arc<ServerManager> {
        &self.server_manager
    }

    pub fn region_manager(&self) -> &Arc<RegionManager> {
        &self.region_manager
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stops background processing.
    pub fn shutdown(&self) {
        self.halted.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.server_manager.stop();
        pf_info!("master shut down");
    }

    //
    // catalog scanning
    //

    /// One scan of the root catalog region.
    pub async fn scan_root(&self) -> Result<usize, TesseraError> {
        let servers = self.server_manager.servers_snapshot();
        self.region_manager
            .scan_one(
                self.catalog.as_ref(),
                &self.root_region_name,
                true,
                &servers,
                &self.root_dir,
            )
            .await
    }

    /// One scan of every online meta catalog region.
    pub async fn scan_metas(&self) -> Result<usize, TesseraError> {
        let servers = self.server_manager.servers_snapshot();
        let mut scanned = 0;
        for meta in self.region_manager.online_meta_names() {
            scanned += self
                .region_manager
                .scan_one(
                    self.catalog.as_ref(),
                    &meta,
                    false,
                    &servers,
                    &self.root_dir,
                )
                .await?;
        }
        Ok(scanned)
    }

    async fn root_scanner_chore(master: Arc<Master>) {
        let mut interval = time::interval(Duration::from_millis(
            master.config.catalog_scan_interval_ms,
        ));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if master.is_halted() {
                break;
            }
            // nothing to scan until the root region is served somewhere
            if master.region_manager.root_location().is_none() {
                continue;
            }
            if let Err(e) = master.scan_root().await {
                pf_warn!("root scan failed: {}", e);
            }
        }
    }

    async fn meta_scanner_chore(master: Arc<Master>) {
        let mut interval = time::interval(Duration::from_millis(
            master.config.catalog_scan_interval_ms,
        ));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if master.is_halted() {
                break;
            }
            if let Err(e) = master.scan_metas().await {
                pf_warn!("meta scan failed: {}", e);
            }
        }
    }

    //
    // to-do queue
    //

    async fn expiry_task(
        master: Arc<Master>,
        mut rx_expired: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(name) = rx_expired.recv().await {
            master.server_manager.handle_lease_expiry(&name);
        }
    }

    /// Drains queued operations. A failing operation is re-queued after a
    /// backoff if the filesystem is still healthy; with the filesystem
    /// gone, master processing halts for good.
    async fn todo_worker(
        master: Arc<Master>,
        mut rx_todo: mpsc::UnboundedReceiver<MasterOp>,
    ) {
        while let Some(op) = rx_todo.recv().await {
            if master.is_halted() {
                break;
            }
            if let Err(e) = master.process_op(&op).await {
                pf_error!("to-do operation {:?} failed: {}", op, e);
                if !master.filesystem_ok().await {
                    pf_error!("filesystem unavailable; halting master processing");
                    master.halted.store(true, Ordering::SeqCst);
                    break;
                }
                time::sleep(Duration::from_millis(
                    master.config.retry_backoff_ms,
                ))
                .await;
                let _ = master.tx_todo.send(op);
            }
        }
        pf_debug!("to-do worker exited");
    }

    async fn process_op(&self, op: &MasterOp) -> Result<(), TesseraError> {
        match op {
            MasterOp::ServerShutdown {
                address,
                start_code,
            } => self.process_server_shutdown(address, *start_code).await,

            MasterOp::RegionOpened {
                info,
                server,
                start_code,
            } => {
                let cat = self.catalog_region_for(info)?;
                self.catalog_retry(|| {
                    self.catalog.set_location(
                        &cat,
                        info.region_name(),
                        server,
                        *start_code,
                    )
                })
                .await?;
                self.region_manager.no_longer_pending(info.region_name());
                Ok(())
            }

            MasterOp::RegionClosed {
                info,
                offline,
                reassign,
            } => {
                let cat = self.catalog_region_for(info)?;
                self.catalog_retry(|| {
                    self.catalog.clear_location(&cat, info.region_name())
                })
                .await?;
                if self.region_manager.is_marked_to_delete(info.region_name()) {
                    self.catalog_retry(|| {
                        self.catalog.delete_row(&cat, info.region_name())
                    })
                    .await?;
                    Region::delete_region(&self.root_dir, info.encoded_name())
                        .await?;
                    self.region_manager.done_deleting(info.region_name());
                } else if *offline {
                    let mut off = info.clone();
                    off.offline = true;
                    self.catalog_retry(|| {
                        self.catalog.put_region_info(&cat, &off)
                    })
                    .await?;
                } else if *reassign {
                    self.region_manager.set_unassigned(info.clone());
                }
                Ok(())
            }

            MasterOp::RegionSplit {
                parent,
                daughter_a,
                daughter_b,
            } => {
                let cat = self.catalog_region_for(parent)?;
                self.catalog_retry(|| {
                    self.catalog.write_split(&cat, parent, daughter_a, daughter_b)
                })
                .await?;
                self.catalog_retry(|| {
                    self.catalog.put_region_info(&cat, daughter_a)
                })
                .await?;
                self.catalog_retry(|| {
                    self.catalog.put_region_info(&cat, daughter_b)
                })
                .await?;
                Ok(())
            }
        }
    }

    /// Recovery from a dead server: split its write-ahead log into
    /// per-region replay logs first, then release every region its catalog
    /// rows still point at. No region it covered may be reassigned before
    /// the split, or a new server would open it with unreplayed edits
    /// missing.
    async fn process_server_shutdown(
        &self,
        address: &str,
        start_code: u64,
    ) -> Result<(), TesseraError> {
        pf_info!("processing shutdown of server '{}'", address);
        let logdir = log_dir(&self.root_dir, address, start_code);
        if fs::try_exists(&logdir).await? {
            split_log(&self.root_dir, &logdir).await?;
        }

        // a locationless root is put back up for assignment here, after the
        // log split
        if self.region_manager.root_location().is_none() {
            self.region_manager
                .set_unassigned(RegionInfo::root_region());
        }

        // regions the dead server reported open but whose catalog rows were
        // never written would not show up in the scans below
        for info in self.region_manager.take_pending_on_server(address) {
            if info.is_meta_table() {
                self.region_manager.offline_meta(&info.start_key);
            }
            self.region_manager.set_unassigned(info);
        }

        let mut catalog_regions = vec![self.root_region_name.clone()];
        catalog_regions.extend(self.region_manager.online_meta_names());
        for cat in catalog_regions {
            let entries = self.catalog.scan_catalog(&cat).await?;
            for entry in entries {
                if entry.server.as_deref() != Some(address)
                    || entry.start_code != Some(start_code)
                {
                    continue;
                }
                let name = entry.info.region_name().to_string();
                pf_info!("'{}' was serving region '{}'", address, name);
                self.catalog_retry(|| self.catalog.clear_location(&cat, &name))
                    .await?;
                if entry.info.is_meta_table() {
                    self.region_manager.offline_meta(&entry.info.start_key);
                }
                if self.region_manager.is_marked_to_delete(&name) {
                    self.catalog_retry(|| self.catalog.delete_row(&cat, &name))
                        .await?;
                    Region::delete_region(
                        &self.root_dir,
                        entry.info.encoded_name(),
                    )
                    .await?;
                    self.region_manager.done_deleting(&name);
                } else if self.region_manager.is_queued_close(&name) {
                    self.region_manager.done_closing(&name);
                } else {
                    self.region_manager.set_unassigned(entry.info.clone());
                }
            }
        }
        self.server_manager.done_with_dead_server(address);
        Ok(())
    }

    //
    // table operations
    //

    /// Creates a table with one region spanning the whole keyspace. Blocks
    /// until the catalog row is written (or retries are exhausted).
    pub async fn create_table(
        &self,
        desc: TableDescriptor,
    ) -> Result<RegionInfo, TesseraError> {
        if desc.is_root() || desc.is_meta() {
            return Err(TesseraError::msg(format!(
                "table name '{}' is reserved",
                desc.name
            )));
        }
        if desc.families.is_empty() {
            return Err(TesseraError::msg(format!(
                "table '{}' must have at least one column family",
                desc.name
            )));
        }
        if !self.table_regions(&desc.name).await?.is_empty() {
            return Err(TesseraError::msg(format!(
                "table '{}' already exists",
                desc.name
            )));
        }

        let info = RegionInfo::new(desc, "", "");
        Region::create(&self.root_dir, &info).await?;
        let cat = self.catalog_region_for(&info)?;
        self.catalog_retry(|| self.catalog.put_region_info(&cat, &info))
            .await?;
        self.region_manager.set_unassigned(info.clone());
        pf_info!("created table '{}'", info.table_name());
        Ok(info)
    }

    /// Deletes a table: regions being served are queued for close + delete;
    /// the rest are deleted immediately.
    pub async fn delete_table(&self, table: &str) -> Result<(), TesseraError> {
        let servers = self.server_manager.servers_snapshot();
        for (cat, entry) in self.table_regions(table).await? {
            let name = entry.info.region_name().to_string();
            self.region_manager.no_longer_unassigned(&name);
            let served = matches!(
                (&entry.server, entry.start_code),
                (Some(s), Some(sc))
                    if servers.get(s).map_or(false, |si| si.start_code == sc)
            );
            if served {
                self.region_manager.mark_to_delete(&name);
                if let Some(server) = &entry.server {
                    self.region_manager.mark_to_close(server, entry.info.clone());
                }
            } else {
                self.catalog_retry(|| self.catalog.delete_row(&cat, &name))
                    .await?;
                Region::delete_region(&self.root_dir, entry.info.encoded_name())
                    .await?;
            }
        }
        pf_info!("deleted table '{}'", table);
        Ok(())
    }

    /// Takes a table's regions out of service: their catalog descriptors
    /// get the offline flag and their servers are told to close them.
    pub async fn disable_table(&self, table: &str) -> Result<(), TesseraError> {
        for (cat, entry) in self.table_regions(table).await? {
            let name = entry.info.region_name().to_string();
            self.region_manager.no_longer_unassigned(&name);
            let mut off = entry.info.clone();
            off.offline = true;
            self.catalog_retry(|| self.catalog.put_region_info(&cat, &off))
                .await?;
            if let Some(server) = &entry.server {
                self.region_manager.mark_to_close(server, entry.info.clone());
            }
        }
        pf_info!("disabled table '{}'", table);
        Ok(())
    }

    /// Brings a disabled table's regions back: clears the offline flag and
    /// marks them unassigned.
    pub async fn enable_table(&self, table: &str) -> Result<(), TesseraError> {
        for (cat, entry) in self.table_regions(table).await? {
            let mut on = entry.info.clone();
            on.offline = false;
            self.catalog_retry(|| self.catalog.put_region_info(&cat, &on))
                .await?;
            self.region_manager.done_closing(on.region_name());
            self.region_manager.set_unassigned(on);
        }
        pf_info!("enabled table '{}'", table);
        Ok(())
    }

    /// All catalog entries of a table, with the catalog region each row
    /// lives in.
    async fn table_regions(
        &self,
        table: &str,
    ) -> Result<Vec<(String, CatalogEntry)>, TesseraError> {
        let mut out = Vec::new();
        for cat in self.region_manager.online_meta_names() {
            let entries = self
                .catalog_retry(|| self.catalog.scan_catalog(&cat))
                .await?;
            for entry in entries {
                if entry.info.table_name() == table {
                    out.push((cat.clone(), entry));
                }
            }
        }
        Ok(out)
    }

    /// The catalog region holding a region's row: root for meta regions,
    /// the covering online meta region otherwise.
    fn catalog_region_for(
        &self,
        info: &RegionInfo,
    ) -> Result<String, TesseraError> {
        if info.is_root() {
            return Err(TesseraError::msg(
                "the root region has no catalog row",
            ));
        }
        if info.is_meta_table() {
            return Ok(self.root_region_name.clone());
        }
        self.region_manager
            .meta_region_covering(info.region_name())
            .ok_or_else(|| {
                TesseraError::NotServingRegion(format!(
                    "no online meta region covering '{}'",
                    info.region_name()
                ))
            })
    }

    /// Runs a catalog operation with bounded retries and doubling backoff
    /// on `NotServingRegion`; other errors surface immediately.
    async fn catalog_retry<T, F, Fut>(&self, mut f: F) -> Result<T, TesseraError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TesseraError>>,
    {
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut last = TesseraError::NotServingRegion(
            "catalog retries exhausted".to_string(),
        );
        for attempt in 1..=self.config.catalog_retries.max(1) {
            match f().await {
                Ok(v) => return Ok(v),
                Err(TesseraError::NotServingRegion(s)) => {
                    pf_debug!(
                        "catalog region not serving (attempt {}): {}",
                        attempt,
                        s
                    );
                    last = TesseraError::NotServingRegion(s);
                    time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    async fn filesystem_ok(&self) -> bool {
        matches!(fs::try_exists(&self.root_dir).await, Ok(true))
    }
}

/// First-start bootstrap: creates the root and first meta regions on disk
/// and writes the meta region's row into the root region directly (no
/// server is up yet to route through).
async fn bootstrap_if_needed(
    root_dir: &std::path::Path,
    root_info: &RegionInfo,
) -> Result<(), TesseraError> {
    let root_region_dir =
        crate::server::region_dir(root_dir, root_info.encoded_name());
    if fs::try_exists(&root_region_dir).await? {
        return Ok(());
    }
    pf_info!("bootstrapping root and meta catalog regions");

    let meta_info = RegionInfo::first_meta_region();
    Region::create(root_dir, root_info).await?;
    Region::create(root_dir, &meta_info).await?;

    let logdir = root_dir.join("log_bootstrap");
    let log =
        Arc::new(Wal::new_and_setup(&logdir, 100_000, true, None).await?);
    let root_region = Region::open(
        root_dir,
        log.clone(),
        root_info.clone(),
        Arc::new(ServerConfig::default()),
        None,
    )
    .await?;
    root_region
        .batch_update(
            LATEST_TIMESTAMP,
            BatchUpdate::new(meta_info.region_name().as_bytes().to_vec())
                .put(COL_REGIONINFO, rmp_serde::to_vec(&meta_info)?),
        )
        .await?;
    root_region.close(false).await?;
    log.close_and_delete().await?;
    Ok(())
}

#[cfg(test)]
mod daemon_tests {
    use super::*;
    use crate::descriptors::FamilyDescriptor;
    use crate::master::catalog::LocalCatalog;
    use crate::msgs::ServerInfo;

    fn quick_config() -> MasterConfig {
        MasterConfig {
            catalog_scan_interval_ms: 3_600_000, // chores driven manually
            catalog_retries: 2,
            retry_backoff_ms: 10,
            ..Default::default()
        }
    }

    /// Opens the bootstrapped root and meta regions in-process and
    /// registers them with the catalog, standing in for a storage server
    /// hosting them.
    async fn serve_catalog(
        master: &Arc<Master>,
        catalog: &Arc<LocalCatalog>,
        root_dir: &std::path::Path,
    ) -> Arc<Wal> {
        let log = Arc::new(
            Wal::new_and_setup(root_dir.join("log_test_catalog"), 100_000, false, None)
                .await
                .unwrap(),
        );
        for info in [RegionInfo::root_region(), RegionInfo::first_meta_region()]
        {
            let region = Arc::new(
                Region::open(
                    root_dir,
                    log.clone(),
                    info.clone(),
                    Arc::new(ServerConfig::default()),
                    None,
                )
                .await
                .unwrap(),
            );
            catalog.register_region(region);
            if info.is_root() {
                master
                    .region_manager()
                    .set_root_location(Some("test-server".into()));
                master
                    .region_manager()
                    .no_longer_unassigned(info.region_name());
            } else {
                master
                    .region_manager()
                    .set_meta_online(&info, "test-server");
            }
        }
        log
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bootstrap_writes_meta_row_into_root() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Arc::new(LocalCatalog::new());
        let master = Master::new_and_setup(
            tmp.path(),
            quick_config(),
            catalog.clone() as Arc<dyn CatalogAccess>,
        )
        .await?;

        // the root region starts out unassigned
        let root_name = RegionInfo::root_region().region_name().to_string();
        assert!(master.region_manager().is_unassigned(&root_name));

        // host the root region in-process and scan it
        let log = Arc::new(
            Wal::new_and_setup(tmp.path().join("log_root"), 100_000, false, None)
                .await?,
        );
        let root_region = Arc::new(
            Region::open(
                tmp.path(),
                log.clone(),
                RegionInfo::root_region(),
                Arc::new(ServerConfig::default()),
                None,
            )
            .await?,
        );
        catalog.register_region(root_region);
        master.region_manager().set_root_location(Some("test".into()));

        master.scan_root().await?;
        // the meta region's row was found and marked unassigned
        let meta_name =
            RegionInfo::first_meta_region().region_name().to_string();
        assert!(master.region_manager().is_unassigned(&meta_name));

        master.shutdown();
        log.close().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_table_adds_row_and_unassigns() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Arc::new(LocalCatalog::new());
        let master = Master::new_and_setup(
            tmp.path(),
            quick_config(),
            catalog.clone() as Arc<dyn CatalogAccess>,
        )
        .await?;
        let log = serve_catalog(&master, &catalog, tmp.path()).await;

        let desc = TableDescriptor::new("users")?
            .add_family(FamilyDescriptor::new("f")?);
        let info = master.create_table(desc.clone()).await?;
        assert!(master.region_manager().is_unassigned(info.region_name()));

        let meta_name = RegionInfo::first_meta_region().region_name().to_string();
        let entries = catalog.scan_catalog(&meta_name).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].info, info);

        // a second create of the same table is refused
        assert!(master.create_table(desc).await.is_err());

        master.shutdown();
        log.close().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_server_regions_are_released_after_log_split(
    ) -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Arc::new(LocalCatalog::new());
        let master = Master::new_and_setup(
            tmp.path(),
            MasterConfig {
                lease_period_ms: 80,
                lease_check_interval_ms: 10,
                ..quick_config()
            },
            catalog.clone() as Arc<dyn CatalogAccess>,
        )
        .await?;
        let log = serve_catalog(&master, &catalog, tmp.path()).await;

        let desc = TableDescriptor::new("orders")?
            .add_family(FamilyDescriptor::new("f")?);
        let info = master.create_table(desc).await?;

        // a server announces itself and "serves" the region
        let dead = ServerInfo::new("10.0.0.9:60020", 7);
        master.server_manager().region_server_startup(&dead)?;
        master.region_manager().no_longer_unassigned(info.region_name());
        let meta_name = RegionInfo::first_meta_region().region_name().to_string();
        catalog
            .set_location(&meta_name, info.region_name(), &dead.address, 7)
            .await?;

        // give it an on-disk log with an edit so recovery has to split it
        let dead_logdir = log_dir(tmp.path(), &dead.address, 7);
        {
            let wal =
                Wal::new_and_setup(&dead_logdir, 100_000, false, None).await?;
            let mut edits = std::collections::BTreeMap::new();
            edits.insert(
                crate::keys::StoreKey::new(&b"r"[..], "f:c", 1),
                Some(bytes::Bytes::from_static(b"v")),
            );
            wal.append(info.region_name(), "orders", &edits).await?;
            wal.close().await?;
        }

        // no renewals: the lease expires and recovery runs
        let mut tries = 0;
        while !master.region_manager().is_unassigned(info.region_name())
            && tries < 100
        {
            time::sleep(Duration::from_millis(20)).await;
            tries += 1;
        }
        assert!(master.region_manager().is_unassigned(info.region_name()));

        // the log was split into the region's replay log, then removed
        assert!(!dead_logdir.exists());
        let replay = crate::server::region_dir(tmp.path(), info.encoded_name())
            .join(crate::server::OLD_LOG_FILE_NAME);
        assert!(replay.exists());

        // the catalog row no longer points at the dead server
        let entries = catalog.scan_catalog(&meta_name).await?;
        assert_eq!(entries[0].server, None);

        // the next report from a live server gets offered the region
        let live = ServerInfo::new("10.0.0.10:60020", 9);
        master.server_manager().region_server_startup(&live)?;
        let reply = master
            .server_manager()
            .region_server_report(&live, Vec::new())?;
        assert!(reply
            .iter()
            .any(|m| matches!(m, crate::msgs::RegionMsg::OpenRegion(i)
                if i.region_name() == info.region_name())));

        master.shutdown();
        log.close().await?;
        Ok(())
    }
}
