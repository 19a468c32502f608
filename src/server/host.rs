//! Region-hosting context of one storage server: owns the shared
//! write-ahead log, the serving-region map, the background flusher /
//! log-roller / split-and-compaction tasks, and the scanner registry with
//! its client leases. All process-wide state lives here, with lifecycle
//! tied to this object; there are no ambient registries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use crate::descriptors::RegionInfo;
use crate::keys::now_millis;
use crate::msgs::{RegionMsg, ServerInfo, ServerLoad};
use crate::server::region::{Region, RegionScanner, RegionUnavailableListener};
use crate::server::wal::Wal;
use crate::server::log_dir;
use crate::utils::{LeaseManager, TesseraError};

use bytes::Bytes;

use rand::Rng;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Storage-server configuration. Overridable from a TOML string through
/// `parsed_config!`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Memstore size past which a region flush is requested.
    pub memstore_flush_size: usize,

    /// Updates block once the memstore reaches flush size times this.
    pub memstore_block_multiplier: usize,

    /// Desired max store size; a region splits past 1.5x this.
    pub max_file_size: u64,

    /// Store file count that triggers compaction.
    pub compaction_threshold: usize,

    /// Log entries per file before a roll is requested.
    pub max_log_entries: usize,

    /// Whether log appends fsync before acknowledging.
    pub log_fsync: bool,

    /// Period of the background flusher's sweep over idle regions.
    pub optional_flush_period_ms: u64,

    /// Period of the split/compaction checker.
    pub split_check_interval_ms: u64,

    /// Heartbeat period towards the master.
    pub heartbeat_period_ms: u64,

    /// Client scanner lease length and check frequency.
    pub scanner_lease_period_ms: u64,
    pub scanner_lease_check_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            memstore_flush_size: 16 * 1024 * 1024,
            memstore_block_multiplier: 2,
            max_file_size: 64 * 1024 * 1024,
            compaction_threshold: 3,
            max_log_entries: 30_000,
            log_fsync: true,
            optional_flush_period_ms: 30 * 60 * 1000,
            split_check_interval_ms: 20_000,
            heartbeat_period_ms: 3_000,
            scanner_lease_period_ms: 60_000,
            scanner_lease_check_interval_ms: 15_000,
        }
    }
}

impl ServerConfig {
    /// Composes a config from defaults overlaid with a TOML string.
    pub fn parsed(config_str: Option<&str>) -> Result<Self, TesseraError> {
        parsed_config!(config_str => ServerConfig;
                       memstore_flush_size, memstore_block_multiplier,
                       max_file_size, compaction_threshold, max_log_entries,
                       log_fsync, optional_flush_period_ms,
                       split_check_interval_ms, heartbeat_period_ms,
                       scanner_lease_period_ms,
                       scanner_lease_check_interval_ms)
    }
}

/// The region host of one storage server process.
pub struct RegionHost {
    address: String,
    start_code: u64,
    root_dir: PathBuf,
    config: Arc<ServerConfig>,

    log: Arc<Wal>,

    /// Regions currently being served, by region name.
    regions: StdRwLock<HashMap<String, Arc<Region>>>,

    /// Regions mid-split: out of the serving map, not yet fully closed.
    retiring: StdMutex<HashMap<String, Arc<Region>>>,

    /// Reports accumulated for the next heartbeat.
    outbound: StdMutex<Vec<RegionMsg>>,

    /// Flush-request channel; regions and the memory-pressure path push
    /// names here, the flusher task drains them.
    flush_tx: mpsc::UnboundedSender<String>,

    /// Open scanners by id, each covered by a client lease.
    scanners: StdMutex<HashMap<u64, RegionScanner>>,
    scanner_leases: LeaseManager,

    /// Set when a dropped snapshot or filesystem loss makes continuing
    /// unsafe; the process must restart and replay its log.
    aborted: AtomicBool,

    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl RegionHost {
    /// Creates the host: opens a fresh write-ahead log under the root
    /// directory and spawns the flusher, log-roller, split/compaction
    /// checker, and scanner-lease expirer tasks.
    pub async fn new_and_setup(
        root_dir: impl Into<PathBuf>,
        address: impl Into<String>,
        config: ServerConfig,
    ) -> Result<Arc<Self>, TesseraError> {
        let root_dir = root_dir.into();
        let address = address.into();
        let start_code = now_millis();
        let config = Arc::new(config);

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (roll_tx, roll_rx) = mpsc::unbounded_channel();
        let logdir = log_dir(&root_dir, &address, start_code);
        let log = Arc::new(
            Wal::new_and_setup(
                logdir,
                config.max_log_entries,
                config.log_fsync,
                Some(roll_tx),
            )
            .await?,
        );

        let (scanner_leases, scanner_expired_rx) = LeaseManager::new_and_setup(
            Duration::from_millis(config.scanner_lease_period_ms),
            Duration::from_millis(config.scanner_lease_check_interval_ms),
        );

        let host = Arc::new(RegionHost {
            address,
            start_code,
            root_dir,
            config,
            log,
            regions: StdRwLock::new(HashMap::new()),
            retiring: StdMutex::new(HashMap::new()),
            outbound: StdMutex::new(Vec::new()),
            flush_tx,
            scanners: StdMutex::new(HashMap::new()),
            scanner_leases,
            aborted: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Self::flusher_task(host.clone(), flush_rx)));
        tasks.push(tokio::spawn(Self::roller_task(host.clone(), roll_rx)));
        tasks.push(tokio::spawn(Self::split_checker_task(host.clone())));
        tasks.push(tokio::spawn(Self::scanner_expirer_task(
            host.clone(),
            scanner_expired_rx,
        )));
        *host.tasks.lock().unwrap() = tasks;

        pf_info!(
            "region host at '{}' up with start code {}",
            host.address,
            host.start_code
        );
        Ok(host)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn start_code(&self) -> u64 {
        self.start_code
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The regions currently being served.
    pub fn serving_regions(&self) -> Vec<Arc<Region>> {
        self.regions_snapshot()
    }

    /// Simulates a process crash: background duties stop, regions are
    /// dropped without being closed or flushed, and the write-ahead log is
    /// left on disk for recovery to split and replay.
    pub fn crash(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.scanner_leases.close();
        self.regions.write().unwrap().clear();
        self.retiring.lock().unwrap().clear();
        self.aborted.store(true, Ordering::SeqCst);
        pf_warn!("region host at '{}' crashed", self.address);
    }

    /// Identity + current load, as submitted with each heartbeat.
    pub fn server_info(&self) -> ServerInfo {
        let regions = self.regions.read().unwrap();
        let load = ServerLoad {
            regions: regions.len() as u32,
            memstore_bytes: regions
                .values()
                .map(|r| r.memstore_size() as u64)
                .sum(),
        };
        ServerInfo {
            address: self.address.clone(),
            start_code: self.start_code,
            load,
        }
    }

    pub fn num_regions(&self) -> usize {
        self.regions.read().unwrap().len()
    }

    pub fn get_region(&self, name: &str) -> Option<Arc<Region>> {
        self.regions.read().unwrap().get(name).cloned()
    }

    /// Opens a region and queues the opened report. A duplicate open
    /// instruction for a region already served is ignored.
    pub async fn open_region(
        &self,
        info: RegionInfo,
    ) -> Result<(), TesseraError> {
        if self
            .regions
            .read()
            .unwrap()
            .contains_key(info.region_name())
        {
            pf_debug!("region '{}' already being served", info.region_name());
            return Ok(());
        }
        let region = Region::open(
            &self.root_dir,
            self.log.clone(),
            info.clone(),
            self.config.clone(),
            Some(self.flush_tx.clone()),
        )
        .await?;
        self.regions
            .write()
            .unwrap()
            .insert(info.region_name().to_string(), Arc::new(region));
        self.queue_report(RegionMsg::ReportOpen(info));
        Ok(())
    }

    /// Closes a region and, unless told otherwise, queues the closed
    /// report. `report: false` is the duplicate-assignment cleanup path.
    pub async fn close_region(
        &self,
        name: &str,
        report: bool,
    ) -> Result<(), TesseraError> {
        let region = self.regions.write().unwrap().remove(name);
        if let Some(region) = region {
            region.close(false).await?;
            if report {
                self.queue_report(RegionMsg::ReportClose(region.info().clone()));
            }
        }
        Ok(())
    }

    fn queue_report(&self, msg: RegionMsg) {
        self.outbound.lock().unwrap().push(msg);
    }

    /// Drains the reports accumulated since the last heartbeat.
    pub fn poll_messages(&self) -> Vec<RegionMsg> {
        std::mem::take(&mut *self.outbound.lock().unwrap())
    }

    /// Applies the master's instructions from a heartbeat reply. Returns
    /// the control messages the caller (the heartbeat driver) must handle
    /// itself.
    pub async fn apply_instructions(
        &self,
        msgs: Vec<RegionMsg>,
    ) -> Result<Vec<RegionMsg>, TesseraError> {
        let mut unhandled = Vec::new();
        for msg in msgs {
            match msg {
                RegionMsg::OpenRegion(info) => {
                    if let Err(e) = self.open_region(info.clone()).await {
                        pf_error!(
                            "error opening region '{}': {}",
                            info.region_name(),
                            e
                        );
                    }
                }
                RegionMsg::CloseRegion { info, report } => {
                    if let Err(e) =
                        self.close_region(info.region_name(), report).await
                    {
                        pf_error!(
                            "error closing region '{}': {}",
                            info.region_name(),
                            e
                        );
                    }
                }
                other => unhandled.push(other),
            }
        }
        Ok(unhandled)
    }

    /// Closes every region for a clean exit and returns the exiting report:
    /// the exiting marker followed by the descriptors that were served.
    pub async fn shutdown_messages(
        &self,
    ) -> Result<Vec<RegionMsg>, TesseraError> {
        let regions: Vec<Arc<Region>> =
            self.regions.write().unwrap().drain().map(|(_, r)| r).collect();
        let mut msgs = vec![RegionMsg::ReportExiting];
        for region in regions {
            region.close(false).await?;
            msgs.push(RegionMsg::ReportClose(region.info().clone()));
        }
        Ok(msgs)
    }

    /// Stops background tasks and shuts the log down. With everything
    /// flushed by `shutdown_messages`, the log is no longer needed.
    pub async fn stop(&self) -> Result<(), TesseraError> {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.scanner_leases.close();
        if !self.is_aborted() {
            // a crashed host leaves its log behind for recovery to split
            self.log.close_and_delete().await?;
        }
        pf_info!("region host at '{}' stopped", self.address);
        Ok(())
    }

    //
    // scanners, covered by client leases
    //

    /// Opens a scanner over a served region on behalf of a client, covered
    /// by a lease that auto-closes it if the client goes quiet.
    pub fn open_scanner(
        &self,
        region_name: &str,
        columns: &[&str],
        first_row: &[u8],
        timestamp: u64,
    ) -> Result<u64, TesseraError> {
        let region = self.get_region(region_name).ok_or_else(|| {
            TesseraError::NotServingRegion(region_name.to_string())
        })?;
        let scanner = region.get_scanner(columns, first_row, timestamp)?;
        let id: u64 = rand::thread_rng().gen();
        self.scanner_leases.create_lease(&scanner_lease_name(id))?;
        self.scanners.lock().unwrap().insert(id, scanner);
        Ok(id)
    }

    /// Fetches the next row from an open scanner, renewing its lease.
    pub fn scanner_next(
        &self,
        id: u64,
    ) -> Result<Option<(Bytes, std::collections::BTreeMap<String, Bytes>)>, TesseraError>
    {
        self.scanner_leases.renew_lease(&scanner_lease_name(id))?;
        let mut scanners = self.scanners.lock().unwrap();
        match scanners.get_mut(&id) {
            Some(scanner) => Ok(scanner.next_row()),
            None => Err(TesseraError::msg(format!("unknown scanner id {}", id))),
        }
    }

    /// Closes a scanner and cancels its lease.
    pub fn close_scanner(&self, id: u64) -> Result<(), TesseraError> {
        let scanner = self.scanners.lock().unwrap().remove(&id);
        match scanner {
            Some(mut scanner) => {
                scanner.close();
                self.scanner_leases.cancel_lease(&scanner_lease_name(id));
                Ok(())
            }
            None => Err(TesseraError::msg(format!("unknown scanner id {}", id))),
        }
    }

    //
    // background duties
    //

    /// Flusher task: drains flush requests, and sweeps all regions on the
    /// optional-flush period so idle regions get persisted too.
    async fn flusher_task(
        host: Arc<RegionHost>,
        mut flush_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let mut sweep = time::interval(Duration::from_millis(
            host.config.optional_flush_period_ms,
        ));
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        sweep.tick().await; // first tick is immediate; skip it
        loop {
            tokio::select! {
                name = flush_rx.recv() => {
                    match name {
                        Some(name) => {
                            if let Some(region) = host.get_region(&name) {
                                host.flush_one(&region).await;
                            }
                        }
                        None => break, // all senders gone; host shut down
                    }
                },
                _ = sweep.tick() => {
                    for region in host.regions_snapshot() {
                        if region.memstore_size() > 0 {
                            host.flush_one(&region).await;
                        }
                    }
                },
            }
            if host.is_aborted() {
                break;
            }
        }
        pf_debug!("flusher task exited");
    }

    async fn flush_one(&self, region: &Arc<Region>) {
        match region.flushcache().await {
            Ok(_) => {}
            Err(e @ TesseraError::DroppedSnapshot(_)) => {
                // unrecoverable in place: the snapshot only lives in the
                // log now, and replaying it needs a process restart
                pf_error!("aborting host: {}", e);
                self.aborted.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                pf_error!(
                    "cache flush failed for region '{}': {}",
                    region.region_name(),
                    e
                );
                self.check_filesystem().await;
            }
        }
    }

    /// Log-roller task: rolls the shared log whenever the log signals its
    /// entry threshold.
    async fn roller_task(
        host: Arc<RegionHost>,
        mut roll_rx: mpsc::UnboundedReceiver<()>,
    ) {
        while roll_rx.recv().await.is_some() {
            pf_info!(
                "rolling log, number of entries: {}",
                host.log.num_entries().await
            );
            if let Err(e) = host.log.roll_writer().await {
                pf_error!("log rolling failed: {}", e);
                host.check_filesystem().await;
            }
            if host.is_aborted() {
                break;
            }
        }
        pf_debug!("log roller task exited");
    }

    /// Split/compaction checker task.
    async fn split_checker_task(host: Arc<RegionHost>) {
        let mut interval = time::interval(Duration::from_millis(
            host.config.split_check_interval_ms,
        ));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if host.is_aborted() {
                break;
            }
            if let Err(e) = host.split_or_compact_regions().await {
                pf_error!("split/compaction check failed: {}", e);
                host.check_filesystem().await;
            }
        }
    }

    /// One pass over all served regions: split those that want splitting,
    /// compact those that want compaction.
    pub async fn split_or_compact_regions(&self) -> Result<(), TesseraError> {
        for region in self.regions_snapshot() {
            if region.is_closed() {
                continue;
            }
            if region.needs_split().is_some() {
                if let Some((a, b)) =
                    region.split_region(Some(self as &dyn RegionUnavailableListener)).await?
                {
                    let parent = region.split_parent_info();
                    let (a, b) = (Arc::new(a), Arc::new(b));
                    {
                        let mut regions = self.regions.write().unwrap();
                        regions.insert(a.region_name().to_string(), a.clone());
                        regions.insert(b.region_name().to_string(), b.clone());
                    }
                    self.queue_report(RegionMsg::ReportSplit {
                        parent,
                        daughter_a: a.info().clone(),
                        daughter_b: b.info().clone(),
                    });
                }
            } else {
                region.compact_if_needed().await?;
            }
        }
        Ok(())
    }

    /// Scanner-lease expirer task: a client that stopped calling in gets
    /// its scanner closed so region close drains are never held hostage.
    async fn scanner_expirer_task(
        host: Arc<RegionHost>,
        mut expired_rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(name) = expired_rx.recv().await {
            if let Some(id) = parse_scanner_lease_name(&name) {
                pf_info!("scanner lease '{}' expired; closing scanner", name);
                let scanner = host.scanners.lock().unwrap().remove(&id);
                if let Some(mut scanner) = scanner {
                    scanner.close();
                }
            }
        }
    }

    fn regions_snapshot(&self) -> Vec<Arc<Region>> {
        self.regions.read().unwrap().values().cloned().collect()
    }

    /// Verifies the root directory is still reachable; aborts the host if
    /// the filesystem has gone away.
    async fn check_filesystem(&self) {
        match tokio::fs::try_exists(&self.root_dir).await {
            Ok(true) => {}
            _ => {
                pf_error!(
                    "root directory '{}' unreachable; aborting host",
                    self.root_dir.display()
                );
                self.aborted.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl RegionUnavailableListener for RegionHost {
    /// The region is about to close for a split: stop serving it so no new
    /// operations start, but keep it findable for the drain.
    fn closing(&self, region_name: &str) {
        let region = self.regions.write().unwrap().remove(region_name);
        if let Some(region) = region {
            self.retiring
                .lock()
                .unwrap()
                .insert(region_name.to_string(), region);
        }
    }

    /// The region finished closing; drop the retiring entry.
    fn closed(&self, region_name: &str) {
        self.retiring.lock().unwrap().remove(region_name);
    }
}

fn scanner_lease_name(id: u64) -> String {
    format!("scanner-{}", id)
}

fn parse_scanner_lease_name(name: &str) -> Option<u64> {
    name.strip_prefix("scanner-")?.parse().ok()
}

#[cfg(test)]
mod host_tests {
    use super::*;
    use crate::descriptors::{FamilyDescriptor, TableDescriptor};
    use crate::keys::LATEST_TIMESTAMP;
    use crate::server::region::BatchUpdate;

    fn table_t() -> TableDescriptor {
        TableDescriptor::new("t")
            .unwrap()
            .add_family(FamilyDescriptor::new("f").unwrap())
    }

    fn small_config() -> ServerConfig {
        ServerConfig {
            memstore_flush_size: 512,
            max_file_size: 1024,
            scanner_lease_period_ms: 60,
            scanner_lease_check_interval_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_write_flush_report_cycle() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let host = RegionHost::new_and_setup(
            tmp.path(),
            "10.0.0.1:60020",
            small_config(),
        )
        .await?;

        let info = RegionInfo::with_id(1, table_t(), "", "");
        host.open_region(info.clone()).await?;
        assert_eq!(
            host.poll_messages(),
            vec![RegionMsg::ReportOpen(info.clone())]
        );

        let region = host.get_region(info.region_name()).unwrap();
        for i in 0..64 {
            region
                .batch_update(
                    LATEST_TIMESTAMP,
                    BatchUpdate::new(format!("row-{:03}", i).into_bytes())
                        .put("f:c1", vec![0u8; 64]),
                )
                .await?;
        }
        // past the flush size, the region has asked the flusher to run
        let mut tries = 0;
        while region.memstore_size() > 0 && tries < 100 {
            time::sleep(Duration::from_millis(20)).await;
            tries += 1;
        }
        assert_eq!(region.memstore_size(), 0);

        host.close_region(info.region_name(), true).await?;
        assert_eq!(host.poll_messages(), vec![RegionMsg::ReportClose(info)]);
        host.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn split_check_splits_large_region() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let host = RegionHost::new_and_setup(
            tmp.path(),
            "10.0.0.2:60020",
            small_config(),
        )
        .await?;

        let info = RegionInfo::with_id(2, table_t(), "", "");
        host.open_region(info.clone()).await?;
        host.poll_messages();

        let region = host.get_region(info.region_name()).unwrap();
        for i in 0..200 {
            region
                .batch_update(
                    LATEST_TIMESTAMP,
                    BatchUpdate::new(format!("row-{:04}", i).into_bytes())
                        .put("f:c1", vec![1u8; 32]),
                )
                .await?;
        }
        region.flushcache().await?;

        host.split_or_compact_regions().await?;
        let msgs = host.poll_messages();
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            RegionMsg::ReportSplit {
                parent,
                daughter_a,
                daughter_b,
            } => {
                assert_eq!(parent.region_name(), info.region_name());
                assert!(parent.offline && parent.split);
                assert_eq!(daughter_a.end_key, daughter_b.start_key);
                assert!(host.get_region(daughter_a.region_name()).is_some());
                assert!(host.get_region(daughter_b.region_name()).is_some());
            }
            other => panic!("expected split report, got {:?}", other),
        }
        assert!(host.get_region(info.region_name()).is_none());
        assert_eq!(host.num_regions(), 2);
        host.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scanner_lease_expiry_closes_scanner() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let host = RegionHost::new_and_setup(
            tmp.path(),
            "10.0.0.3:60020",
            small_config(),
        )
        .await?;

        let info = RegionInfo::with_id(3, table_t(), "", "");
        host.open_region(info.clone()).await?;
        let region = host.get_region(info.region_name()).unwrap();
        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(&b"a"[..]).put("f:c1", "v"),
            )
            .await?;

        let id = host.open_scanner(info.region_name(), &["f:"], b"", LATEST_TIMESTAMP)?;
        assert!(host.scanner_next(id)?.is_some());

        // go quiet past the lease period; the expirer reaps the scanner
        time::sleep(Duration::from_millis(200)).await;
        assert!(host.scanner_next(id).is_err());

        // and the region can close without waiting on the dead client
        host.close_region(info.region_name(), false).await?;
        host.stop().await?;
        Ok(())
    }
}
