//! In-process cluster wiring: one master plus a set of region hosts in the
//! same process, connected by direct function calls instead of the
//! (out-of-scope) wire transport. Each host gets a heartbeat driver task
//! that reports its accumulated region state changes and applies the
//! master's instructions. Useful for tests and single-machine trials.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use crate::master::{LocalCatalog, Master, MasterConfig};
use crate::msgs::RegionMsg;
use crate::server::{Region, RegionHost, ServerConfig};
use crate::utils::TesseraError;

use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// A master and several region hosts sharing one process and one root
/// directory.
pub struct LocalCluster {
    master: Arc<Master>,
    catalog: Arc<LocalCatalog>,
    hosts: Vec<Arc<RegionHost>>,
    drivers: StdMutex<Vec<JoinHandle<()>>>,
}

impl LocalCluster {
    /// Brings up a master and `num_servers` region hosts over `root_dir`,
    /// with a heartbeat driver per host.
    pub async fn new_and_setup(
        root_dir: impl Into<PathBuf>,
        num_servers: usize,
        server_config: ServerConfig,
        master_config: MasterConfig,
    ) -> Result<Arc<Self>, TesseraError> {
        let root_dir = root_dir.into();
        let catalog = Arc::new(LocalCatalog::new());
        let master = Master::new_and_setup(
            &root_dir,
            master_config,
            catalog.clone() as Arc<dyn crate::master::CatalogAccess>,
        )
        .await?;

        let mut hosts = Vec::new();
        for i in 0..num_servers {
            hosts.push(
                RegionHost::new_and_setup(
                    &root_dir,
                    format!("127.0.0.1:{}", 60020 + i),
                    server_config.clone(),
                )
                .await?,
            );
        }

        let cluster = Arc::new(LocalCluster {
            master,
            catalog,
            hosts,
            drivers: StdMutex::new(Vec::new()),
        });
        let mut drivers = Vec::new();
        for host in cluster.hosts.clone() {
            drivers.push(tokio::spawn(Self::heartbeat_driver(
                cluster.clone(),
                host,
            )));
        }
        *cluster.drivers.lock().unwrap() = drivers;
        Ok(cluster)
    }

    pub fn master(&self) -> &Arc<Master> {
        &self.master
    }

    pub fn hosts(&self) -> &[Arc<RegionHost>] {
        &self.hosts
    }

    /// The served region of a table covering the given row, if any host
    /// currently has one open.
    pub fn find_region(&self, table: &str, row: &[u8]) -> Option<Arc<Region>> {
        for host in &self.hosts {
            for region in host.serving_regions() {
                if region.info().table_name() == table
                    && region.info().contains_row(row)
                    && !region.is_closed()
                {
                    return Some(region);
                }
            }
        }
        None
    }

    /// Simulates the death of one host: its heartbeat driver stops and the
    /// host crashes without closing its regions, leaving its write-ahead
    /// log on disk. The master's lease on it expires and recovery runs.
    pub fn crash_host(&self, index: usize) {
        {
            let drivers = self.drivers.lock().unwrap();
            if index < drivers.len() {
                drivers[index].abort();
            }
        }
        self.hosts[index].crash();
    }

    /// Clean shutdown: each host reports exiting, then everything stops.
    pub async fn shutdown(&self) -> Result<(), TesseraError> {
        for driver in self.drivers.lock().unwrap().drain(..) {
            driver.abort();
        }
        for host in &self.hosts {
            let msgs = host.shutdown_messages().await?;
            let _ = self
                .master
                .server_manager()
                .region_server_report(&host.server_info(), msgs);
            host.stop().await?;
        }
        self.master.shutdown();
        Ok(())
    }

    /// Per-host heartbeat loop: announce, then report/apply on the
    /// configured period. Re-announces when the master asks for it; exits
    /// when told to stop.
    async fn heartbeat_driver(cluster: Arc<LocalCluster>, host: Arc<RegionHost>) {
        let period =
            Duration::from_millis(host.config().heartbeat_period_ms);

        // announce, retrying while an old lease is still held
        loop {
            match cluster
                .master
                .server_manager()
                .region_server_startup(&host.server_info())
            {
                Ok(()) => break,
                Err(e) => {
                    pf_debug!("startup of '{}' deferred: {}", host.address(), e);
                    time::sleep(period).await;
                }
            }
        }

        loop {
            time::sleep(period).await;
            if host.is_aborted() {
                pf_error!("host '{}' aborted; stopping driver", host.address());
                break;
            }

            // newly opened catalog regions must be reachable before the
            // master processes the reports referring to them
            for region in host.serving_regions() {
                if region.info().is_root() || region.info().is_meta_table() {
                    cluster.catalog.register_region(region);
                }
            }

            let msgs = host.poll_messages();
            let reply = match cluster
                .master
                .server_manager()
                .region_server_report(&host.server_info(), msgs)
            {
                Ok(reply) => reply,
                Err(e) => {
                    pf_warn!("report from '{}' failed: {}", host.address(), e);
                    continue;
                }
            };
            let ctrl = match host.apply_instructions(reply).await {
                Ok(ctrl) => ctrl,
                Err(e) => {
                    pf_error!(
                        "applying instructions on '{}' failed: {}",
                        host.address(),
                        e
                    );
                    continue;
                }
            };
            for msg in ctrl {
                match msg {
                    RegionMsg::CallServerStartup => {
                        let _ = cluster
                            .master
                            .server_manager()
                            .region_server_startup(&host.server_info());
                    }
                    RegionMsg::StopServer => {
                        pf_warn!(
                            "host '{}' told to stop; driver exiting",
                            host.address()
                        );
                        return;
                    }
                    other => {
                        pf_warn!("unhandled control message: {:?}", other);
                    }
                }
            }
        }
    }
}

/// Polls `f` every 20ms until it returns `Some` or the timeout elapses.
#[cfg(test)]
async fn wait_for<T>(
    timeout_ms: u64,
    mut f: impl FnMut() -> Option<T>,
) -> Option<T> {
    let mut waited = 0;
    loop {
        if let Some(v) = f() {
            return Some(v);
        }
        if waited >= timeout_ms {
            return None;
        }
        time::sleep(Duration::from_millis(20)).await;
        waited += 20;
    }
}

#[cfg(test)]
mod cluster_tests {
    use super::*;
    use crate::descriptors::{FamilyDescriptor, TableDescriptor};
    use crate::keys::LATEST_TIMESTAMP;
    use crate::server::BatchUpdate;
    use bytes::Bytes;

    fn fast_server_config() -> ServerConfig {
        ServerConfig {
            heartbeat_period_ms: 30,
            split_check_interval_ms: 3_600_000,
            ..Default::default()
        }
    }

    fn fast_master_config() -> MasterConfig {
        MasterConfig {
            lease_period_ms: 300,
            lease_check_interval_ms: 20,
            catalog_scan_interval_ms: 50,
            max_region_open_time_ms: 500,
            retry_backoff_ms: 20,
            ..Default::default()
        }
    }

    async fn wait_catalog_online(cluster: &Arc<LocalCluster>) {
        let master = cluster.master().clone();
        let online = wait_for(10_000, move || {
            if master.region_manager().root_location().is_some()
                && !master.region_manager().online_meta_names().is_empty()
            {
                Some(())
            } else {
                None
            }
        })
        .await;
        assert!(online.is_some(), "catalog regions never came online");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn table_create_write_read_cycle() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::new_and_setup(
            tmp.path(),
            2,
            fast_server_config(),
            fast_master_config(),
        )
        .await?;
        wait_catalog_online(&cluster).await;

        let desc = TableDescriptor::new("t")?
            .add_family(FamilyDescriptor::new("f")?);
        let info = cluster.master().create_table(desc).await?;

        let c = cluster.clone();
        let region = wait_for(10_000, move || c.find_region("t", b"a")).await;
        let region = region.expect("table region never assigned");
        assert_eq!(region.region_name(), info.region_name());

        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(&b"a"[..]).put("f:c1", "v1"),
            )
            .await?;
        assert_eq!(
            region.get(b"a", "f:c1", LATEST_TIMESTAMP, 1)?,
            vec![Bytes::from("v1")]
        );

        cluster.shutdown().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dead_server_region_moves_to_live_server() -> Result<(), TesseraError>
    {
        let tmp = tempfile::tempdir().unwrap();
        let cluster = LocalCluster::new_and_setup(
            tmp.path(),
            2,
            fast_server_config(),
            fast_master_config(),
        )
        .await?;
        wait_catalog_online(&cluster).await;

        let desc = TableDescriptor::new("t")?
            .add_family(FamilyDescriptor::new("f")?);
        cluster.master().create_table(desc).await?;

        let c = cluster.clone();
        let region = wait_for(10_000, move || c.find_region("t", b"a"))
            .await
            .expect("table region never assigned");
        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(&b"a"[..]).put("f:c1", "survives"),
            )
            .await?;

        // pick the host serving the table region; keep the catalog
        // regions' host alive so recovery can rewrite catalog rows
        let victim = cluster.hosts().iter().position(|h| {
            h.get_region(region.region_name()).is_some()
                && h.serving_regions()
                    .iter()
                    .all(|r| !r.info().is_root() && !r.info().is_meta_table())
        });
        let victim = match victim {
            Some(v) => v,
            None => {
                // the table region landed on the catalog host this run;
                // killing it would take the catalog down too
                cluster.shutdown().await?;
                return Ok(());
            }
        };
        let victim_addr = cluster.hosts()[victim].address().to_string();
        cluster.crash_host(victim);

        // lease expiry, log split, then reassignment to the survivor; the
        // unflushed write comes back through the replay log
        let c = cluster.clone();
        let value = wait_for(15_000, move || {
            let region = c.find_region("t", b"a")?;
            match region.get(b"a", "f:c1", LATEST_TIMESTAMP, 1) {
                Ok(v) if !v.is_empty() => Some(v),
                _ => None,
            }
        })
        .await;
        assert_eq!(value, Some(vec![Bytes::from("survives")]));

        let new_region = cluster.find_region("t", b"a").expect("region serving");
        let new_host = cluster
            .hosts()
            .iter()
            .find(|h| h.get_region(new_region.region_name()).is_some())
            .expect("no host serves the region");
        assert_ne!(new_host.address(), victim_addr);

        cluster.shutdown().await?;
        Ok(())
    }
}
