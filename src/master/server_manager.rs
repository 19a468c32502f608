//! Master-side tracking of live storage servers.
//!
//! Each server holds a lease renewed by its heartbeats; lease expiry is the
//! sole mechanism for declaring a server dead. Heartbeat reports carry the
//! server's region state changes (opened, closed, split), which are turned
//! into catalog work on the master's to-do queue, and the reply carries the
//! master's instructions (closes queued for that server, new assignments).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use crate::descriptors::RegionInfo;
use crate::master::region_manager::RegionManager;
use crate::master::{MasterConfig, MasterOp};
use crate::msgs::{RegionMsg, ServerInfo, ServerLoad};
use crate::utils::{LeaseManager, TesseraError};

use tokio::sync::mpsc;
use tokio::time::Duration;

/// The master's registry of storage servers.
pub struct ServerManager {
    /// Known servers by name (address).
    servers: StdMutex<HashMap<String, ServerInfo>>,

    /// Latest reported load by server name.
    loads: StdMutex<HashMap<String, ServerLoad>>,

    /// Servers declared dead and not yet fully processed.
    dead_servers: StdMutex<HashSet<String>>,

    /// One lease per live server, renewed on every report.
    leases: LeaseManager,

    region_manager: Arc<RegionManager>,

    /// Master to-do queue for catalog work derived from reports.
    tx_todo: mpsc::UnboundedSender<MasterOp>,
}

impl ServerManager {
    /// Creates the server manager. Returns it together with the lease
    /// expiration channel the master's event loop must drain into
    /// `handle_lease_expiry`.
    pub fn new_and_setup(
        config: &MasterConfig,
        region_manager: Arc<RegionManager>,
        tx_todo: mpsc::UnboundedSender<MasterOp>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (leases, rx_expired) = LeaseManager::new_and_setup(
            Duration::from_millis(config.lease_period_ms),
            Duration::from_millis(config.lease_check_interval_ms),
        );
        (
            ServerManager {
                servers: StdMutex::new(HashMap::new()),
                loads: StdMutex::new(HashMap::new()),
                dead_servers: StdMutex::new(HashSet::new()),
                leases,
                region_manager,
                tx_todo,
            },
            rx_expired,
        )
    }

    /// A storage server announcing itself. Fails with `LeaseStillHeld` if a
    /// lease for this address is still out (a near-immediate restart); the
    /// server should retry once the old lease has expired and been
    /// processed.
    pub fn region_server_startup(
        &self,
        info: &ServerInfo,
    ) -> Result<(), TesseraError> {
        let name = info.server_name().to_string();
        pf_info!("received start message from '{}'", name);

        if let Err(e) = self.leases.create_lease(&name) {
            pf_debug!("lease still held on '{}'", name);
            return Err(e);
        }
        self.dead_servers.lock().unwrap().remove(&name);

        // a known server with the same name restarted: retire the old
        // incarnation right away
        let stored = self.servers.lock().unwrap().remove(&name);
        if let Some(stored) = stored {
            self.loads.lock().unwrap().remove(&name);
            if self.region_manager.root_location().as_deref()
                == Some(stored.address.as_str())
            {
                self.region_manager.set_root_location(None);
            }
            let _ = self.tx_todo.send(MasterOp::ServerShutdown {
                address: stored.address,
                start_code: stored.start_code,
            });
        }

        self.servers.lock().unwrap().insert(name.clone(), info.clone());
        self.loads
            .lock()
            .unwrap()
            .insert(name, ServerLoad::default());
        Ok(())
    }

    /// Processes a heartbeat report and computes the instructions to send
    /// back.
    pub fn region_server_report(
        &self,
        info: &ServerInfo,
        msgs: Vec<RegionMsg>,
    ) -> Result<Vec<RegionMsg>, TesseraError> {
        let name = info.server_name().to_string();

        if matches!(msgs.first(), Some(RegionMsg::ReportExiting)) {
            self.process_server_exit(&name, &msgs);
            return Ok(Vec::new());
        }

        let stored = self.servers.lock().unwrap().get(&name).cloned();
        match stored {
            None => {
                // this master may have restarted; tell the server to start
                // over and announce itself
                pf_debug!("received report from unknown server '{}'", name);
                Ok(vec![RegionMsg::CallServerStartup])
            }
            Some(stored) if stored.start_code != info.start_code => {
                // reachable when a second server clobbered this address in
                // startup and the first one comes back: the old one must go
                pf_debug!("region server race condition detected: '{}'", name);
                self.forget_server(&name);
                Ok(vec![RegionMsg::StopServer])
            }
            Some(_) => {
                self.leases.renew_lease(&name)?;
                self.servers
                    .lock()
                    .unwrap()
                    .insert(name.clone(), info.clone());
                self.loads
                    .lock()
                    .unwrap()
                    .insert(name.clone(), info.load.clone());
                self.process_msgs(&name, info, msgs)
            }
        }
    }

    fn process_msgs(
        &self,
        name: &str,
        info: &ServerInfo,
        msgs: Vec<RegionMsg>,
    ) -> Result<Vec<RegionMsg>, TesseraError> {
        let mut reply = Vec::new();
        for msg in msgs {
            pf_info!("received {:?} from '{}'", msg, name);
            match msg {
                RegionMsg::ReportOpen(region) => {
                    self.process_region_open(info, region, &mut reply);
                }
                RegionMsg::ReportClose(region) => {
                    self.process_region_close(region);
                }
                RegionMsg::ReportSplit {
                    parent,
                    daughter_a,
                    daughter_b,
                } => {
                    self.process_split(parent, daughter_a, daughter_b);
                }
                other => {
                    pf_warn!(
                        "unexpected message in report from '{}': {:?}",
                        name,
                        other
                    );
                }
            }
        }

        // deliver closes queued for this server
        for region in self.region_manager.remove_marked_to_close(name) {
            reply.push(RegionMsg::CloseRegion {
                info: region,
                report: true,
            });
        }

        // figure out what else this server ought to do
        self.region_manager
            .assign_regions(info, self.num_servers(), &mut reply);
        Ok(reply)
    }

    /// A server reports a region open. A report for a region the master
    /// did not assign is a duplicate assignment: the server is told to
    /// close it without reporting back, so the master does not mistake the
    /// close for a purposeful one and reassign the region out from under
    /// the real holder.
    fn process_region_open(
        &self,
        info: &ServerInfo,
        region: RegionInfo,
        reply: &mut Vec<RegionMsg>,
    ) {
        let name = region.region_name().to_string();
        if !self.region_manager.is_unassigned(&name) {
            if region.is_root() {
                if self.region_manager.root_location().as_deref()
                    == Some(info.address.as_str())
                {
                    return; // duplicate report from the correct server
                }
            } else if self.region_manager.is_pending(&name) {
                return; // duplicate report from the correct server
            }
            pf_debug!(
                "server '{}' should not have opened region '{}'",
                info.address,
                name
            );
            reply.push(RegionMsg::CloseRegion {
                info: region,
                report: false,
            });
            return;
        }

        self.region_manager.no_longer_unassigned(&name);
        if region.is_root() {
            self.region_manager
                .set_root_location(Some(info.address.clone()));
        } else {
            if region.is_meta_table() {
                self.region_manager.set_meta_online(&region, &info.address);
            }
            self.region_manager.set_pending(region.clone(), &info.address);
            let _ = self.tx_todo.send(MasterOp::RegionOpened {
                info: region,
                server: info.address.clone(),
                start_code: info.start_code,
            });
        }
    }

    fn process_region_close(&self, region: RegionInfo) {
        if region.is_root() {
            self.region_manager.set_root_location(None);
            self.region_manager
                .set_unassigned(RegionInfo::root_region());
            return;
        }
        let name = region.region_name().to_string();
        let offline =
            region.offline || self.region_manager.is_queued_close(&name);
        let delete = self.region_manager.is_marked_to_delete(&name);
        self.region_manager.done_closing(&name);
        // must not re-add to unassigned here: that would reorder a close
        // ahead of an open still being processed
        self.region_manager.no_longer_unassigned(&name);
        if region.is_meta_table() {
            self.region_manager.offline_meta(&region.start_key);
        }
        let _ = self.tx_todo.send(MasterOp::RegionClosed {
            info: region,
            offline,
            reassign: !offline && !delete,
        });
    }

    fn process_split(
        &self,
        parent: RegionInfo,
        daughter_a: RegionInfo,
        daughter_b: RegionInfo,
    ) {
        if parent.is_meta_table() {
            self.region_manager.offline_meta(&parent.start_key);
        }
        self.region_manager.set_unassigned(daughter_a.clone());
        self.region_manager.set_unassigned(daughter_b.clone());
        let _ = self.tx_todo.send(MasterOp::RegionSplit {
            parent,
            daughter_a,
            daughter_b,
        });
    }

    /// A server exiting cleanly: its regions are already closed and
    /// flushed, so they can be reassigned immediately, no log split needed.
    fn process_server_exit(&self, name: &str, msgs: &[RegionMsg]) {
        if !self.forget_server(name) {
            // lease already gone; don't process the exit twice
            return;
        }
        pf_info!("region server '{}': exiting report, lease cancelled", name);
        for msg in &msgs[1..] {
            if let RegionMsg::ReportClose(info) = msg {
                if info.is_root() {
                    self.region_manager.set_root_location(None);
                    self.region_manager
                        .set_unassigned(RegionInfo::root_region());
                } else if !self
                    .region_manager
                    .is_marked_to_close(name, info.region_name())
                {
                    if info.is_meta_table() {
                        self.region_manager.offline_meta(&info.start_key);
                    }
                    self.region_manager.set_unassigned(info.clone());
                }
            }
        }
    }

    /// Declares a server dead after its lease expired. Regions are not
    /// reassigned here: the queued shutdown operation first splits the dead
    /// server's log so no region is reopened with unreplayed edits missing.
    pub fn handle_lease_expiry(&self, name: &str) {
        pf_info!("'{}' lease expired", name);
        let info = self.servers.lock().unwrap().remove(name);
        if let Some(info) = info {
            self.loads.lock().unwrap().remove(name);
            if self.region_manager.root_location().as_deref()
                == Some(info.address.as_str())
            {
                // the new root server must not come up before the log split
                self.region_manager.set_root_location(None);
            }
            self.dead_servers.lock().unwrap().insert(name.to_string());
            let _ = self.tx_todo.send(MasterOp::ServerShutdown {
                address: info.address,
                start_code: info.start_code,
            });
        }
    }

    /// Cancels a server's lease and drops its records. Returns true if the
    /// lease existed (so shutdown processing runs only once).
    fn forget_server(&self, name: &str) -> bool {
        let cancelled = self.leases.cancel_lease(name);
        self.servers.lock().unwrap().remove(name);
        self.loads.lock().unwrap().remove(name);
        cancelled
    }

    pub fn num_servers(&self) -> usize {
        self.servers.lock().unwrap().len()
    }

    pub fn servers_snapshot(&self) -> HashMap<String, ServerInfo> {
        self.servers.lock().unwrap().clone()
    }

    pub fn is_dead(&self, name: &str) -> bool {
        self.dead_servers.lock().unwrap().contains(name)
    }

    pub fn done_with_dead_server(&self, name: &str) {
        self.dead_servers.lock().unwrap().remove(name);
    }

    /// Average number of regions per live server, rounded up.
    pub fn average_load(&self) -> f64 {
        let loads = self.loads.lock().unwrap();
        if loads.is_empty() {
            return 0.0;
        }
        let total: u32 = loads.values().map(|l| l.regions).sum();
        (total as f64 / loads.len() as f64).ceil()
    }

    /// Stop granting leases; used at master shutdown.
    pub fn stop(&self) {
        self.leases.close();
    }
}

#[cfg(test)]
mod server_manager_tests {
    use super::*;
    use crate::descriptors::{FamilyDescriptor, TableDescriptor};

    fn setup(
        config: MasterConfig,
    ) -> (
        ServerManager,
        Arc<RegionManager>,
        mpsc::UnboundedReceiver<MasterOp>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let config = Arc::new(config);
        let region_manager = Arc::new(RegionManager::new(config.clone()));
        let (tx_todo, rx_todo) = mpsc::unbounded_channel();
        let (manager, rx_expired) =
            ServerManager::new_and_setup(&config, region_manager.clone(), tx_todo);
        (manager, region_manager, rx_todo, rx_expired)
    }

    fn server(addr: &str, start_code: u64) -> ServerInfo {
        ServerInfo::new(addr, start_code)
    }

    fn region(i: u64) -> RegionInfo {
        let desc = TableDescriptor::new("t")
            .unwrap()
            .add_family(FamilyDescriptor::new("f").unwrap());
        RegionInfo::with_id(i, desc, "", "")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_server_is_told_to_start_up() -> Result<(), TesseraError> {
        let (manager, _, _rx_todo, _rx_exp) = setup(MasterConfig::default());
        let reply =
            manager.region_server_report(&server("s1", 1), Vec::new())?;
        assert_eq!(reply, vec![RegionMsg::CallServerStartup]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_code_race_stops_old_server() -> Result<(), TesseraError> {
        let (manager, _, mut rx_todo, _rx_exp) = setup(MasterConfig::default());
        manager.region_server_startup(&server("s1", 2))?;
        // old incarnation (start code 1) reports after being clobbered
        let reply = manager.region_server_report(&server("s1", 1), Vec::new())?;
        assert_eq!(reply, vec![RegionMsg::StopServer]);
        assert!(rx_todo.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_with_held_lease_is_rejected() -> Result<(), TesseraError> {
        let (manager, _, _rx_todo, _rx_exp) = setup(MasterConfig::default());
        manager.region_server_startup(&server("s1", 1))?;
        assert!(matches!(
            manager.region_server_startup(&server("s1", 2)),
            Err(TesseraError::LeaseStillHeld(_))
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn assignment_flows_through_report() -> Result<(), TesseraError> {
        let (manager, region_manager, mut rx_todo, _rx_exp) =
            setup(MasterConfig::default());
        let s1 = server("s1", 1);
        manager.region_server_startup(&s1)?;

        let info = region(1);
        region_manager.set_unassigned(info.clone());

        // heartbeat: region gets offered
        let reply = manager.region_server_report(&s1, Vec::new())?;
        assert_eq!(reply, vec![RegionMsg::OpenRegion(info.clone())]);

        // open confirmed: pending + catalog work queued
        let reply = manager
            .region_server_report(&s1, vec![RegionMsg::ReportOpen(info.clone())])?;
        assert!(reply.is_empty());
        assert!(!region_manager.is_unassigned(info.region_name()));
        assert!(region_manager.is_pending(info.region_name()));
        assert!(matches!(
            rx_todo.try_recv(),
            Ok(MasterOp::RegionOpened { .. })
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_open_is_closed_without_report() -> Result<(), TesseraError>
    {
        let (manager, _, _rx_todo, _rx_exp) = setup(MasterConfig::default());
        let s1 = server("s1", 1);
        manager.region_server_startup(&s1)?;

        // report open for a region the master never assigned
        let info = region(2);
        let reply = manager
            .region_server_report(&s1, vec![RegionMsg::ReportOpen(info.clone())])?;
        assert_eq!(
            reply,
            vec![RegionMsg::CloseRegion {
                info,
                report: false
            }]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_report_releases_regions() -> Result<(), TesseraError> {
        let (manager, region_manager, _rx_todo, _rx_exp) =
            setup(MasterConfig::default());
        let s1 = server("s1", 1);
        manager.region_server_startup(&s1)?;

        let info = region(3);
        let reply = manager.region_server_report(
            &s1,
            vec![
                RegionMsg::ReportExiting,
                RegionMsg::ReportClose(info.clone()),
            ],
        )?;
        assert!(reply.is_empty());
        assert!(region_manager.is_unassigned(info.region_name()));
        assert_eq!(manager.num_servers(), 0);

        // a second exit report is not processed twice
        let reply = manager.region_server_report(
            &s1,
            vec![RegionMsg::ReportExiting],
        )?;
        assert!(reply.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lease_expiry_queues_shutdown_processing() -> Result<(), TesseraError>
    {
        let (manager, _, mut rx_todo, mut rx_expired) = setup(MasterConfig {
            lease_period_ms: 50,
            lease_check_interval_ms: 10,
            ..Default::default()
        });
        manager.region_server_startup(&server("s1", 7))?;

        let expired = rx_expired.recv().await.unwrap();
        assert_eq!(expired, "s1");
        manager.handle_lease_expiry(&expired);

        assert!(manager.is_dead("s1"));
        assert_eq!(manager.num_servers(), 0);
        match rx_todo.try_recv() {
            Ok(MasterOp::ServerShutdown {
                address,
                start_code,
            }) => {
                assert_eq!(address, "s1");
                assert_eq!(start_code, 7);
            }
            other => panic!("expected shutdown op, got {:?}", other),
        }
        Ok(())
    }
}
