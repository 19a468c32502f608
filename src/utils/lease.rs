//! Generic expiring-lease registry.
//!
//! Several server classes need to track external parties that occasionally
//! send heartbeats: the master tracks storage servers, a storage server
//! tracks clients holding open scanners. Those parties hold resources that
//! must be released if no heartbeat arrives within the lease period. An
//! expired lease's name is delivered exactly once over the expiration
//! channel handed out at setup; the owning event loop reacts from there.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::utils::TesseraError;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

struct LeaseTable {
    /// Map from lease name to its current expiration instant.
    leases: HashMap<String, Instant>,

    /// Set when shutting down; no new leases may be created.
    draining: bool,
}

/// Expiring-lease registry. Spawns a checker task that scans for expired
/// leases every `check_interval` and pushes their names onto the expiration
/// channel.
pub struct LeaseManager {
    /// Length of time a lease stays valid without renewal.
    period: Duration,

    /// Shared lease table, also read by the checker task.
    table: Arc<Mutex<LeaseTable>>,

    /// Join handle of the checker task.
    checker_handle: JoinHandle<()>,
}

impl LeaseManager {
    /// Creates a new lease registry and spawns its checker task. Returns the
    /// registry together with the receiver side of the expiration channel.
    pub fn new_and_setup(
        period: Duration,
        check_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let table = Arc::new(Mutex::new(LeaseTable {
            leases: HashMap::new(),
            draining: false,
        }));
        let (tx_expired, rx_expired) = mpsc::unbounded_channel();

        let checker_handle =
            tokio::spawn(Self::checker_task(table.clone(), check_interval, tx_expired));

        (
            LeaseManager {
                period,
                table,
                checker_handle,
            },
            rx_expired,
        )
    }

    /// Obtain a lease under the given name.
    pub fn create_lease(&self, name: &str) -> Result<(), TesseraError> {
        let mut table = self.table.lock().unwrap();
        if table.draining {
            return Err(TesseraError::msg(format!(
                "lease registry draining; refusing lease '{}'",
                name
            )));
        }
        if table.leases.contains_key(name) {
            return Err(TesseraError::LeaseStillHeld(name.into()));
        }
        table
            .leases
            .insert(name.into(), Instant::now() + self.period);
        Ok(())
    }

    /// Renew a lease, pushing its expiration a full period into the future.
    pub fn renew_lease(&self, name: &str) -> Result<(), TesseraError> {
        let mut table = self.table.lock().unwrap();
        match table.leases.get_mut(name) {
            Some(expiry) => {
                *expiry = Instant::now() + self.period;
                Ok(())
            }
            None => Err(TesseraError::msg(format!(
                "lease '{}' does not exist",
                name
            ))),
        }
    }

    /// Explicitly cancel a lease. Returns true if the lease existed (and so
    /// was cancelled by this call); its expiration will never fire.
    pub fn cancel_lease(&self, name: &str) -> bool {
        let mut table = self.table.lock().unwrap();
        table.leases.remove(name).is_some()
    }

    /// Number of leases currently outstanding.
    pub fn num_leases(&self) -> usize {
        self.table.lock().unwrap().leases.len()
    }

    /// Stop handing out new leases and let the checker task exit once every
    /// outstanding lease has expired or been cancelled. Use this when lease
    /// holders could lose data or leak locks if cut off violently.
    pub fn close_after_leases_expire(&self) {
        self.table.lock().unwrap().draining = true;
    }

    /// Shut down immediately. All pending leases are destroyed without
    /// expiration callbacks.
    pub fn close(&self) {
        {
            let mut table = self.table.lock().unwrap();
            table.draining = true;
            table.leases.clear();
        }
        self.checker_handle.abort();
    }

    /// Checker task: periodically sweep the table for expired leases.
    async fn checker_task(
        table: Arc<Mutex<LeaseTable>>,
        check_interval: Duration,
        tx_expired: mpsc::UnboundedSender<String>,
    ) {
        let mut interval = time::interval(check_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;

            let mut expired = Vec::new();
            let drained = {
                let mut table = table.lock().unwrap();
                let now = Instant::now();
                table.leases.retain(|name, expiry| {
                    if *expiry <= now {
                        expired.push(name.clone());
                        false
                    } else {
                        true
                    }
                });
                table.draining && table.leases.is_empty()
            };
            for name in expired {
                if tx_expired.send(name).is_err() {
                    // receiver side dropped; nobody cares anymore
                    return;
                }
            }
            if drained {
                break;
            }
        }
        pf_debug!("lease checker task exited");
    }
}

#[cfg(test)]
mod lease_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lease_expires_once() -> Result<(), TesseraError> {
        let (leases, mut rx) = LeaseManager::new_and_setup(
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        leases.create_lease("srv-a")?;
        let name = rx.recv().await.unwrap();
        assert_eq!(name, "srv-a");
        assert_eq!(leases.num_leases(), 0);
        // no second delivery for the same lease
        time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lease_renewal_defers_expiry() -> Result<(), TesseraError> {
        let (leases, mut rx) = LeaseManager::new_and_setup(
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
        leases.create_lease("srv-b")?;
        for _ in 0..5 {
            time::sleep(Duration::from_millis(40)).await;
            leases.renew_lease("srv-b")?;
            assert!(rx.try_recv().is_err());
        }
        // stop renewing; expiration fires
        assert_eq!(rx.recv().await.unwrap(), "srv-b");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lease_cancel_suppresses_expiry() -> Result<(), TesseraError> {
        let (leases, mut rx) = LeaseManager::new_and_setup(
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        leases.create_lease("srv-c")?;
        assert!(leases.cancel_lease("srv-c"));
        assert!(!leases.cancel_lease("srv-c"));
        time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drain_mode_refuses_new_leases() -> Result<(), TesseraError> {
        let (leases, mut rx) = LeaseManager::new_and_setup(
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        leases.create_lease("old")?;
        leases.close_after_leases_expire();
        assert!(leases.create_lease("new").is_err());
        // the extant lease still gets its expiration
        assert_eq!(rx.recv().await.unwrap(), "old");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_lease_rejected() -> Result<(), TesseraError> {
        let (leases, _rx) = LeaseManager::new_and_setup(
            Duration::from_millis(200),
            Duration::from_millis(10),
        );
        leases.create_lease("srv-d")?;
        assert_eq!(
            leases.create_lease("srv-d"),
            Err(TesseraError::LeaseStillHeld("srv-d".into()))
        );
        Ok(())
    }
}
