//! Catalog row schema and the access seam the master consumes.
//!
//! The catalog is stored as regular regions of the system itself: the root
//! region lists the meta regions, the meta regions list all user regions.
//! One row per region, keyed by region name, with the serialized descriptor,
//! the serving server's address and start code, and (for split parents) the
//! two daughter descriptors. The master is the only writer.
//!
//! The wire transport to remote catalog regions is out of scope; the
//! `CatalogAccess` trait is the seam, and `LocalCatalog` is the in-process
//! implementation used by tests and single-process clusters. Implementations
//! signal an unreachable catalog region with `NotServingRegion`, which the
//! master retries with backoff.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use crate::descriptors::RegionInfo;
use crate::keys::LATEST_TIMESTAMP;
use crate::server::{BatchUpdate, Region};
use crate::utils::TesseraError;

use async_trait::async_trait;

use bytes::Bytes;

/// Catalog column holding the serialized region descriptor.
pub const COL_REGIONINFO: &str = "info:regioninfo";

/// Catalog column holding the serving server's address.
pub const COL_SERVER: &str = "info:server";

/// Catalog column holding the serving server's start code.
pub const COL_STARTCODE: &str = "info:startcode";

/// Catalog columns holding a split parent's daughter descriptors.
pub const COL_SPLIT_A: &str = "info:splita";
pub const COL_SPLIT_B: &str = "info:splitb";

/// One parsed catalog row.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub info: RegionInfo,
    pub server: Option<String>,
    pub start_code: Option<u64>,
    pub split_a: Option<RegionInfo>,
    pub split_b: Option<RegionInfo>,
}

/// Access to catalog regions, wherever they are served.
#[async_trait]
pub trait CatalogAccess: Send + Sync {
    /// Scans all rows of one catalog region.
    async fn scan_catalog(
        &self,
        catalog_region: &str,
    ) -> Result<Vec<CatalogEntry>, TesseraError>;

    /// Writes (or overwrites) the descriptor column of a region's row.
    async fn put_region_info(
        &self,
        catalog_region: &str,
        info: &RegionInfo,
    ) -> Result<(), TesseraError>;

    /// Records where a region is being served.
    async fn set_location(
        &self,
        catalog_region: &str,
        region_name: &str,
        server: &str,
        start_code: u64,
    ) -> Result<(), TesseraError>;

    /// Clears a region's serving location.
    async fn clear_location(
        &self,
        catalog_region: &str,
        region_name: &str,
    ) -> Result<(), TesseraError>;

    /// Rewrites a split parent's row: tombstoned descriptor plus daughter
    /// references.
    async fn write_split(
        &self,
        catalog_region: &str,
        parent: &RegionInfo,
        daughter_a: &RegionInfo,
        daughter_b: &RegionInfo,
    ) -> Result<(), TesseraError>;

    /// Deletes a region's row entirely.
    async fn delete_row(
        &self,
        catalog_region: &str,
        region_name: &str,
    ) -> Result<(), TesseraError>;
}

/// In-process catalog access, backed by catalog regions hosted in the same
/// process and registered here as they come online.
#[derive(Default)]
pub struct LocalCatalog {
    regions: StdRwLock<HashMap<String, Arc<Region>>>,
}

impl LocalCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a hosted catalog region reachable under its name.
    pub fn register_region(&self, region: Arc<Region>) {
        self.regions
            .write()
            .unwrap()
            .insert(region.region_name().to_string(), region);
    }

    pub fn deregister_region(&self, region_name: &str) {
        self.regions.write().unwrap().remove(region_name);
    }

    fn region(&self, name: &str) -> Result<Arc<Region>, TesseraError> {
        self.regions
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .filter(|r| !r.is_closed())
            .ok_or_else(|| TesseraError::NotServingRegion(name.to_string()))
    }
}

fn decode_info(bytes: &Bytes) -> Result<RegionInfo, TesseraError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[async_trait]
impl CatalogAccess for LocalCatalog {
    async fn scan_catalog(
        &self,
        catalog_region: &str,
    ) -> Result<Vec<CatalogEntry>, TesseraError> {
        let region = self.region(catalog_region)?;
        let mut scanner =
            region.get_scanner(&["info:"], b"", LATEST_TIMESTAMP)?;
        let mut entries = Vec::new();
        while let Some((row, columns)) = scanner.next_row() {
            let info = match columns.get(COL_REGIONINFO) {
                Some(bytes) => decode_info(bytes)?,
                None => {
                    pf_warn!(
                        "catalog row {:?} has no region descriptor; skipping",
                        row
                    );
                    continue;
                }
            };
            let server = columns
                .get(COL_SERVER)
                .map(|b| String::from_utf8_lossy(b).into_owned());
            let start_code = match columns.get(COL_STARTCODE) {
                Some(b) => String::from_utf8_lossy(b).parse::<u64>().ok(),
                None => None,
            };
            let split_a = match columns.get(COL_SPLIT_A) {
                Some(b) => Some(decode_info(b)?),
                None => None,
            };
            let split_b = match columns.get(COL_SPLIT_B) {
                Some(b) => Some(decode_info(b)?),
                None => None,
            };
            entries.push(CatalogEntry {
                info,
                server,
                start_code,
                split_a,
                split_b,
            });
        }
        scanner.close();
        Ok(entries)
    }

    async fn put_region_info(
        &self,
        catalog_region: &str,
        info: &RegionInfo,
    ) -> Result<(), TesseraError> {
        let region = self.region(catalog_region)?;
        let bytes = rmp_serde::to_vec(info)?;
        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(info.region_name().as_bytes().to_vec())
                    .put(COL_REGIONINFO, bytes),
            )
            .await
    }

    async fn set_location(
        &self,
        catalog_region: &str,
        region_name: &str,
        server: &str,
        start_code: u64,
    ) -> Result<(), TesseraError> {
        let region = self.region(catalog_region)?;
        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(region_name.as_bytes().to_vec())
                    .put(COL_SERVER, server.as_bytes().to_vec())
                    .put(COL_STARTCODE, start_code.to_string().into_bytes()),
            )
            .await
    }

    async fn clear_location(
        &self,
        catalog_region: &str,
        region_name: &str,
    ) -> Result<(), TesseraError> {
        let region = self.region(catalog_region)?;
        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(region_name.as_bytes().to_vec())
                    .delete(COL_SERVER)
                    .delete(COL_STARTCODE),
            )
            .await
    }

    async fn write_split(
        &self,
        catalog_region: &str,
        parent: &RegionInfo,
        daughter_a: &RegionInfo,
        daughter_b: &RegionInfo,
    ) -> Result<(), TesseraError> {
        let region = self.region(catalog_region)?;
        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(parent.region_name().as_bytes().to_vec())
                    .put(COL_REGIONINFO, rmp_serde::to_vec(parent)?)
                    .put(COL_SPLIT_A, rmp_serde::to_vec(daughter_a)?)
                    .put(COL_SPLIT_B, rmp_serde::to_vec(daughter_b)?)
                    .delete(COL_SERVER)
                    .delete(COL_STARTCODE),
            )
            .await
    }

    async fn delete_row(
        &self,
        catalog_region: &str,
        region_name: &str,
    ) -> Result<(), TesseraError> {
        let region = self.region(catalog_region)?;
        region
            .batch_update(
                LATEST_TIMESTAMP,
                BatchUpdate::new(region_name.as_bytes().to_vec())
                    .delete(COL_REGIONINFO)
                    .delete(COL_SERVER)
                    .delete(COL_STARTCODE)
                    .delete(COL_SPLIT_A)
                    .delete(COL_SPLIT_B),
            )
            .await
    }
}

#[cfg(test)]
mod catalog_tests {
    use super::*;
    use crate::descriptors::{FamilyDescriptor, TableDescriptor};
    use crate::server::{ServerConfig, Wal};
    use std::path::Path;

    async fn open_meta(root: &Path) -> (Arc<Wal>, Arc<Region>) {
        let log = Arc::new(
            Wal::new_and_setup(root.join("log_meta"), 100_000, false, None)
                .await
                .unwrap(),
        );
        let region = Region::open(
            root,
            log.clone(),
            RegionInfo::first_meta_region(),
            Arc::new(ServerConfig::default()),
            None,
        )
        .await
        .unwrap();
        (log, Arc::new(region))
    }

    fn user_region() -> RegionInfo {
        let desc = TableDescriptor::new("t")
            .unwrap()
            .add_family(FamilyDescriptor::new("f").unwrap());
        RegionInfo::with_id(5, desc, "", "")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn catalog_round_trip() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let (_log, meta) = open_meta(tmp.path()).await;
        let meta_name = meta.region_name().to_string();
        let catalog = LocalCatalog::new();
        catalog.register_region(meta.clone());

        let info = user_region();
        catalog.put_region_info(&meta_name, &info).await?;
        catalog
            .set_location(&meta_name, info.region_name(), "10.0.0.1:60020", 42)
            .await?;

        let entries = catalog.scan_catalog(&meta_name).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].info, info);
        assert_eq!(entries[0].server.as_deref(), Some("10.0.0.1:60020"));
        assert_eq!(entries[0].start_code, Some(42));

        catalog
            .clear_location(&meta_name, info.region_name())
            .await?;
        let entries = catalog.scan_catalog(&meta_name).await?;
        assert_eq!(entries[0].server, None);
        assert_eq!(entries[0].start_code, None);

        catalog.delete_row(&meta_name, info.region_name()).await?;
        assert!(catalog.scan_catalog(&meta_name).await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn split_row_carries_daughters() -> Result<(), TesseraError> {
        let tmp = tempfile::tempdir().unwrap();
        let (_log, meta) = open_meta(tmp.path()).await;
        let meta_name = meta.region_name().to_string();
        let catalog = LocalCatalog::new();
        catalog.register_region(meta.clone());

        let mut parent = user_region();
        catalog.put_region_info(&meta_name, &parent).await?;

        parent.offline = true;
        parent.split = true;
        let a = RegionInfo::with_id(6, parent.table_desc.clone(), "", "m");
        let b = RegionInfo::with_id(7, parent.table_desc.clone(), "m", "");
        catalog.write_split(&meta_name, &parent, &a, &b).await?;

        let entries = catalog.scan_catalog(&meta_name).await?;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].info.split && entries[0].info.offline);
        assert_eq!(entries[0].split_a.as_ref(), Some(&a));
        assert_eq!(entries[0].split_b.as_ref(), Some(&b));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unregistered_region_is_not_serving() {
        let catalog = LocalCatalog::new();
        assert!(matches!(
            catalog.scan_catalog("nowhere").await,
            Err(TesseraError::NotServingRegion(_))
        ));
    }
}
