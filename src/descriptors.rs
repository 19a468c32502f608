//! Table, column-family, and region descriptors.

use std::collections::BTreeMap;

use crate::keys::validate_family_name;
use crate::utils::TesseraError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Reserved table name of the root catalog region, which lists the meta
/// catalog regions.
pub const ROOT_TABLE_NAME: &str = "__root__";

/// Reserved table name of the meta catalog regions, which list all user
/// regions.
pub const META_TABLE_NAME: &str = "__meta__";

/// Per-column-family schema information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyDescriptor {
    /// Family name (no colon).
    pub name: String,

    /// Number of cell versions retained past compaction.
    pub max_versions: u32,
}

impl FamilyDescriptor {
    pub fn new(name: impl Into<String>) -> Result<Self, TesseraError> {
        let name = name.into();
        validate_family_name(&name)?;
        Ok(FamilyDescriptor {
            name,
            max_versions: 3,
        })
    }
}

/// Schema of one table: its name and column families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub families: BTreeMap<String, FamilyDescriptor>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Result<Self, TesseraError> {
        let name = name.into();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(TesseraError::msg(format!(
                "illegal table name '{}'",
                name
            )));
        }
        Ok(TableDescriptor {
            name,
            families: BTreeMap::new(),
        })
    }

    pub fn add_family(mut self, family: FamilyDescriptor) -> Self {
        self.families.insert(family.name.clone(), family);
        self
    }

    pub fn has_family(&self, family: &str) -> bool {
        self.families.contains_key(family)
    }

    pub fn is_root(&self) -> bool {
        self.name == ROOT_TABLE_NAME
    }

    pub fn is_meta(&self) -> bool {
        self.name == META_TABLE_NAME
    }

    /// Descriptor shared by both catalog tables: a single `info` family
    /// keeping every written version of the assignment columns is overkill,
    /// so retention stays at one.
    fn catalog(name: &str) -> Self {
        TableDescriptor {
            name: name.into(),
            families: BTreeMap::from([(
                "info".into(),
                FamilyDescriptor {
                    name: "info".into(),
                    max_versions: 1,
                },
            )]),
        }
    }
}

fn hex_of(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Stable hash of a region name, used for filesystem directory names. Must
/// be computable from the bare name string so log splitting can place
/// replay files without the full descriptor at hand.
pub fn encoded_name_of(region_name: &str) -> u32 {
    crc32fast::hash(region_name.as_bytes())
}

/// Descriptor of one region: a contiguous half-open key range
/// `[start_key, end_key)` of one table. An empty `start_key` means the
/// beginning of the keyspace; an empty `end_key` means its end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    /// Distinguishes consecutive incarnations of the same key range
    /// (creation time in milliseconds).
    pub region_id: u64,

    pub table_desc: TableDescriptor,
    pub start_key: Bytes,
    pub end_key: Bytes,

    /// Region name: unique, derived from table + start key + region id; used
    /// as this region's row key in the catalog.
    name: String,

    /// Stable hash of the name, used for filesystem paths.
    encoded: u32,

    /// True once the region has been taken out of service (split parents,
    /// disabled tables).
    pub offline: bool,

    /// True once the region has split; retained until daughters no longer
    /// reference its files.
    pub split: bool,
}

impl RegionInfo {
    pub fn new(
        table_desc: TableDescriptor,
        start_key: impl Into<Bytes>,
        end_key: impl Into<Bytes>,
    ) -> Self {
        Self::with_id(
            crate::keys::now_millis(),
            table_desc,
            start_key,
            end_key,
        )
    }

    pub fn with_id(
        region_id: u64,
        table_desc: TableDescriptor,
        start_key: impl Into<Bytes>,
        end_key: impl Into<Bytes>,
    ) -> Self {
        let start_key = start_key.into();
        let name = format!(
            "{},{},{}",
            table_desc.name,
            hex_of(&start_key),
            region_id
        );
        let encoded = encoded_name_of(&name);
        RegionInfo {
            region_id,
            table_desc,
            start_key,
            end_key: end_key.into(),
            name,
            encoded,
            offline: false,
            split: false,
        }
    }

    /// The singleton root catalog region.
    pub fn root_region() -> Self {
        Self::with_id(0, TableDescriptor::catalog(ROOT_TABLE_NAME), "", "")
    }

    /// The first (initially only) meta catalog region.
    pub fn first_meta_region() -> Self {
        Self::with_id(1, TableDescriptor::catalog(META_TABLE_NAME), "", "")
    }

    pub fn region_name(&self) -> &str {
        &self.name
    }

    /// Stable integer encoding of the region name, for directory names.
    pub fn encoded_name(&self) -> u32 {
        self.encoded
    }

    pub fn table_name(&self) -> &str {
        &self.table_desc.name
    }

    pub fn is_root(&self) -> bool {
        self.table_desc.is_root()
    }

    pub fn is_meta_table(&self) -> bool {
        self.table_desc.is_meta()
    }

    /// True if `row` falls inside this region's half-open key range.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        self.start_key.as_ref() <= row
            && (self.end_key.is_empty() || row < self.end_key.as_ref())
    }
}

#[cfg(test)]
mod descriptors_tests {
    use super::*;

    fn table_t() -> TableDescriptor {
        TableDescriptor::new("t")
            .unwrap()
            .add_family(FamilyDescriptor::new("f").unwrap())
    }

    #[test]
    fn region_name_derivation() {
        let info = RegionInfo::with_id(42, table_t(), &b"aa"[..], &b"zz"[..]);
        assert_eq!(info.region_name(), "t,6161,42");
        // stable across re-derivation
        let again = RegionInfo::with_id(42, table_t(), &b"aa"[..], &b"zz"[..]);
        assert_eq!(info.encoded_name(), again.encoded_name());
    }

    #[test]
    fn region_row_bounds() {
        let info = RegionInfo::with_id(7, table_t(), &b"b"[..], &b"m"[..]);
        assert!(info.contains_row(b"b"));
        assert!(info.contains_row(b"czz"));
        assert!(!info.contains_row(b"m"));
        assert!(!info.contains_row(b"a"));

        let open = RegionInfo::with_id(8, table_t(), "", "");
        assert!(open.contains_row(b""));
        assert!(open.contains_row(b"anything"));
    }

    #[test]
    fn catalog_tables() {
        assert!(RegionInfo::root_region().is_root());
        assert!(RegionInfo::first_meta_region().is_meta_table());
        assert!(!RegionInfo::first_meta_region().is_root());
    }

    #[test]
    fn illegal_names_rejected() {
        assert!(TableDescriptor::new("has space").is_err());
        assert!(FamilyDescriptor::new("has:colon").is_err());
    }
}
