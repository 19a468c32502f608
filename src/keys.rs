//! Cell key type and column-name helpers.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::utils::TesseraError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Timestamp sentinel meaning "the newest version there is".
pub const LATEST_TIMESTAMP: u64 = u64::MAX;

/// Current wall-clock time in milliseconds, the commit timestamp resolution.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Key addressing one version of one cell: a row, a `family:qualifier`
/// column, and a timestamp. Keys order by row ascending, then column
/// ascending, then timestamp descending, so that iterating a sorted cell map
/// visits the newest version of a cell first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreKey {
    pub row: Bytes,
    pub column: String,
    pub timestamp: u64,
}

impl StoreKey {
    pub fn new(
        row: impl Into<Bytes>,
        column: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        StoreKey {
            row: row.into(),
            column: column.into(),
            timestamp,
        }
    }

    /// Approximate heap footprint, used for memstore size accounting.
    pub fn heap_size(&self) -> usize {
        self.row.len() + self.column.len() + 8
    }

    /// True if this key names the same cell (row + column) as `other`,
    /// ignoring the version timestamp.
    pub fn same_cell(&self, other: &StoreKey) -> bool {
        self.row == other.row && self.column == other.column
    }
}

impl Ord for StoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.column.cmp(&other.column))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for StoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Extracts the family part of a `family:qualifier` column name, validating
/// its shape. Family names are word-characters only, cannot be empty, and
/// the separating colon is mandatory.
pub fn family_of(column: &str) -> Result<&str, TesseraError> {
    let family = match column.split_once(':') {
        Some((family, _)) => family,
        None => {
            return Err(TesseraError::InvalidColumn(format!(
                "column '{}' missing family delimiter ':'",
                column
            )))
        }
    };
    validate_family_name(family)?;
    Ok(family)
}

/// Checks a bare family name (no colon) for legality.
pub fn validate_family_name(family: &str) -> Result<(), TesseraError> {
    if family.is_empty()
        || !family
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(TesseraError::InvalidColumn(format!(
            "malformed family name '{}'",
            family
        )));
    }
    Ok(())
}

/// True if `column` is a whole-family wildcard selector, i.e. `family:`
/// with an empty qualifier.
pub fn is_family_wildcard(column: &str) -> bool {
    column.ends_with(':')
}

/// True if the given column selector matches the concrete column name.
/// Selectors are either full `family:qualifier` names or `family:`
/// wildcards.
pub fn column_matches(selector: &str, column: &str) -> bool {
    if is_family_wildcard(selector) {
        column.starts_with(selector)
    } else {
        column == selector
    }
}
