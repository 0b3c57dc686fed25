use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{Error, Result};

pub const ROWSET_ID_VERSION: u8 = 2;

/// Opaque 192-bit rowset identifier plus a format version tag.
/// Totally ordered; embedded into every rowset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RowsetId {
    pub hi: u64,
    pub mi: u64,
    pub lo: u64,
    pub version: u8,
}

static ROWSET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl RowsetId {
    pub fn new(hi: u64, mi: u64, lo: u64) -> Self {
        RowsetId { hi, mi, lo, version: ROWSET_ID_VERSION }
    }

    /// Generate a fresh id: random words plus a process-local counter so ids
    /// created in the same instant still differ.
    pub fn generate() -> Self {
        let (hi, mi) = Uuid::new_v4().as_u64_pair();
        let lo = ROWSET_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        RowsetId { hi, mi, lo, version: ROWSET_ID_VERSION }
    }
}

impl fmt::Display for RowsetId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}{:016x}{:016x}{:016x}", self.version, self.hi, self.mi, self.lo)
    }
}

impl FromStr for RowsetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 50 {
            return Err(Error::corruption(format!("malformed rowset id: {s}")));
        }
        let parse = |range: std::ops::Range<usize>| {
            u64::from_str_radix(&s[range], 16)
                .map_err(|e| Error::corruption(format!("malformed rowset id: {s}: {e}")))
        };
        Ok(RowsetId {
            version: parse(0..2)? as u8,
            hi: parse(2..18)?,
            mi: parse(18..34)?,
            lo: parse(34..50)?,
        })
    }
}

/// Closed version interval `[start, end]`. Versions of a tablet's live
/// rowsets partition `[0, max_version]` contiguously.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version {
    pub start: i64,
    pub end: i64,
}

impl Version {
    pub fn new(start: i64, end: i64) -> Self {
        Version { start, end }
    }

    pub fn single(v: i64) -> Self {
        Version { start: v, end: v }
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, other: &Version) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    pub fn overlaps(&self, other: &Version) -> bool {
        !(self.start > other.end || self.end < other.start)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

/// Pointer-free descriptor of one rowset. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsetMeta {
    pub rowset_id: RowsetId,
    pub tablet_id: i64,
    pub txn_id: i64,
    pub version: Version,
    pub num_rows: u64,
    pub total_size_bytes: u64,
    pub num_segments: u32,
    pub schema_hash: i32,
    pub has_delete_predicate: bool,
    pub creation_time: DateTime<Utc>,
}

impl RowsetMeta {
    pub fn new(rowset_id: RowsetId, tablet_id: i64, version: Version) -> Self {
        RowsetMeta {
            rowset_id,
            tablet_id,
            txn_id: 0,
            version,
            num_rows: 0,
            total_size_bytes: 0,
            num_segments: 0,
            schema_hash: 0,
            has_delete_predicate: false,
            creation_time: Utc::now(),
        }
    }

    pub fn start_version(&self) -> i64 {
        self.version.start
    }

    pub fn end_version(&self) -> i64 {
        self.version.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rowset_id_round_trip() {
        let id = RowsetId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 50);
        assert_eq!(s.parse::<RowsetId>().unwrap(), id);
    }

    #[test]
    fn test_rowset_id_ordering() {
        let a = RowsetId::new(1, 0, 0);
        let b = RowsetId::new(1, 0, 1);
        let c = RowsetId::new(2, 0, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_version_overlaps() {
        let v = Version::new(3, 7);
        assert!(v.overlaps(&Version::new(7, 9)));
        assert!(v.overlaps(&Version::new(0, 3)));
        assert!(!v.overlaps(&Version::new(8, 9)));
        assert!(v.contains(&Version::single(5)));
        assert!(!v.is_single());
    }
}
