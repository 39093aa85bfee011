//! One-to-many side tables keyed by an owning entity's key.
//!
//! Data-point notes, region restrictions, and user-field values are stored
//! apart from the [`DataPoint`](crate::model::DataPoint) rows they annotate,
//! keyed by the same opaque keys. [`SideTable`] makes that pattern explicit:
//! a keyed auxiliary table whose rows live and die with their owner. The
//! store's data-point delete path removes the matching row from every side
//! table, and the data-point change snapshot carries the rows so undo
//! restores them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::key::Key;

/// Auxiliary rows keyed by owner entity key. Iteration follows insertion
/// order, matching the owning table's key iteration guarantees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideTable<V> {
    rows: IndexMap<Key, V>,
}

impl<V> Default for SideTable<V> {
    fn default() -> Self {
        SideTable {
            rows: IndexMap::new(),
        }
    }
}

impl<V> SideTable<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, owner: &Key) -> Option<&V> {
        self.rows.get(owner)
    }

    /// Inserts or replaces the row for `owner`, returning the old row.
    pub fn insert(&mut self, owner: Key, row: V) -> Option<V> {
        self.rows.insert(owner, row)
    }

    /// Removes the row for `owner`, preserving the order of the remaining
    /// rows.
    pub fn remove(&mut self, owner: &Key) -> Option<V> {
        self.rows.shift_remove(owner)
    }

    pub fn contains(&self, owner: &Key) -> bool {
        self.rows.contains_key(owner)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> + '_ {
        self.rows.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &V)> + '_ {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A data point's region restriction: the measurement only applies within
/// the named embryonic regions. Legacy imports carry a free-text value
/// instead of a region list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRestriction {
    pub legacy_value: Option<String>,
    pub regions: SmallVec<[String; 2]>,
}

impl RegionRestriction {
    /// A restriction to an explicit list of regions.
    pub fn regions(regions: impl IntoIterator<Item = String>) -> Self {
        RegionRestriction {
            legacy_value: None,
            regions: regions.into_iter().collect(),
        }
    }

    /// A legacy free-text restriction.
    pub fn legacy(value: impl Into<String>) -> Self {
        RegionRestriction {
            legacy_value: Some(value.into()),
            regions: SmallVec::new(),
        }
    }
}
