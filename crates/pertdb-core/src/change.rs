//! Change records: the reversible unit of every store mutation.
//!
//! Every mutator produces a [`Change`]: a tagged variant per entity kind or
//! side-table family carrying the key, an owned before-snapshot, an owned
//! after-snapshot, and the store serial on either side of the mutation.
//! `before = None` encodes creation, `after = None` deletion, both present a
//! modification. Snapshots are cloned at record time; no aliasing exists
//! between a live entity and the snapshot inside a change.
//!
//! Undo and redo replay these records against the store
//! ([`PerturbStore::change_undo`](crate::store::PerturbStore::change_undo) /
//! [`change_redo`](crate::store::PerturbStore::change_redo)); dispatch is an
//! exhaustive `match`, so there is no "unknown tag" failure path.
//!
//! Multi-entity operations (bulk delete, merge) are ordered lists of
//! changes. Grouping them into one logical undo transaction is the caller's
//! concern; a change knows nothing about its neighbors.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::key::Key;
use crate::model::{
    Annotation, Condition, Control, DataPoint, Experiment, Investigator, KeyList, MeasureProp,
    MeasureScale, PertSource, PertType, SourceName, Target, UserField,
};
use crate::side::RegionRestriction;

/// Before/after snapshot pair for one keyed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta<S> {
    pub key: Key,
    pub before: Option<S>,
    pub after: Option<S>,
    pub serial_before: u64,
    pub serial_after: u64,
}

impl<S> Delta<S> {
    pub fn created(key: Key, after: S, serial_before: u64, serial_after: u64) -> Self {
        Delta {
            key,
            before: None,
            after: Some(after),
            serial_before,
            serial_after,
        }
    }

    pub fn deleted(key: Key, before: S, serial_before: u64, serial_after: u64) -> Self {
        Delta {
            key,
            before: Some(before),
            after: None,
            serial_before,
            serial_after,
        }
    }

    pub fn modified(
        key: Key,
        before: S,
        after: S,
        serial_before: u64,
        serial_after: u64,
    ) -> Self {
        Delta {
            key,
            before: Some(before),
            after: Some(after),
            serial_before,
            serial_after,
        }
    }

    pub fn is_creation(&self) -> bool {
        self.before.is_none()
    }

    pub fn is_deletion(&self) -> bool {
        self.after.is_none()
    }
}

/// Everything a data point owns: its row plus the side-table rows keyed by
/// its key. A single change round-trips the whole record, so undoing a
/// data-point deletion restores notes, region restriction, and user-field
/// values along with the point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointSnapshot {
    pub point: DataPoint,
    pub notes: KeyList,
    pub region: Option<RegionRestriction>,
    pub user_values: IndexMap<Key, String>,
}

impl DataPointSnapshot {
    /// A snapshot of a point with no side-table rows.
    pub fn bare(point: DataPoint) -> Self {
        DataPointSnapshot {
            point,
            notes: KeyList::new(),
            region: None,
            user_values: IndexMap::new(),
        }
    }
}

/// One recorded mutation. One variant per entity kind, plus one per
/// side-table family for side rows mutated independently of their owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Change {
    Investigator(Delta<Investigator>),
    Target(Delta<Target>),
    SourceName(Delta<SourceName>),
    PertSource(Delta<PertSource>),
    Experiment(Delta<Experiment>),
    DataPoint(Delta<DataPointSnapshot>),
    PertType(Delta<PertType>),
    MeasureScale(Delta<MeasureScale>),
    MeasureProp(Delta<MeasureProp>),
    Condition(Delta<Condition>),
    Control(Delta<Control>),
    Annotation(Delta<Annotation>),
    UserField(Delta<UserField>),
    /// A data point's ordered annotation list changed in place.
    DataPointNotes(Delta<KeyList>),
    /// A data point's region restriction changed in place.
    RegionRestriction(Delta<RegionRestriction>),
    /// A data point's user-field value row changed in place.
    UserFieldValues(Delta<IndexMap<Key, String>>),
}

impl Change {
    /// The key of the record this change touched.
    pub fn key(&self) -> &Key {
        match self {
            Change::Investigator(d) => &d.key,
            Change::Target(d) => &d.key,
            Change::SourceName(d) => &d.key,
            Change::PertSource(d) => &d.key,
            Change::Experiment(d) => &d.key,
            Change::DataPoint(d) => &d.key,
            Change::PertType(d) => &d.key,
            Change::MeasureScale(d) => &d.key,
            Change::MeasureProp(d) => &d.key,
            Change::Condition(d) => &d.key,
            Change::Control(d) => &d.key,
            Change::Annotation(d) => &d.key,
            Change::UserField(d) => &d.key,
            Change::DataPointNotes(d) => &d.key,
            Change::RegionRestriction(d) => &d.key,
            Change::UserFieldValues(d) => &d.key,
        }
    }

    /// Store serial before this change was applied.
    pub fn serial_before(&self) -> u64 {
        match self {
            Change::Investigator(d) => d.serial_before,
            Change::Target(d) => d.serial_before,
            Change::SourceName(d) => d.serial_before,
            Change::PertSource(d) => d.serial_before,
            Change::Experiment(d) => d.serial_before,
            Change::DataPoint(d) => d.serial_before,
            Change::PertType(d) => d.serial_before,
            Change::MeasureScale(d) => d.serial_before,
            Change::MeasureProp(d) => d.serial_before,
            Change::Condition(d) => d.serial_before,
            Change::Control(d) => d.serial_before,
            Change::Annotation(d) => d.serial_before,
            Change::UserField(d) => d.serial_before,
            Change::DataPointNotes(d) => d.serial_before,
            Change::RegionRestriction(d) => d.serial_before,
            Change::UserFieldValues(d) => d.serial_before,
        }
    }

    /// Store serial after this change was applied.
    pub fn serial_after(&self) -> u64 {
        match self {
            Change::Investigator(d) => d.serial_after,
            Change::Target(d) => d.serial_after,
            Change::SourceName(d) => d.serial_after,
            Change::PertSource(d) => d.serial_after,
            Change::Experiment(d) => d.serial_after,
            Change::DataPoint(d) => d.serial_after,
            Change::PertType(d) => d.serial_after,
            Change::MeasureScale(d) => d.serial_after,
            Change::MeasureProp(d) => d.serial_after,
            Change::Condition(d) => d.serial_after,
            Change::Control(d) => d.serial_after,
            Change::Annotation(d) => d.serial_after,
            Change::UserField(d) => d.serial_after,
            Change::DataPointNotes(d) => d.serial_after,
            Change::RegionRestriction(d) => d.serial_after,
            Change::UserFieldValues(d) => d.serial_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_classification() {
        let key = Key::from("0");
        let made = Delta::created(key.clone(), 1u32, 0, 1);
        assert!(made.is_creation());
        assert!(!made.is_deletion());

        let gone = Delta::deleted(key.clone(), 1u32, 1, 2);
        assert!(gone.is_deletion());

        let edit = Delta::modified(key, 1u32, 2u32, 2, 3);
        assert!(!edit.is_creation());
        assert!(!edit.is_deletion());
    }

    #[test]
    fn change_serde_roundtrip_carries_tag() {
        let change = Change::Investigator(Delta::created(
            Key::from("5"),
            Investigator {
                name: "Smith".into(),
            },
            3,
            4,
        ));
        let json = serde_json::to_string(&change).unwrap();
        assert!(json.contains("\"type\":\"Investigator\""));

        let back: Change = serde_json::from_str(&json).unwrap();
        assert_eq!(change, back);
        assert_eq!(back.serial_before(), 3);
        assert_eq!(back.serial_after(), 4);
    }
}
