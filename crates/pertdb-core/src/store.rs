//! PerturbStore: the single container owning every entity table.
//!
//! [`PerturbStore`] holds one keyed table per entity kind plus the
//! data-point side tables, a monotonically increasing serial number, and the
//! key minter. All tables are private; the public mutators below are the
//! only way to change state, and every state-changing call returns a
//! [`Change`] (or `None` when the call was a no-op). The serial number
//! advances by exactly one per recorded change and gates every derived
//! cache.
//!
//! Three method families make up the mutation surface:
//! - `provide_*` -- identity-resolving constructors. Structurally or
//!   nominally equal input resolves to the existing key with no change
//!   record; anything else mints a key and records a creation.
//! - `set_*` / `delete_*` -- keyed replacement and removal. Handing these a
//!   key absent from its table is a caller bug and panics; referential
//!   integrity ahead of a delete is the dependency analyzer's job, not
//!   re-checked here.
//! - `add_*_for_io` -- keyed insertion for the load path, which replays
//!   keys minted in an earlier session. These return `Result` (their input
//!   crosses the process boundary) and record no changes.
//!
//! Undo and redo ([`change_undo`](PerturbStore::change_undo) /
//! [`change_redo`](PerturbStore::change_redo)) replay change records with an
//! exhaustive match and reset the serial to the recorded value.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;

use crate::cache::Stale;
use crate::change::{Change, DataPointSnapshot, Delta};
use crate::error::StoreError;
use crate::key::{EntityKind, Key, KeyMinter};
use crate::model::{
    norm_name, same_name, Annotation, Condition, Control, DataPoint, Experiment, Investigator,
    KeyList, MeasureProp, MeasureScale, PertSource, PertType, SourceName, Target, UserField,
};
use crate::side::{RegionRestriction, SideTable};

/// Result of an identity-resolving `provide_*` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Provided {
    pub key: Key,
    /// `Some` only when the call created a new record.
    pub change: Option<Change>,
}

impl Provided {
    pub fn was_created(&self) -> bool {
        self.change.is_some()
    }
}

/// Result of providing a dictionary entry that carries fields beyond its
/// name. A name match with conflicting fields is reported as data, not an
/// error; deciding between the two candidates is the caller's call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvideOutcome {
    Resolved(Provided),
    /// An entry with the same normalized name exists but its other fields
    /// differ from the candidate's.
    NameConflict { existing: Key },
}

impl ProvideOutcome {
    /// The resolved key, if the provide did not hit a name conflict.
    pub fn key(&self) -> Option<&Key> {
        match self {
            ProvideOutcome::Resolved(p) => Some(&p.key),
            ProvideOutcome::NameConflict { .. } => None,
        }
    }

    /// The creation change, if one was recorded.
    pub fn change(self) -> Option<Change> {
        match self {
            ProvideOutcome::Resolved(p) => p.change,
            ProvideOutcome::NameConflict { .. } => None,
        }
    }
}

fn expect<'a, T>(table: &'a IndexMap<Key, T>, kind: EntityKind, key: &Key) -> &'a T {
    table
        .get(key)
        .unwrap_or_else(|| panic!("no {} under key '{}'", kind, key))
}

fn expect_remove<T>(table: &mut IndexMap<Key, T>, kind: EntityKind, key: &Key) -> T {
    table
        .shift_remove(key)
        .unwrap_or_else(|| panic!("no {} under key '{}'", kind, key))
}

/// Serial-gated derived views. Rebuilt lazily on first access after any
/// serial drift; dropped outright across undo/redo, where the serial moves
/// backwards and could otherwise alias an older build.
#[derive(Debug, Default)]
struct Caches {
    significant: Stale<BTreeSet<Key>>,
    investigator_names: Stale<HashMap<String, Key>>,
    source_name_names: Stale<HashMap<String, Key>>,
    target_names: Stale<HashMap<String, Key>>,
}

impl Caches {
    fn invalidate_all(&mut self) {
        self.significant.invalidate();
        self.investigator_names.invalidate();
        self.source_name_names.invalidate();
        self.target_names.invalidate();
    }
}

/// The entity store. See the module docs for the API contract.
#[derive(Debug, Default)]
pub struct PerturbStore {
    investigators: IndexMap<Key, Investigator>,
    targets: IndexMap<Key, Target>,
    source_names: IndexMap<Key, SourceName>,
    pert_sources: IndexMap<Key, PertSource>,
    experiments: IndexMap<Key, Experiment>,
    data_points: IndexMap<Key, DataPoint>,
    pert_types: IndexMap<Key, PertType>,
    measure_scales: IndexMap<Key, MeasureScale>,
    measure_props: IndexMap<Key, MeasureProp>,
    conditions: IndexMap<Key, Condition>,
    controls: IndexMap<Key, Control>,
    annotations: IndexMap<Key, Annotation>,
    user_fields: IndexMap<Key, UserField>,

    point_notes: SideTable<KeyList>,
    point_regions: SideTable<RegionRestriction>,
    point_user_values: SideTable<IndexMap<Key, String>>,

    serial: u64,
    minter: KeyMinter,
    caches: Caches,
}

impl PerturbStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current serial number: +1 per recorded change, restored exactly
    /// by undo, untouched by no-op mutator calls.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    fn advance(&mut self) -> (u64, u64) {
        let before = self.serial;
        self.serial += 1;
        (before, self.serial)
    }

    /// The kind of entity a key currently names, if any. Keys draw from a
    /// single space, so at most one table can claim a key.
    pub fn key_in_use(&self, key: &Key) -> Option<EntityKind> {
        if self.investigators.contains_key(key) {
            Some(EntityKind::Investigator)
        } else if self.targets.contains_key(key) {
            Some(EntityKind::Target)
        } else if self.source_names.contains_key(key) {
            Some(EntityKind::SourceName)
        } else if self.pert_sources.contains_key(key) {
            Some(EntityKind::PertSource)
        } else if self.experiments.contains_key(key) {
            Some(EntityKind::Experiment)
        } else if self.data_points.contains_key(key) {
            Some(EntityKind::DataPoint)
        } else if self.pert_types.contains_key(key) {
            Some(EntityKind::PertType)
        } else if self.measure_scales.contains_key(key) {
            Some(EntityKind::MeasureScale)
        } else if self.measure_props.contains_key(key) {
            Some(EntityKind::MeasureProp)
        } else if self.conditions.contains_key(key) {
            Some(EntityKind::Condition)
        } else if self.controls.contains_key(key) {
            Some(EntityKind::Control)
        } else if self.annotations.contains_key(key) {
            Some(EntityKind::Annotation)
        } else if self.user_fields.contains_key(key) {
            Some(EntityKind::UserField)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Lookup and iteration
    // -----------------------------------------------------------------------

    pub fn investigator(&self, key: &Key) -> Option<&Investigator> {
        self.investigators.get(key)
    }

    pub fn target(&self, key: &Key) -> Option<&Target> {
        self.targets.get(key)
    }

    pub fn source_name(&self, key: &Key) -> Option<&SourceName> {
        self.source_names.get(key)
    }

    pub fn pert_source(&self, key: &Key) -> Option<&PertSource> {
        self.pert_sources.get(key)
    }

    pub fn experiment(&self, key: &Key) -> Option<&Experiment> {
        self.experiments.get(key)
    }

    pub fn data_point(&self, key: &Key) -> Option<&DataPoint> {
        self.data_points.get(key)
    }

    pub fn pert_type(&self, key: &Key) -> Option<&PertType> {
        self.pert_types.get(key)
    }

    pub fn measure_scale(&self, key: &Key) -> Option<&MeasureScale> {
        self.measure_scales.get(key)
    }

    pub fn measure_prop(&self, key: &Key) -> Option<&MeasureProp> {
        self.measure_props.get(key)
    }

    pub fn condition(&self, key: &Key) -> Option<&Condition> {
        self.conditions.get(key)
    }

    pub fn control(&self, key: &Key) -> Option<&Control> {
        self.controls.get(key)
    }

    pub fn annotation(&self, key: &Key) -> Option<&Annotation> {
        self.annotations.get(key)
    }

    pub fn user_field(&self, key: &Key) -> Option<&UserField> {
        self.user_fields.get(key)
    }

    pub fn investigators(&self) -> impl Iterator<Item = (&Key, &Investigator)> + '_ {
        self.investigators.iter()
    }

    pub fn targets(&self) -> impl Iterator<Item = (&Key, &Target)> + '_ {
        self.targets.iter()
    }

    pub fn source_names(&self) -> impl Iterator<Item = (&Key, &SourceName)> + '_ {
        self.source_names.iter()
    }

    pub fn pert_sources(&self) -> impl Iterator<Item = (&Key, &PertSource)> + '_ {
        self.pert_sources.iter()
    }

    pub fn experiments(&self) -> impl Iterator<Item = (&Key, &Experiment)> + '_ {
        self.experiments.iter()
    }

    pub fn data_points(&self) -> impl Iterator<Item = (&Key, &DataPoint)> + '_ {
        self.data_points.iter()
    }

    pub fn pert_types(&self) -> impl Iterator<Item = (&Key, &PertType)> + '_ {
        self.pert_types.iter()
    }

    pub fn measure_scales(&self) -> impl Iterator<Item = (&Key, &MeasureScale)> + '_ {
        self.measure_scales.iter()
    }

    pub fn measure_props(&self) -> impl Iterator<Item = (&Key, &MeasureProp)> + '_ {
        self.measure_props.iter()
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&Key, &Condition)> + '_ {
        self.conditions.iter()
    }

    pub fn controls(&self) -> impl Iterator<Item = (&Key, &Control)> + '_ {
        self.controls.iter()
    }

    pub fn annotations(&self) -> impl Iterator<Item = (&Key, &Annotation)> + '_ {
        self.annotations.iter()
    }

    pub fn user_fields(&self) -> impl Iterator<Item = (&Key, &UserField)> + '_ {
        self.user_fields.iter()
    }

    pub fn data_point_notes(&self, point: &Key) -> Option<&KeyList> {
        self.point_notes.get(point)
    }

    pub fn region_restriction(&self, point: &Key) -> Option<&RegionRestriction> {
        self.point_regions.get(point)
    }

    pub fn user_field_values(&self, point: &Key) -> Option<&IndexMap<Key, String>> {
        self.point_user_values.get(point)
    }

    pub fn note_rows(&self) -> impl Iterator<Item = (&Key, &KeyList)> + '_ {
        self.point_notes.iter()
    }

    pub fn region_rows(&self) -> impl Iterator<Item = (&Key, &RegionRestriction)> + '_ {
        self.point_regions.iter()
    }

    pub fn user_value_rows(&self) -> impl Iterator<Item = (&Key, &IndexMap<Key, String>)> + '_ {
        self.point_user_values.iter()
    }

    // -----------------------------------------------------------------------
    // Name lookups and filtered scans
    // -----------------------------------------------------------------------

    /// Looks up an investigator by normalized name through the serial-gated
    /// name-inversion map (takes `&mut self` to refresh it when stale).
    pub fn investigator_by_name(&mut self, name: &str) -> Option<Key> {
        if !self.caches.investigator_names.is_fresh(self.serial) {
            let map = invert_names(&self.investigators, |inv| &inv.name);
            self.caches.investigator_names.put(self.serial, map);
        }
        lookup_norm(self.caches.investigator_names.get(), name)
    }

    /// Looks up a source name by normalized name (serial-gated map).
    pub fn source_name_by_name(&mut self, name: &str) -> Option<Key> {
        if !self.caches.source_name_names.is_fresh(self.serial) {
            let map = invert_names(&self.source_names, |sn| &sn.name);
            self.caches.source_name_names.put(self.serial, map);
        }
        lookup_norm(self.caches.source_name_names.get(), name)
    }

    /// Looks up a target by normalized name (serial-gated map).
    pub fn target_by_name(&mut self, name: &str) -> Option<Key> {
        if !self.caches.target_names.is_fresh(self.serial) {
            let map = invert_names(&self.targets, |t| &t.name);
            self.caches.target_names.put(self.serial, map);
        }
        lookup_norm(self.caches.target_names.get(), name)
    }

    pub fn condition_by_name(&self, name: &str) -> Option<Key> {
        scan_by_name(&self.conditions, |c| &c.name, name)
    }

    pub fn control_by_name(&self, name: &str) -> Option<Key> {
        scan_by_name(&self.controls, |c| &c.name, name)
    }

    pub fn pert_type_by_name(&self, name: &str) -> Option<Key> {
        scan_by_name(&self.pert_types, |t| &t.name, name)
    }

    pub fn measure_scale_by_name(&self, name: &str) -> Option<Key> {
        scan_by_name(&self.measure_scales, |s| &s.name, name)
    }

    pub fn measure_prop_by_name(&self, name: &str) -> Option<Key> {
        scan_by_name(&self.measure_props, |p| &p.name, name)
    }

    pub fn user_field_by_name(&self, name: &str) -> Option<Key> {
        scan_by_name(&self.user_fields, |f| &f.name, name)
    }

    pub fn annotation_by_tag(&self, tag: &str) -> Option<Key> {
        scan_by_name(&self.annotations, |a| &a.tag, tag)
    }

    /// Keys of all data points belonging to an experiment, in table order.
    pub fn data_points_for_experiment(&self, experiment: &Key) -> Vec<Key> {
        self.data_points
            .iter()
            .filter(|(_, p)| p.experiment == *experiment)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Keys of all data points measuring a target, in table order.
    pub fn data_points_for_target(&self, target: &Key) -> Vec<Key> {
        self.data_points
            .iter()
            .filter(|(_, p)| p.target == *target)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Keys of all data points tagged with a batch ID.
    pub fn data_points_in_batch(&self, batch: &str) -> Vec<Key> {
        self.data_points
            .iter()
            .filter(|(_, p)| p.batch.as_deref() == Some(batch))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Keys of all experiments whose source set holds the given definition.
    pub fn experiments_with_source(&self, source: &Key) -> Vec<Key> {
        self.experiments
            .iter()
            .filter(|(_, e)| e.sources.contains(source))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn data_point_count_for_experiment(&self, experiment: &Key) -> usize {
        self.data_points
            .values()
            .filter(|p| p.experiment == *experiment)
            .count()
    }

    pub fn experiment_count_for_source(&self, source: &Key) -> usize {
        self.experiments
            .values()
            .filter(|e| e.sources.contains(source))
            .count()
    }

    /// The set of significant data points: forced-significant points, plus
    /// numeric points whose value clears their measurement property's
    /// thresholds. Served from the serial-gated cache.
    pub fn significant_data_points(&mut self) -> &BTreeSet<Key> {
        if !self.caches.significant.is_fresh(self.serial) {
            let mut set = BTreeSet::new();
            for (key, point) in &self.data_points {
                let significant = match point.force_significant {
                    Some(forced) => forced,
                    None => match point.value.as_number() {
                        Some(v) => {
                            expect(&self.measure_props, EntityKind::MeasureProp, &point.measurement)
                                .is_significant(v)
                        }
                        None => false,
                    },
                };
                if significant {
                    set.insert(key.clone());
                }
            }
            self.caches.significant.put(self.serial, set);
        }
        self.caches
            .significant
            .get()
            .expect("cache refreshed above")
    }

    /// Annotations in display order: numeric tags first in numeric order,
    /// then the rest lexicographically.
    pub fn annotations_in_tag_order(&self) -> Vec<(&Key, &Annotation)> {
        let mut rows: Vec<(&Key, &Annotation)> = self.annotations.iter().collect();
        rows.sort_by(|(_, a), (_, b)| match (tag_number(&a.tag), tag_number(&b.tag)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.tag.cmp(&b.tag),
        });
        rows
    }

    /// The smallest positive integer not yet in use as an annotation tag.
    pub fn next_free_annotation_tag(&self) -> String {
        let used: BTreeSet<u64> = self
            .annotations
            .values()
            .filter_map(|a| tag_number(&a.tag))
            .collect();
        let mut n = 1;
        while used.contains(&n) {
            n += 1;
        }
        n.to_string()
    }

    // -----------------------------------------------------------------------
    // Identity-resolving constructors
    // -----------------------------------------------------------------------

    pub fn provide_investigator(&mut self, name: &str) -> Provided {
        if let Some(key) = self.investigator_by_name(name) {
            return Provided { key, change: None };
        }
        let value = Investigator {
            name: name.trim().to_string(),
        };
        self.create(value, |s| &mut s.investigators, Change::Investigator)
    }

    pub fn provide_source_name(&mut self, name: &str) -> Provided {
        if let Some(key) = self.source_name_by_name(name) {
            return Provided { key, change: None };
        }
        let value = SourceName {
            name: name.trim().to_string(),
        };
        self.create(value, |s| &mut s.source_names, Change::SourceName)
    }

    /// Provides a target by name. A freshly created target starts with an
    /// empty footnote list; footnotes are attached afterwards through
    /// [`set_target`](Self::set_target).
    pub fn provide_target(&mut self, name: &str) -> Provided {
        if let Some(key) = self.target_by_name(name) {
            return Provided { key, change: None };
        }
        let value = Target {
            name: name.trim().to_string(),
            footnotes: KeyList::new(),
        };
        self.create(value, |s| &mut s.targets, Change::Target)
    }

    pub fn provide_condition(&mut self, name: &str) -> Provided {
        if let Some(key) = self.condition_by_name(name) {
            return Provided { key, change: None };
        }
        let value = Condition {
            name: name.trim().to_string(),
        };
        self.create(value, |s| &mut s.conditions, Change::Condition)
    }

    pub fn provide_control(&mut self, name: &str) -> Provided {
        if let Some(key) = self.control_by_name(name) {
            return Provided { key, change: None };
        }
        let value = Control {
            name: name.trim().to_string(),
        };
        self.create(value, |s| &mut s.controls, Change::Control)
    }

    pub fn provide_user_field(&mut self, name: &str) -> Provided {
        if let Some(key) = self.user_field_by_name(name) {
            return Provided { key, change: None };
        }
        let value = UserField {
            name: name.trim().to_string(),
        };
        self.create(value, |s| &mut s.user_fields, Change::UserField)
    }

    /// Provides a perturbation type. A name match with differing
    /// abbreviation or sign is a conflict for the caller to resolve.
    pub fn provide_pert_type(&mut self, candidate: PertType) -> ProvideOutcome {
        match self.pert_type_by_name(&candidate.name) {
            Some(key) => {
                if *expect(&self.pert_types, EntityKind::PertType, &key) == candidate {
                    ProvideOutcome::Resolved(Provided { key, change: None })
                } else {
                    ProvideOutcome::NameConflict { existing: key }
                }
            }
            None => ProvideOutcome::Resolved(self.create(
                candidate,
                |s| &mut s.pert_types,
                Change::PertType,
            )),
        }
    }

    /// Provides a measurement scale; name conflicts surface as data.
    pub fn provide_measure_scale(&mut self, candidate: MeasureScale) -> ProvideOutcome {
        match self.measure_scale_by_name(&candidate.name) {
            Some(key) => {
                if *expect(&self.measure_scales, EntityKind::MeasureScale, &key) == candidate {
                    ProvideOutcome::Resolved(Provided { key, change: None })
                } else {
                    ProvideOutcome::NameConflict { existing: key }
                }
            }
            None => ProvideOutcome::Resolved(self.create(
                candidate,
                |s| &mut s.measure_scales,
                Change::MeasureScale,
            )),
        }
    }

    /// Provides a measurement property; a name match with a different
    /// scale or thresholds is a conflict.
    pub fn provide_measure_prop(&mut self, candidate: MeasureProp) -> ProvideOutcome {
        debug_assert!(
            self.measure_scales.contains_key(&candidate.scale),
            "measure property references unknown scale '{}'",
            candidate.scale
        );
        match self.measure_prop_by_name(&candidate.name) {
            Some(key) => {
                if *expect(&self.measure_props, EntityKind::MeasureProp, &key) == candidate {
                    ProvideOutcome::Resolved(Provided { key, change: None })
                } else {
                    ProvideOutcome::NameConflict { existing: key }
                }
            }
            None => ProvideOutcome::Resolved(self.create(
                candidate,
                |s| &mut s.measure_props,
                Change::MeasureProp,
            )),
        }
    }

    /// Provides an annotation by tag; a tag match with a different message
    /// is a conflict.
    pub fn provide_annotation(&mut self, candidate: Annotation) -> ProvideOutcome {
        match self.annotation_by_tag(&candidate.tag) {
            Some(key) => {
                let existing = expect(&self.annotations, EntityKind::Annotation, &key);
                if existing.message == candidate.message {
                    ProvideOutcome::Resolved(Provided { key, change: None })
                } else {
                    ProvideOutcome::NameConflict { existing: key }
                }
            }
            None => ProvideOutcome::Resolved(self.create(
                candidate,
                |s| &mut s.annotations,
                Change::Annotation,
            )),
        }
    }

    /// Provides a source definition by structural equality.
    pub fn provide_pert_source(&mut self, candidate: PertSource) -> Provided {
        self.debug_assert_pert_source_refs(&candidate);
        if let Some((key, _)) = self.pert_sources.iter().find(|(_, ps)| **ps == candidate) {
            return Provided {
                key: key.clone(),
                change: None,
            };
        }
        self.create(candidate, |s| &mut s.pert_sources, Change::PertSource)
    }

    /// Provides an experiment by structural equality across its source set,
    /// time, investigators, and condition.
    pub fn provide_experiment(&mut self, candidate: Experiment) -> Provided {
        self.debug_assert_experiment_refs(&candidate);
        if let Some((key, _)) = self.experiments.iter().find(|(_, e)| **e == candidate) {
            return Provided {
                key: key.clone(),
                change: None,
            };
        }
        self.create(candidate, |s| &mut s.experiments, Change::Experiment)
    }

    /// Inserts a data point. Data points carry no identity rule -- every
    /// call creates a new record -- so this returns the change directly.
    pub fn add_data_point(&mut self, point: DataPoint) -> (Key, Change) {
        self.debug_assert_data_point_refs(&point);
        let key = self.minter.mint();
        self.data_points.insert(key.clone(), point.clone());
        let (sb, sa) = self.advance();
        let change = Change::DataPoint(Delta::created(
            key.clone(),
            DataPointSnapshot::bare(point),
            sb,
            sa,
        ));
        (key, change)
    }

    fn create<T: Clone>(
        &mut self,
        value: T,
        table: impl FnOnce(&mut Self) -> &mut IndexMap<Key, T>,
        wrap: impl FnOnce(Delta<T>) -> Change,
    ) -> Provided {
        let key = self.minter.mint();
        table(self).insert(key.clone(), value.clone());
        let (sb, sa) = self.advance();
        Provided {
            key: key.clone(),
            change: Some(wrap(Delta::created(key, value, sb, sa))),
        }
    }

    // -----------------------------------------------------------------------
    // Keyed replacement
    // -----------------------------------------------------------------------

    pub fn set_investigator(&mut self, key: &Key, value: Investigator) -> Option<Change> {
        self.replace(key, value, EntityKind::Investigator, |s| &mut s.investigators, Change::Investigator)
    }

    pub fn set_target(&mut self, key: &Key, value: Target) -> Option<Change> {
        self.replace(key, value, EntityKind::Target, |s| &mut s.targets, Change::Target)
    }

    pub fn set_source_name(&mut self, key: &Key, value: SourceName) -> Option<Change> {
        self.replace(key, value, EntityKind::SourceName, |s| &mut s.source_names, Change::SourceName)
    }

    pub fn set_pert_source(&mut self, key: &Key, value: PertSource) -> Option<Change> {
        self.debug_assert_pert_source_refs(&value);
        self.replace(key, value, EntityKind::PertSource, |s| &mut s.pert_sources, Change::PertSource)
    }

    pub fn set_experiment(&mut self, key: &Key, value: Experiment) -> Option<Change> {
        self.debug_assert_experiment_refs(&value);
        self.replace(key, value, EntityKind::Experiment, |s| &mut s.experiments, Change::Experiment)
    }

    pub fn set_pert_type(&mut self, key: &Key, value: PertType) -> Option<Change> {
        self.replace(key, value, EntityKind::PertType, |s| &mut s.pert_types, Change::PertType)
    }

    pub fn set_measure_scale(&mut self, key: &Key, value: MeasureScale) -> Option<Change> {
        self.replace(key, value, EntityKind::MeasureScale, |s| &mut s.measure_scales, Change::MeasureScale)
    }

    pub fn set_measure_prop(&mut self, key: &Key, value: MeasureProp) -> Option<Change> {
        self.replace(key, value, EntityKind::MeasureProp, |s| &mut s.measure_props, Change::MeasureProp)
    }

    pub fn set_condition(&mut self, key: &Key, value: Condition) -> Option<Change> {
        self.replace(key, value, EntityKind::Condition, |s| &mut s.conditions, Change::Condition)
    }

    pub fn set_control(&mut self, key: &Key, value: Control) -> Option<Change> {
        self.replace(key, value, EntityKind::Control, |s| &mut s.controls, Change::Control)
    }

    pub fn set_annotation(&mut self, key: &Key, value: Annotation) -> Option<Change> {
        self.replace(key, value, EntityKind::Annotation, |s| &mut s.annotations, Change::Annotation)
    }

    pub fn set_user_field(&mut self, key: &Key, value: UserField) -> Option<Change> {
        self.replace(key, value, EntityKind::UserField, |s| &mut s.user_fields, Change::UserField)
    }

    /// Replaces a data point's row. The change snapshots the point together
    /// with its side-table rows, which a row replacement leaves untouched.
    pub fn set_data_point(&mut self, key: &Key, value: DataPoint) -> Option<Change> {
        self.debug_assert_data_point_refs(&value);
        let old = expect(&self.data_points, EntityKind::DataPoint, key).clone();
        if old == value {
            return None;
        }
        let before = self.snapshot_data_point_with(key, old);
        let after = self.snapshot_data_point_with(key, value.clone());
        self.data_points.insert(key.clone(), value);
        let (sb, sa) = self.advance();
        Some(Change::DataPoint(Delta::modified(
            key.clone(),
            before,
            after,
            sb,
            sa,
        )))
    }

    fn replace<T: Clone + PartialEq>(
        &mut self,
        key: &Key,
        value: T,
        kind: EntityKind,
        table: impl Fn(&mut Self) -> &mut IndexMap<Key, T>,
        wrap: impl FnOnce(Delta<T>) -> Change,
    ) -> Option<Change> {
        let old = expect(table(self), kind, key).clone();
        if old == value {
            return None;
        }
        table(self).insert(key.clone(), value.clone());
        let (sb, sa) = self.advance();
        Some(wrap(Delta::modified(key.clone(), old, value, sb, sa)))
    }

    // -----------------------------------------------------------------------
    // Side-table mutation
    // -----------------------------------------------------------------------

    /// Replaces a data point's ordered annotation list. An empty list
    /// removes the side row.
    pub fn set_data_point_notes(&mut self, point: &Key, notes: KeyList) -> Option<Change> {
        let _ = expect(&self.data_points, EntityKind::DataPoint, point);
        debug_assert!(
            notes.iter().all(|k| self.annotations.contains_key(k)),
            "note list for '{}' references an unknown annotation",
            point
        );
        let before = self.point_notes.get(point).cloned();
        let after = if notes.is_empty() { None } else { Some(notes) };
        if before == after {
            return None;
        }
        match after.clone() {
            Some(list) => {
                self.point_notes.insert(point.clone(), list);
            }
            None => {
                self.point_notes.remove(point);
            }
        }
        let (sb, sa) = self.advance();
        Some(Change::DataPointNotes(Delta {
            key: point.clone(),
            before,
            after,
            serial_before: sb,
            serial_after: sa,
        }))
    }

    /// Sets a data point's region restriction.
    pub fn set_region_restriction(
        &mut self,
        point: &Key,
        region: RegionRestriction,
    ) -> Option<Change> {
        let _ = expect(&self.data_points, EntityKind::DataPoint, point);
        let before = self.point_regions.get(point).cloned();
        if before.as_ref() == Some(&region) {
            return None;
        }
        self.point_regions.insert(point.clone(), region.clone());
        let (sb, sa) = self.advance();
        Some(Change::RegionRestriction(Delta {
            key: point.clone(),
            before,
            after: Some(region),
            serial_before: sb,
            serial_after: sa,
        }))
    }

    /// Clears a data point's region restriction, if it has one.
    pub fn clear_region_restriction(&mut self, point: &Key) -> Option<Change> {
        let _ = expect(&self.data_points, EntityKind::DataPoint, point);
        let before = self.point_regions.remove(point)?;
        let (sb, sa) = self.advance();
        Some(Change::RegionRestriction(Delta::deleted(
            point.clone(),
            before,
            sb,
            sa,
        )))
    }

    /// Sets or clears (`value = None`) one user-field value on a data
    /// point. The change snapshots the point's whole value row.
    pub fn set_user_field_value(
        &mut self,
        point: &Key,
        field: &Key,
        value: Option<&str>,
    ) -> Option<Change> {
        let _ = expect(&self.data_points, EntityKind::DataPoint, point);
        let _ = expect(&self.user_fields, EntityKind::UserField, field);

        let before = self.point_user_values.get(point).cloned();
        let mut row = before.clone().unwrap_or_default();
        match value {
            Some(v) => {
                row.insert(field.clone(), v.to_string());
            }
            None => {
                row.shift_remove(field);
            }
        }
        let after = if row.is_empty() { None } else { Some(row) };
        if before == after {
            return None;
        }
        match after.clone() {
            Some(row) => {
                self.point_user_values.insert(point.clone(), row);
            }
            None => {
                self.point_user_values.remove(point);
            }
        }
        let (sb, sa) = self.advance();
        Some(Change::UserFieldValues(Delta {
            key: point.clone(),
            before,
            after,
            serial_before: sb,
            serial_after: sa,
        }))
    }

    // -----------------------------------------------------------------------
    // Keyed removal
    // -----------------------------------------------------------------------

    pub fn delete_investigator(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::Investigator, |s| &mut s.investigators, Change::Investigator)
    }

    pub fn delete_target(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::Target, |s| &mut s.targets, Change::Target)
    }

    pub fn delete_source_name(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::SourceName, |s| &mut s.source_names, Change::SourceName)
    }

    pub fn delete_pert_source(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::PertSource, |s| &mut s.pert_sources, Change::PertSource)
    }

    pub fn delete_experiment(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::Experiment, |s| &mut s.experiments, Change::Experiment)
    }

    pub fn delete_pert_type(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::PertType, |s| &mut s.pert_types, Change::PertType)
    }

    pub fn delete_measure_scale(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::MeasureScale, |s| &mut s.measure_scales, Change::MeasureScale)
    }

    pub fn delete_measure_prop(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::MeasureProp, |s| &mut s.measure_props, Change::MeasureProp)
    }

    pub fn delete_condition(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::Condition, |s| &mut s.conditions, Change::Condition)
    }

    pub fn delete_control(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::Control, |s| &mut s.controls, Change::Control)
    }

    pub fn delete_annotation(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::Annotation, |s| &mut s.annotations, Change::Annotation)
    }

    pub fn delete_user_field(&mut self, key: &Key) -> Change {
        self.destroy(key, EntityKind::UserField, |s| &mut s.user_fields, Change::UserField)
    }

    /// Removes a data point and its side-table rows. The deletion change
    /// carries all of them, so a single undo restores the whole record.
    pub fn delete_data_point(&mut self, key: &Key) -> Change {
        let point = expect_remove(&mut self.data_points, EntityKind::DataPoint, key);
        let snapshot = DataPointSnapshot {
            point,
            notes: self.point_notes.remove(key).unwrap_or_default(),
            region: self.point_regions.remove(key),
            user_values: self.point_user_values.remove(key).unwrap_or_default(),
        };
        let (sb, sa) = self.advance();
        Change::DataPoint(Delta::deleted(key.clone(), snapshot, sb, sa))
    }

    /// Bulk data-point removal; one change per point, in argument order.
    pub fn delete_data_points(&mut self, keys: &[Key]) -> Vec<Change> {
        keys.iter().map(|k| self.delete_data_point(k)).collect()
    }

    fn destroy<T>(
        &mut self,
        key: &Key,
        kind: EntityKind,
        table: impl FnOnce(&mut Self) -> &mut IndexMap<Key, T>,
        wrap: impl FnOnce(Delta<T>) -> Change,
    ) -> Change {
        let old = {
            let table = table(self);
            table
                .shift_remove(key)
                .unwrap_or_else(|| panic!("no {} under key '{}'", kind, key))
        };
        let (sb, sa) = self.advance();
        wrap(Delta::deleted(key.clone(), old, sb, sa))
    }

    // -----------------------------------------------------------------------
    // Undo / redo
    // -----------------------------------------------------------------------

    /// Replays a change backwards: restores the before-snapshot and resets
    /// the serial to the recorded pre-change value.
    pub fn change_undo(&mut self, change: &Change) {
        self.apply_snapshot(change, true);
        self.serial = change.serial_before();
        self.caches.invalidate_all();
    }

    /// Replays a change forwards: applies the after-snapshot and resets the
    /// serial to the recorded post-change value.
    pub fn change_redo(&mut self, change: &Change) {
        self.apply_snapshot(change, false);
        self.serial = change.serial_after();
        self.caches.invalidate_all();
    }

    fn apply_snapshot(&mut self, change: &Change, backwards: bool) {
        fn pick<S: Clone>(d: &Delta<S>, backwards: bool) -> Option<S> {
            if backwards {
                d.before.clone()
            } else {
                d.after.clone()
            }
        }
        fn restore<T>(table: &mut IndexMap<Key, T>, key: &Key, snap: Option<T>) {
            match snap {
                Some(value) => {
                    table.insert(key.clone(), value);
                }
                None => {
                    table.shift_remove(key);
                }
            }
        }
        fn restore_side<V>(table: &mut SideTable<V>, key: &Key, snap: Option<V>) {
            match snap {
                Some(value) => {
                    table.insert(key.clone(), value);
                }
                None => {
                    table.remove(key);
                }
            }
        }

        match change {
            Change::Investigator(d) => {
                restore(&mut self.investigators, &d.key, pick(d, backwards))
            }
            Change::Target(d) => restore(&mut self.targets, &d.key, pick(d, backwards)),
            Change::SourceName(d) => restore(&mut self.source_names, &d.key, pick(d, backwards)),
            Change::PertSource(d) => restore(&mut self.pert_sources, &d.key, pick(d, backwards)),
            Change::Experiment(d) => restore(&mut self.experiments, &d.key, pick(d, backwards)),
            Change::PertType(d) => restore(&mut self.pert_types, &d.key, pick(d, backwards)),
            Change::MeasureScale(d) => {
                restore(&mut self.measure_scales, &d.key, pick(d, backwards))
            }
            Change::MeasureProp(d) => restore(&mut self.measure_props, &d.key, pick(d, backwards)),
            Change::Condition(d) => restore(&mut self.conditions, &d.key, pick(d, backwards)),
            Change::Control(d) => restore(&mut self.controls, &d.key, pick(d, backwards)),
            Change::Annotation(d) => restore(&mut self.annotations, &d.key, pick(d, backwards)),
            Change::UserField(d) => restore(&mut self.user_fields, &d.key, pick(d, backwards)),
            Change::DataPoint(d) => match pick(d, backwards) {
                Some(snapshot) => {
                    self.data_points.insert(d.key.clone(), snapshot.point);
                    restore_side(
                        &mut self.point_notes,
                        &d.key,
                        (!snapshot.notes.is_empty()).then_some(snapshot.notes),
                    );
                    restore_side(&mut self.point_regions, &d.key, snapshot.region);
                    restore_side(
                        &mut self.point_user_values,
                        &d.key,
                        (!snapshot.user_values.is_empty()).then_some(snapshot.user_values),
                    );
                }
                None => {
                    self.data_points.shift_remove(&d.key);
                    self.point_notes.remove(&d.key);
                    self.point_regions.remove(&d.key);
                    self.point_user_values.remove(&d.key);
                }
            },
            Change::DataPointNotes(d) => {
                restore_side(&mut self.point_notes, &d.key, pick(d, backwards))
            }
            Change::RegionRestriction(d) => {
                restore_side(&mut self.point_regions, &d.key, pick(d, backwards))
            }
            Change::UserFieldValues(d) => {
                restore_side(&mut self.point_user_values, &d.key, pick(d, backwards))
            }
        }
    }

    // -----------------------------------------------------------------------
    // IO load path
    // -----------------------------------------------------------------------

    pub fn add_investigator_for_io(&mut self, key: Key, value: Investigator) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.investigators)
    }

    pub fn add_target_for_io(&mut self, key: Key, value: Target) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.targets)
    }

    pub fn add_source_name_for_io(&mut self, key: Key, value: SourceName) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.source_names)
    }

    pub fn add_pert_source_for_io(&mut self, key: Key, value: PertSource) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.pert_sources)
    }

    pub fn add_experiment_for_io(&mut self, key: Key, value: Experiment) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.experiments)
    }

    pub fn add_data_point_for_io(&mut self, key: Key, value: DataPoint) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.data_points)
    }

    pub fn add_pert_type_for_io(&mut self, key: Key, value: PertType) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.pert_types)
    }

    pub fn add_measure_scale_for_io(&mut self, key: Key, value: MeasureScale) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.measure_scales)
    }

    pub fn add_measure_prop_for_io(&mut self, key: Key, value: MeasureProp) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.measure_props)
    }

    pub fn add_condition_for_io(&mut self, key: Key, value: Condition) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.conditions)
    }

    pub fn add_control_for_io(&mut self, key: Key, value: Control) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.controls)
    }

    pub fn add_annotation_for_io(&mut self, key: Key, value: Annotation) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.annotations)
    }

    pub fn add_user_field_for_io(&mut self, key: Key, value: UserField) -> Result<(), StoreError> {
        self.load(key, value, |s| &mut s.user_fields)
    }

    /// Loads a data point's annotation list. The owning point must already
    /// have been loaded.
    pub fn add_data_point_notes_for_io(
        &mut self,
        point: Key,
        notes: KeyList,
    ) -> Result<(), StoreError> {
        if !self.data_points.contains_key(&point) {
            return Err(StoreError::DanglingOwner { key: point });
        }
        self.point_notes.insert(point, notes);
        Ok(())
    }

    /// Loads a data point's region restriction.
    pub fn add_region_restriction_for_io(
        &mut self,
        point: Key,
        region: RegionRestriction,
    ) -> Result<(), StoreError> {
        if !self.data_points.contains_key(&point) {
            return Err(StoreError::DanglingOwner { key: point });
        }
        self.point_regions.insert(point, region);
        Ok(())
    }

    /// Loads a data point's user-field value row. Field keys must resolve
    /// in the user-field dictionary.
    pub fn add_user_field_values_for_io(
        &mut self,
        point: Key,
        values: IndexMap<Key, String>,
    ) -> Result<(), StoreError> {
        if !self.data_points.contains_key(&point) {
            return Err(StoreError::DanglingOwner { key: point });
        }
        if let Some(field) = values.keys().find(|f| !self.user_fields.contains_key(*f)) {
            return Err(StoreError::UnknownUserField { key: field.clone() });
        }
        self.point_user_values.insert(point, values);
        Ok(())
    }

    fn load<T>(
        &mut self,
        key: Key,
        value: T,
        table: impl FnOnce(&mut Self) -> &mut IndexMap<Key, T>,
    ) -> Result<(), StoreError> {
        if let Some(kind) = self.key_in_use(&key) {
            return Err(StoreError::DuplicateKey { key, kind });
        }
        self.minter.note_loaded(&key);
        table(self).insert(key, value);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Debug consistency checks
    // -----------------------------------------------------------------------

    fn debug_assert_pert_source_refs(&self, value: &PertSource) {
        debug_assert!(
            self.source_names.contains_key(&value.source_name),
            "source definition references unknown source name '{}'",
            value.source_name
        );
        debug_assert!(
            self.pert_types.contains_key(&value.pert_type),
            "source definition references unknown perturbation type '{}'",
            value.pert_type
        );
        if let Some(proxy) = &value.proxy {
            debug_assert!(
                self.source_names.contains_key(&proxy.source_name),
                "source definition proxies unknown source name '{}'",
                proxy.source_name
            );
        }
        debug_assert!(
            value.annotations.iter().all(|k| self.annotations.contains_key(k)),
            "source definition references an unknown annotation"
        );
    }

    fn debug_assert_experiment_refs(&self, value: &Experiment) {
        debug_assert!(
            value.sources.iter().all(|k| self.pert_sources.contains_key(k)),
            "experiment references an unknown source definition"
        );
        debug_assert!(
            value
                .investigators
                .iter()
                .all(|k| self.investigators.contains_key(k)),
            "experiment references an unknown investigator"
        );
        debug_assert!(
            self.conditions.contains_key(&value.condition),
            "experiment references unknown condition '{}'",
            value.condition
        );
    }

    fn debug_assert_data_point_refs(&self, value: &DataPoint) {
        debug_assert!(
            self.experiments.contains_key(&value.experiment),
            "data point references unknown experiment '{}'",
            value.experiment
        );
        debug_assert!(
            self.targets.contains_key(&value.target),
            "data point references unknown target '{}'",
            value.target
        );
        debug_assert!(
            self.measure_props.contains_key(&value.measurement),
            "data point references unknown measurement property '{}'",
            value.measurement
        );
        if let Some(control) = &value.control {
            debug_assert!(
                self.controls.contains_key(control),
                "data point references unknown control '{}'",
                control
            );
        }
    }

    fn snapshot_data_point_with(&self, key: &Key, point: DataPoint) -> DataPointSnapshot {
        DataPointSnapshot {
            point,
            notes: self.point_notes.get(key).cloned().unwrap_or_default(),
            region: self.point_regions.get(key).cloned(),
            user_values: self
                .point_user_values
                .get(key)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

fn invert_names<T>(
    table: &IndexMap<Key, T>,
    display: impl Fn(&T) -> &str,
) -> HashMap<String, Key> {
    let mut map = HashMap::new();
    for (key, value) in table {
        // First entry wins, matching resolver tie-breaking.
        map.entry(norm_name(display(value)))
            .or_insert_with(|| key.clone());
    }
    map
}

fn lookup_norm(map: Option<&HashMap<String, Key>>, name: &str) -> Option<Key> {
    map.and_then(|m| m.get(&norm_name(name)).cloned())
}

fn scan_by_name<T>(
    table: &IndexMap<Key, T>,
    display: impl Fn(&T) -> &str,
    name: &str,
) -> Option<Key> {
    table
        .iter()
        .find(|(_, v)| same_name(display(v), name))
        .map(|(k, _)| k.clone())
}

fn tag_number(tag: &str) -> Option<u64> {
    tag.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExperimentTime, LinkSign, MeasureValue};

    /// Builds a store populated with one complete record chain:
    /// scale -> property, type + source name -> source definition,
    /// investigator + condition -> experiment, target -> data point.
    fn seeded() -> (PerturbStore, Seed) {
        let mut store = PerturbStore::new();

        let scale = store
            .provide_measure_scale(MeasureScale {
                name: "fold change".into(),
                unsigned: false,
            })
            .key()
            .unwrap()
            .clone();
        let prop = store
            .provide_measure_prop(MeasureProp {
                name: "qPCR".into(),
                scale: scale.clone(),
                neg_thresh: Some(-1.6),
                pos_thresh: Some(1.6),
            })
            .key()
            .unwrap()
            .clone();
        let pert_type = store
            .provide_pert_type(PertType {
                name: "MASO".into(),
                abbrev: Some("M".into()),
                link_sign: LinkSign::Negative,
            })
            .key()
            .unwrap()
            .clone();
        let source_name = store.provide_source_name("GeneX").key;
        let source = store
            .provide_pert_source(PertSource {
                source_name: source_name.clone(),
                pert_type: pert_type.clone(),
                proxy: None,
                annotations: KeyList::new(),
            })
            .key;
        let investigator = store.provide_investigator("Smith").key;
        let condition = store.provide_condition("standard").key;
        let experiment = store
            .provide_experiment(Experiment {
                sources: KeyList::from_vec(vec![source.clone()]),
                time: ExperimentTime::Point(24),
                investigators: KeyList::from_vec(vec![investigator.clone()]),
                condition: condition.clone(),
            })
            .key;
        let target = store.provide_target("brachyury").key;
        let (point, _) = store.add_data_point(DataPoint {
            experiment: experiment.clone(),
            target: target.clone(),
            measurement: prop.clone(),
            value: MeasureValue::Number(3.2),
            control: None,
            force_significant: None,
            batch: Some("B-1".into()),
            date: None,
            comment: None,
        });

        (
            store,
            Seed {
                scale,
                prop,
                pert_type,
                source_name,
                source,
                investigator,
                condition,
                experiment,
                target,
                point,
            },
        )
    }

    struct Seed {
        scale: Key,
        prop: Key,
        pert_type: Key,
        source_name: Key,
        source: Key,
        investigator: Key,
        condition: Key,
        experiment: Key,
        target: Key,
        point: Key,
    }

    #[test]
    fn provide_investigator_is_idempotent_and_case_insensitive() {
        let mut store = PerturbStore::new();
        let first = store.provide_investigator("Smith");
        assert!(first.was_created());
        let serial = store.serial();

        let second = store.provide_investigator("smith");
        assert_eq!(first.key, second.key);
        assert!(second.change.is_none());
        assert_eq!(store.serial(), serial, "no-op provide must not advance serial");
    }

    #[test]
    fn provide_experiment_resolves_structural_equality() {
        let (mut store, seed) = seeded();
        let serial = store.serial();
        let again = store.provide_experiment(Experiment {
            sources: KeyList::from_vec(vec![seed.source.clone()]),
            time: ExperimentTime::Point(24),
            investigators: KeyList::from_vec(vec![seed.investigator.clone()]),
            condition: seed.condition.clone(),
        });
        assert_eq!(again.key, seed.experiment);
        assert!(!again.was_created());
        assert_eq!(store.serial(), serial);

        let other = store.provide_experiment(Experiment {
            sources: KeyList::from_vec(vec![seed.source.clone()]),
            time: ExperimentTime::Point(30),
            investigators: KeyList::from_vec(vec![seed.investigator]),
            condition: seed.condition,
        });
        assert_ne!(other.key, seed.experiment);
        assert!(other.was_created());
    }

    #[test]
    fn provide_measure_prop_reports_name_conflict() {
        let (mut store, seed) = seeded();
        let serial = store.serial();
        let outcome = store.provide_measure_prop(MeasureProp {
            name: "qPCR".into(),
            scale: seed.scale,
            neg_thresh: None,
            pos_thresh: None,
        });
        assert_eq!(
            outcome,
            ProvideOutcome::NameConflict {
                existing: seed.prop
            }
        );
        assert_eq!(store.serial(), serial, "conflict must not mutate");
    }

    #[test]
    fn serial_advances_once_per_change_and_not_on_noop() {
        let (mut store, seed) = seeded();
        let serial = store.serial();

        let unchanged = store.set_investigator(
            &seed.investigator,
            Investigator {
                name: "Smith".into(),
            },
        );
        assert!(unchanged.is_none());
        assert_eq!(store.serial(), serial);

        let changed = store
            .set_investigator(
                &seed.investigator,
                Investigator {
                    name: "Smythe".into(),
                },
            )
            .expect("name change records");
        assert_eq!(store.serial(), serial + 1);
        assert_eq!(changed.serial_before(), serial);
        assert_eq!(changed.serial_after(), serial + 1);
    }

    #[test]
    fn set_undo_redo_roundtrip() {
        let (mut store, seed) = seeded();
        let serial = store.serial();
        let original = store.experiment(&seed.experiment).unwrap().clone();

        let mut edited = original.clone();
        edited.time = ExperimentTime::Span { min: 20, max: 26 };
        let change = store.set_experiment(&seed.experiment, edited.clone()).unwrap();

        store.change_undo(&change);
        assert_eq!(store.experiment(&seed.experiment), Some(&original));
        assert_eq!(store.serial(), serial);

        store.change_redo(&change);
        assert_eq!(store.experiment(&seed.experiment), Some(&edited));
        assert_eq!(store.serial(), serial + 1);
    }

    #[test]
    fn delete_data_point_folds_side_tables_into_one_change() {
        let (mut store, seed) = seeded();

        let note = match store.provide_annotation(Annotation {
            tag: "1".into(),
            message: "weak signal".into(),
        }) {
            ProvideOutcome::Resolved(p) => p.key,
            other => panic!("unexpected outcome: {:?}", other),
        };
        store
            .set_data_point_notes(&seed.point, KeyList::from_vec(vec![note.clone()]))
            .unwrap();
        store
            .set_region_restriction(&seed.point, RegionRestriction::regions(["PMC".to_string()]))
            .unwrap();
        let field = store.provide_user_field("lot").key;
        store
            .set_user_field_value(&seed.point, &field, Some("L-17"))
            .unwrap();

        let serial = store.serial();
        let change = store.delete_data_point(&seed.point);

        assert!(store.data_point(&seed.point).is_none());
        assert!(store.data_point_notes(&seed.point).is_none());
        assert!(store.region_restriction(&seed.point).is_none());
        assert!(store.user_field_values(&seed.point).is_none());

        store.change_undo(&change);
        assert!(store.data_point(&seed.point).is_some());
        assert_eq!(
            store.data_point_notes(&seed.point).map(|n| n.as_slice()),
            Some(&[note][..])
        );
        assert!(store.region_restriction(&seed.point).is_some());
        assert_eq!(
            store
                .user_field_values(&seed.point)
                .and_then(|row| row.get(&field))
                .map(String::as_str),
            Some("L-17")
        );
        assert_eq!(store.serial(), serial);
    }

    #[test]
    fn significant_point_cache_tracks_serial() {
        let (mut store, seed) = seeded();
        assert!(store.significant_data_points().contains(&seed.point));

        // Drop below threshold: the cache must refresh after the mutation.
        let mut point = store.data_point(&seed.point).unwrap().clone();
        point.value = MeasureValue::Number(0.4);
        store.set_data_point(&seed.point, point).unwrap();
        assert!(!store.significant_data_points().contains(&seed.point));

        // Forcing significance overrides the thresholds.
        let mut point = store.data_point(&seed.point).unwrap().clone();
        point.force_significant = Some(true);
        store.set_data_point(&seed.point, point).unwrap();
        assert!(store.significant_data_points().contains(&seed.point));
    }

    #[test]
    fn filtered_scans_find_holders() {
        let (store, seed) = seeded();
        assert_eq!(store.data_points_for_experiment(&seed.experiment), vec![seed.point.clone()]);
        assert_eq!(store.data_points_for_target(&seed.target), vec![seed.point.clone()]);
        assert_eq!(store.data_points_in_batch("B-1"), vec![seed.point.clone()]);
        assert_eq!(store.experiments_with_source(&seed.source), vec![seed.experiment.clone()]);
        assert_eq!(store.data_point_count_for_experiment(&seed.experiment), 1);
        assert_eq!(store.experiment_count_for_source(&seed.source), 1);
    }

    #[test]
    fn bulk_delete_records_one_change_per_point() {
        let (mut store, seed) = seeded();
        let (second, _) = store.add_data_point(DataPoint {
            experiment: seed.experiment.clone(),
            target: seed.target.clone(),
            measurement: seed.prop.clone(),
            value: MeasureValue::Number(-2.0),
            control: None,
            force_significant: None,
            batch: None,
            date: None,
            comment: None,
        });

        let serial = store.serial();
        let changes = store.delete_data_points(&[seed.point.clone(), second.clone()]);
        assert_eq!(changes.len(), 2);
        assert_eq!(store.serial(), serial + 2);
        assert!(store.data_point(&seed.point).is_none());
        assert!(store.data_point(&second).is_none());
    }

    #[test]
    fn io_load_rejects_duplicate_keys_and_fixes_minter() {
        let mut store = PerturbStore::new();
        store
            .add_investigator_for_io(
                Key::from("10"),
                Investigator {
                    name: "Davidson".into(),
                },
            )
            .unwrap();

        let dup = store.add_target_for_io(
            Key::from("10"),
            Target {
                name: "endo16".into(),
                footnotes: KeyList::new(),
            },
        );
        assert!(matches!(dup, Err(StoreError::DuplicateKey { .. })));

        // Fresh keys must skip past everything the load replayed.
        let fresh = store.provide_investigator("Smith").key;
        assert_eq!(fresh.as_str(), "11");
    }

    #[test]
    fn io_side_rows_require_loaded_owner() {
        let mut store = PerturbStore::new();
        let orphan = store.add_data_point_notes_for_io(Key::from("9"), KeyList::new());
        assert!(matches!(orphan, Err(StoreError::DanglingOwner { .. })));
    }

    #[test]
    fn annotation_tags_order_numerically_and_next_free_skips_used() {
        let mut store = PerturbStore::new();
        for tag in ["2", "10", "1", "fig-3"] {
            store.provide_annotation(Annotation {
                tag: tag.into(),
                message: format!("note {}", tag),
            });
        }
        let order: Vec<&str> = store
            .annotations_in_tag_order()
            .into_iter()
            .map(|(_, a)| a.tag.as_str())
            .collect();
        assert_eq!(order, ["1", "2", "10", "fig-3"]);
        assert_eq!(store.next_free_annotation_tag(), "3");
    }

    #[test]
    fn key_space_is_shared_across_tables() {
        let (store, seed) = seeded();
        assert_eq!(store.key_in_use(&seed.point), Some(EntityKind::DataPoint));
        assert_eq!(store.key_in_use(&seed.scale), Some(EntityKind::MeasureScale));
        assert_eq!(store.key_in_use(&seed.source_name), Some(EntityKind::SourceName));
        assert_eq!(store.key_in_use(&seed.pert_type), Some(EntityKind::PertType));
        assert_eq!(store.key_in_use(&Key::from("no-such")), None);
    }

    #[test]
    #[should_panic(expected = "no experiment under key")]
    fn deleting_an_absent_key_is_a_contract_violation() {
        let mut store = PerturbStore::new();
        store.delete_experiment(&Key::from("404"));
    }
}
