//! Reference-closure computation over the fixed entity schema.
//!
//! Before an entity is destroyed or merged away, every record that
//! transitively references it must be found so the cascade can rewrite or
//! remove the holders first. The schema is known and small, so this is not
//! a generic graph traversal: each entry point enumerates exactly the
//! holder kinds that can reference its root kind and propagates at most the
//! hops the schema requires (three, in the deepest case: source name ->
//! source definitions -> experiments -> data points). There are no cycles
//! to detect.
//!
//! A [`Dependencies`] value is a point-in-time plan. It records the store
//! serial it was computed against; the cascade refuses to apply a plan once
//! the store has moved on.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use pertdb_core::{EntityKind, Key, PerturbStore};

/// A reference-holding field that can be pruned without destroying its
/// holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldTag {
    /// `Experiment.investigators`
    Investigators,
    /// `DataPoint.control`
    Control,
    /// The three annotation lists (data-point notes, target footnotes,
    /// source-definition annotations).
    Annotations,
    /// Per-point user-field values.
    UserFieldValues,
}

/// What the caller intends to do with the root entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Remove the root and everything that structurally depends on it.
    Destroy,
    /// Strip references to the root out of one field family; the root
    /// survives.
    PruneField(FieldTag),
    /// Rewrite references to the abandoned roots onto the survivor, then
    /// remove the abandoned roots.
    MergeInto(Key),
}

/// Dependent keys discovered by a closure computation, typed per holder
/// kind. Which sets a given plan populates follows from the root kind; the
/// cascade dispatches on `(kind, operation)` and treats any other
/// combination as a programmer error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HolderSets {
    /// Data points to be destroyed (structural holders).
    pub data_points: BTreeSet<Key>,
    /// Experiments to be destroyed, or -- for investigator roots -- to have
    /// their investigator lists rewritten.
    pub experiments: BTreeSet<Key>,
    /// Source definitions to be destroyed or rewritten.
    pub pert_sources: BTreeSet<Key>,
    /// Measurement properties to be destroyed or rewritten (scale roots).
    pub measure_props: BTreeSet<Key>,
    /// Targets whose footnote lists hold the root annotation.
    pub targets: BTreeSet<Key>,
    /// Data points whose note lists hold the root annotation.
    pub note_holders: BTreeSet<Key>,
    /// Source definitions whose annotation lists hold the root annotation.
    pub annotated_sources: BTreeSet<Key>,
    /// Data points whose control field names the root control.
    pub control_points: BTreeSet<Key>,
    /// Data points carrying a value for the root user field.
    pub value_points: BTreeSet<Key>,
}

impl HolderSets {
    pub fn is_empty(&self) -> bool {
        self.data_points.is_empty()
            && self.experiments.is_empty()
            && self.pert_sources.is_empty()
            && self.measure_props.is_empty()
            && self.targets.is_empty()
            && self.note_holders.is_empty()
            && self.annotated_sources.is_empty()
            && self.control_points.is_empty()
            && self.value_points.is_empty()
    }

    /// Total number of dependent records across all holder kinds.
    pub fn total(&self) -> usize {
        self.data_points.len()
            + self.experiments.len()
            + self.pert_sources.len()
            + self.measure_props.len()
            + self.targets.len()
            + self.note_holders.len()
            + self.annotated_sources.len()
            + self.control_points.len()
            + self.value_points.len()
    }
}

/// The complete, typed result of a closure computation: the roots the
/// operation removes or abandons, the survivor (for merges), the dependent
/// holders, and the store serial the plan is valid against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependencies {
    pub kind: EntityKind,
    pub operation: Operation,
    /// The key being destroyed, or the abandoned keys of a merge.
    pub roots: BTreeSet<Key>,
    pub survivor: Option<Key>,
    pub holders: HolderSets,
    /// Store serial at computation time; the plan is stale once the store
    /// serial differs.
    pub computed_at: u64,
}

impl Dependencies {
    fn destroy(store: &PerturbStore, kind: EntityKind, root: Key, holders: HolderSets) -> Self {
        debug!(%kind, %root, dependents = holders.total(), "computed destroy closure");
        Dependencies {
            kind,
            operation: Operation::Destroy,
            roots: BTreeSet::from([root]),
            survivor: None,
            holders,
            computed_at: store.serial(),
        }
    }

    fn prune(
        store: &PerturbStore,
        kind: EntityKind,
        field: FieldTag,
        root: Key,
        holders: HolderSets,
    ) -> Self {
        Dependencies {
            kind,
            operation: Operation::PruneField(field),
            roots: BTreeSet::from([root]),
            survivor: None,
            holders,
            computed_at: store.serial(),
        }
    }

    fn merge(
        store: &PerturbStore,
        kind: EntityKind,
        keys: &[Key],
        survivor: &Key,
        holders: HolderSets,
    ) -> Self {
        let roots: BTreeSet<Key> = keys.iter().filter(|k| *k != survivor).cloned().collect();
        debug!(%kind, abandoned = roots.len(), %survivor, "computed merge closure");
        Dependencies {
            kind,
            operation: Operation::MergeInto(survivor.clone()),
            roots,
            survivor: Some(survivor.clone()),
            holders,
            computed_at: store.serial(),
        }
    }
}

// ---------------------------------------------------------------------------
// Schema steps
// ---------------------------------------------------------------------------

/// Source definitions referencing any of the given source names, as
/// principal agent or proxied species.
fn defs_of_source_names(store: &PerturbStore, names: &BTreeSet<Key>) -> BTreeSet<Key> {
    store
        .pert_sources()
        .filter(|(_, def)| {
            names.contains(&def.source_name)
                || def
                    .proxy
                    .as_ref()
                    .map_or(false, |p| names.contains(&p.source_name))
        })
        .map(|(k, _)| k.clone())
        .collect()
}

fn defs_of_pert_types(store: &PerturbStore, types: &BTreeSet<Key>) -> BTreeSet<Key> {
    store
        .pert_sources()
        .filter(|(_, def)| types.contains(&def.pert_type))
        .map(|(k, _)| k.clone())
        .collect()
}

fn experiments_of_defs(store: &PerturbStore, defs: &BTreeSet<Key>) -> BTreeSet<Key> {
    store
        .experiments()
        .filter(|(_, e)| e.sources.iter().any(|s| defs.contains(s)))
        .map(|(k, _)| k.clone())
        .collect()
}

fn points_of_experiments(store: &PerturbStore, experiments: &BTreeSet<Key>) -> BTreeSet<Key> {
    store
        .data_points()
        .filter(|(_, p)| experiments.contains(&p.experiment))
        .map(|(k, _)| k.clone())
        .collect()
}

fn props_of_scales(store: &PerturbStore, scales: &BTreeSet<Key>) -> BTreeSet<Key> {
    store
        .measure_props()
        .filter(|(_, prop)| scales.contains(&prop.scale))
        .map(|(k, _)| k.clone())
        .collect()
}

fn points_of_props(store: &PerturbStore, props: &BTreeSet<Key>) -> BTreeSet<Key> {
    store
        .data_points()
        .filter(|(_, p)| props.contains(&p.measurement))
        .map(|(k, _)| k.clone())
        .collect()
}

fn points_of_targets(store: &PerturbStore, targets: &BTreeSet<Key>) -> BTreeSet<Key> {
    store
        .data_points()
        .filter(|(_, p)| targets.contains(&p.target))
        .map(|(k, _)| k.clone())
        .collect()
}

fn experiments_of_conditions(store: &PerturbStore, conditions: &BTreeSet<Key>) -> BTreeSet<Key> {
    store
        .experiments()
        .filter(|(_, e)| conditions.contains(&e.condition))
        .map(|(k, _)| k.clone())
        .collect()
}

fn experiments_of_investigators(
    store: &PerturbStore,
    investigators: &BTreeSet<Key>,
) -> BTreeSet<Key> {
    store
        .experiments()
        .filter(|(_, e)| e.investigators.iter().any(|i| investigators.contains(i)))
        .map(|(k, _)| k.clone())
        .collect()
}

fn points_of_controls(store: &PerturbStore, controls: &BTreeSet<Key>) -> BTreeSet<Key> {
    store
        .data_points()
        .filter(|(_, p)| p.control.as_ref().map_or(false, |c| controls.contains(c)))
        .map(|(k, _)| k.clone())
        .collect()
}

/// The three independent annotation holder kinds, populated into one set of
/// holder fields.
fn annotation_holders(store: &PerturbStore, annotations: &BTreeSet<Key>) -> HolderSets {
    let mut holders = HolderSets::default();
    for (point, notes) in store.note_rows() {
        if notes.iter().any(|a| annotations.contains(a)) {
            holders.note_holders.insert(point.clone());
        }
    }
    for (key, target) in store.targets() {
        if target.footnotes.iter().any(|a| annotations.contains(a)) {
            holders.targets.insert(key.clone());
        }
    }
    for (key, def) in store.pert_sources() {
        if def.annotations.iter().any(|a| annotations.contains(a)) {
            holders.annotated_sources.insert(key.clone());
        }
    }
    holders
}

fn value_points_of_fields(store: &PerturbStore, fields: &BTreeSet<Key>) -> BTreeSet<Key> {
    store
        .user_value_rows()
        .filter(|(_, row)| row.keys().any(|f| fields.contains(f)))
        .map(|(k, _)| k.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Destroy closures
// ---------------------------------------------------------------------------

/// Experiments crediting the investigator. Destroying an investigator
/// rewrites those lists; it never destroys the experiments.
pub fn investigator_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = HolderSets {
        experiments: experiments_of_investigators(store, &roots),
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::Investigator, key.clone(), holders)
}

/// Data points measuring the target.
pub fn target_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = HolderSets {
        data_points: points_of_targets(store, &roots),
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::Target, key.clone(), holders)
}

/// Source definitions naming the source (as agent or proxy), the
/// experiments using those definitions, and their data points.
pub fn source_name_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let defs = defs_of_source_names(store, &roots);
    let experiments = experiments_of_defs(store, &defs);
    let holders = HolderSets {
        data_points: points_of_experiments(store, &experiments),
        experiments,
        pert_sources: defs,
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::SourceName, key.clone(), holders)
}

/// Experiments whose source sets hold the definition, and their data
/// points.
pub fn pert_source_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let experiments = experiments_of_defs(store, &roots);
    let holders = HolderSets {
        data_points: points_of_experiments(store, &experiments),
        experiments,
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::PertSource, key.clone(), holders)
}

/// Data points belonging to the experiment.
pub fn experiment_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = HolderSets {
        data_points: points_of_experiments(store, &roots),
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::Experiment, key.clone(), holders)
}

/// Definitions of the perturbation type, their experiments, their points.
pub fn pert_type_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let defs = defs_of_pert_types(store, &roots);
    let experiments = experiments_of_defs(store, &defs);
    let holders = HolderSets {
        data_points: points_of_experiments(store, &experiments),
        experiments,
        pert_sources: defs,
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::PertType, key.clone(), holders)
}

/// Measurement properties on the scale, and the data points measured with
/// those properties.
pub fn measure_scale_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let props = props_of_scales(store, &roots);
    let holders = HolderSets {
        data_points: points_of_props(store, &props),
        measure_props: props,
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::MeasureScale, key.clone(), holders)
}

/// Data points measured with the property.
pub fn measure_prop_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = HolderSets {
        data_points: points_of_props(store, &roots),
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::MeasureProp, key.clone(), holders)
}

/// Experiments run under the condition, and their data points.
pub fn condition_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let experiments = experiments_of_conditions(store, &roots);
    let holders = HolderSets {
        data_points: points_of_experiments(store, &experiments),
        experiments,
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::Condition, key.clone(), holders)
}

/// Data points measured against the control. Destroying a control clears
/// the field; the points survive.
pub fn control_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = HolderSets {
        control_points: points_of_controls(store, &roots),
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::Control, key.clone(), holders)
}

/// Every holder of the annotation across the three independent list kinds:
/// data-point notes, target footnotes, source-definition annotations.
pub fn annotation_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = annotation_holders(store, &roots);
    Dependencies::destroy(store, EntityKind::Annotation, key.clone(), holders)
}

/// Data points carrying a value for the user field. Destroying the field
/// drops the column.
pub fn user_field_reference_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = HolderSets {
        value_points: value_points_of_fields(store, &roots),
        ..HolderSets::default()
    };
    Dependencies::destroy(store, EntityKind::UserField, key.clone(), holders)
}

// ---------------------------------------------------------------------------
// Prune closures: same holders, but the root survives
// ---------------------------------------------------------------------------

pub fn investigator_prune_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = HolderSets {
        experiments: experiments_of_investigators(store, &roots),
        ..HolderSets::default()
    };
    Dependencies::prune(
        store,
        EntityKind::Investigator,
        FieldTag::Investigators,
        key.clone(),
        holders,
    )
}

pub fn control_prune_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = HolderSets {
        control_points: points_of_controls(store, &roots),
        ..HolderSets::default()
    };
    Dependencies::prune(store, EntityKind::Control, FieldTag::Control, key.clone(), holders)
}

pub fn annotation_prune_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = annotation_holders(store, &roots);
    Dependencies::prune(
        store,
        EntityKind::Annotation,
        FieldTag::Annotations,
        key.clone(),
        holders,
    )
}

pub fn user_field_prune_set(store: &PerturbStore, key: &Key) -> Dependencies {
    let roots = BTreeSet::from([key.clone()]);
    let holders = HolderSets {
        value_points: value_points_of_fields(store, &roots),
        ..HolderSets::default()
    };
    Dependencies::prune(
        store,
        EntityKind::UserField,
        FieldTag::UserFieldValues,
        key.clone(),
        holders,
    )
}

// ---------------------------------------------------------------------------
// Merge closures
// ---------------------------------------------------------------------------

fn abandoned_of(keys: &[Key], survivor: &Key) -> BTreeSet<Key> {
    keys.iter().filter(|k| *k != survivor).cloned().collect()
}

/// Experiments crediting any abandoned investigator. Holders already
/// crediting only the survivor are untouched.
pub fn investigator_merge_set(store: &PerturbStore, keys: &[Key], survivor: &Key) -> Dependencies {
    let abandoned = abandoned_of(keys, survivor);
    let holders = HolderSets {
        experiments: experiments_of_investigators(store, &abandoned),
        ..HolderSets::default()
    };
    Dependencies::merge(store, EntityKind::Investigator, keys, survivor, holders)
}

/// Source definitions naming any abandoned source name (agent or proxy).
pub fn source_name_merge_set(store: &PerturbStore, keys: &[Key], survivor: &Key) -> Dependencies {
    let abandoned = abandoned_of(keys, survivor);
    let holders = HolderSets {
        pert_sources: defs_of_source_names(store, &abandoned),
        ..HolderSets::default()
    };
    Dependencies::merge(store, EntityKind::SourceName, keys, survivor, holders)
}

/// Experiments whose source sets hold any abandoned definition.
pub fn pert_source_merge_set(store: &PerturbStore, keys: &[Key], survivor: &Key) -> Dependencies {
    let abandoned = abandoned_of(keys, survivor);
    let holders = HolderSets {
        experiments: experiments_of_defs(store, &abandoned),
        ..HolderSets::default()
    };
    Dependencies::merge(store, EntityKind::PertSource, keys, survivor, holders)
}

/// Data points measuring any abandoned target.
pub fn target_merge_set(store: &PerturbStore, keys: &[Key], survivor: &Key) -> Dependencies {
    let abandoned = abandoned_of(keys, survivor);
    let holders = HolderSets {
        data_points: points_of_targets(store, &abandoned),
        ..HolderSets::default()
    };
    Dependencies::merge(store, EntityKind::Target, keys, survivor, holders)
}

/// Source definitions of any abandoned perturbation type.
pub fn pert_type_merge_set(store: &PerturbStore, keys: &[Key], survivor: &Key) -> Dependencies {
    let abandoned = abandoned_of(keys, survivor);
    let holders = HolderSets {
        pert_sources: defs_of_pert_types(store, &abandoned),
        ..HolderSets::default()
    };
    Dependencies::merge(store, EntityKind::PertType, keys, survivor, holders)
}

/// Measurement properties on any abandoned scale.
pub fn measure_scale_merge_set(store: &PerturbStore, keys: &[Key], survivor: &Key) -> Dependencies {
    let abandoned = abandoned_of(keys, survivor);
    let holders = HolderSets {
        measure_props: props_of_scales(store, &abandoned),
        ..HolderSets::default()
    };
    Dependencies::merge(store, EntityKind::MeasureScale, keys, survivor, holders)
}

/// Data points measured with any abandoned property.
pub fn measure_prop_merge_set(store: &PerturbStore, keys: &[Key], survivor: &Key) -> Dependencies {
    let abandoned = abandoned_of(keys, survivor);
    let holders = HolderSets {
        data_points: points_of_props(store, &abandoned),
        ..HolderSets::default()
    };
    Dependencies::merge(store, EntityKind::MeasureProp, keys, survivor, holders)
}

/// Experiments run under any abandoned condition.
pub fn condition_merge_set(store: &PerturbStore, keys: &[Key], survivor: &Key) -> Dependencies {
    let abandoned = abandoned_of(keys, survivor);
    let holders = HolderSets {
        experiments: experiments_of_conditions(store, &abandoned),
        ..HolderSets::default()
    };
    Dependencies::merge(store, EntityKind::Condition, keys, survivor, holders)
}

/// Data points measured against any abandoned control.
pub fn control_merge_set(store: &PerturbStore, keys: &[Key], survivor: &Key) -> Dependencies {
    let abandoned = abandoned_of(keys, survivor);
    let holders = HolderSets {
        control_points: points_of_controls(store, &abandoned),
        ..HolderSets::default()
    };
    Dependencies::merge(store, EntityKind::Control, keys, survivor, holders)
}

/// Holders of any abandoned annotation, across all three list kinds.
pub fn annotation_merge_set(store: &PerturbStore, keys: &[Key], survivor: &Key) -> Dependencies {
    let abandoned = abandoned_of(keys, survivor);
    let holders = annotation_holders(store, &abandoned);
    Dependencies::merge(store, EntityKind::Annotation, keys, survivor, holders)
}

/// For a source-definition merge plan: the experiments whose source sets
/// would hold the survivor more than once after substitution. These
/// collapse to a single occurrence when the merge executes; callers warn
/// before committing.
///
/// # Panics
///
/// If the plan is not a source-definition merge.
pub fn multi_source_collapse_merge_set(
    store: &PerturbStore,
    deps: &Dependencies,
) -> BTreeSet<Key> {
    let survivor = match (&deps.kind, &deps.operation) {
        (EntityKind::PertSource, Operation::MergeInto(s)) => s,
        other => panic!("collapse query on a non-source-merge plan: {:?}", other),
    };
    deps.holders
        .experiments
        .iter()
        .filter(|key| {
            let experiment = store
                .experiment(key)
                .unwrap_or_else(|| panic!("merge plan holder '{}' vanished", key));
            let post_merge = experiment
                .sources
                .iter()
                .filter(|s| deps.roots.contains(*s) || *s == survivor)
                .count();
            post_merge > 1
        })
        .cloned()
        .collect()
}
