//! Bulk reference-count queries.
//!
//! One pass per query, counting how often each record of a kind is
//! referenced across its holder kinds. The UI shows these counts next to
//! dictionary entries before allowing edits or deletions; a zero count
//! means the entry can go without a cascade.
//!
//! Every key of the counted kind appears in the result, including keys
//! with zero references.

use std::collections::HashMap;

use pertdb_core::{Key, PerturbStore};

fn zeroed<'a, T: 'a>(rows: impl Iterator<Item = (&'a Key, &'a T)>) -> HashMap<Key, usize> {
    rows.map(|(k, _)| (k.clone(), 0)).collect()
}

fn bump(counts: &mut HashMap<Key, usize>, key: &Key) {
    if let Some(n) = counts.get_mut(key) {
        *n += 1;
    }
}

/// Experiments crediting each investigator.
pub fn all_investigator_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.investigators());
    for (_, experiment) in store.experiments() {
        for investigator in &experiment.investigators {
            bump(&mut counts, investigator);
        }
    }
    counts
}

/// Data points measuring each target.
pub fn all_target_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.targets());
    for (_, point) in store.data_points() {
        bump(&mut counts, &point.target);
    }
    counts
}

/// Source definitions naming each source name, as agent or proxy.
pub fn all_source_name_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.source_names());
    for (_, def) in store.pert_sources() {
        bump(&mut counts, &def.source_name);
        if let Some(proxy) = &def.proxy {
            bump(&mut counts, &proxy.source_name);
        }
    }
    counts
}

/// Experiments whose source sets hold each definition.
pub fn all_pert_source_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.pert_sources());
    for (_, experiment) in store.experiments() {
        for source in &experiment.sources {
            bump(&mut counts, source);
        }
    }
    counts
}

/// Data points belonging to each experiment.
pub fn all_experiment_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.experiments());
    for (_, point) in store.data_points() {
        bump(&mut counts, &point.experiment);
    }
    counts
}

/// Source definitions of each perturbation type.
pub fn all_pert_type_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.pert_types());
    for (_, def) in store.pert_sources() {
        bump(&mut counts, &def.pert_type);
    }
    counts
}

/// Measurement properties on each scale.
pub fn all_measure_scale_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.measure_scales());
    for (_, prop) in store.measure_props() {
        bump(&mut counts, &prop.scale);
    }
    counts
}

/// Data points measured with each property.
pub fn all_measure_prop_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.measure_props());
    for (_, point) in store.data_points() {
        bump(&mut counts, &point.measurement);
    }
    counts
}

/// Experiments run under each condition.
pub fn all_condition_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.conditions());
    for (_, experiment) in store.experiments() {
        bump(&mut counts, &experiment.condition);
    }
    counts
}

/// Data points measured against each control.
pub fn all_control_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.controls());
    for (_, point) in store.data_points() {
        if let Some(control) = &point.control {
            bump(&mut counts, control);
        }
    }
    counts
}

/// References to each annotation across all three holder kinds: data-point
/// notes, target footnotes, source-definition annotation lists.
pub fn all_annotation_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.annotations());
    for (_, notes) in store.note_rows() {
        for note in notes {
            bump(&mut counts, note);
        }
    }
    for (_, target) in store.targets() {
        for footnote in &target.footnotes {
            bump(&mut counts, footnote);
        }
    }
    for (_, def) in store.pert_sources() {
        for annotation in &def.annotations {
            bump(&mut counts, annotation);
        }
    }
    counts
}

/// Data points carrying a value for each user field.
pub fn all_user_field_reference_counts(store: &PerturbStore) -> HashMap<Key, usize> {
    let mut counts = zeroed(store.user_fields());
    for (_, row) in store.user_value_rows() {
        for field in row.keys() {
            bump(&mut counts, field);
        }
    }
    counts
}
