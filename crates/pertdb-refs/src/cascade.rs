//! Cascade execution: driving the store through a computed plan.
//!
//! [`destroy`] and [`merge`] consume a [`Dependencies`] plan and issue the
//! store mutations it calls for, most-downstream holders first: side-table
//! rows ride along with their data points, data points go before
//! experiments, experiments before source definitions, and the root
//! dictionary entry goes last. Every mutation's change record is collected
//! in order; the caller groups the list into one logical undo unit.
//!
//! The step sequence is not transactional: no individual step can fail
//! against a valid plan, and there is no rollback of earlier steps. What
//! *is* checked, loudly, is plan freshness -- a plan records the store
//! serial it was computed against, and applying it after any intervening
//! mutation (including applying it twice) panics rather than corrupting
//! the graph.

use tracing::{debug, trace};

use pertdb_core::{Change, EntityKind, Key, KeyList, PerturbStore};

use crate::closure::{Dependencies, FieldTag, Operation};

fn assert_fresh(store: &PerturbStore, deps: &Dependencies) {
    if store.serial() != deps.computed_at {
        panic!(
            "stale dependency plan: computed at serial {}, store is at {}",
            deps.computed_at,
            store.serial()
        );
    }
}

/// Executes a destroy or prune plan. Returns one change per mutation, in
/// application order.
///
/// # Panics
///
/// On a merge plan, a stale plan, or a root kind the operation does not
/// apply to.
pub fn destroy(store: &mut PerturbStore, deps: &Dependencies) -> Vec<Change> {
    assert_fresh(store, deps);
    match &deps.operation {
        Operation::Destroy => {
            debug!(kind = %deps.kind, dependents = deps.holders.total(), "executing destroy cascade");
            let mut changes = Vec::new();
            prune_holders(store, deps, &mut changes);
            destroy_holders(store, deps, &mut changes);
            destroy_roots(store, deps, &mut changes);
            changes
        }
        Operation::PruneField(_) => {
            debug!(kind = %deps.kind, dependents = deps.holders.total(), "executing prune cascade");
            let mut changes = Vec::new();
            prune_holders(store, deps, &mut changes);
            changes
        }
        Operation::MergeInto(_) => panic!("merge plan handed to the destroy cascade"),
    }
}

/// Removes references to the roots from holder fields; holders survive.
fn prune_holders(store: &mut PerturbStore, deps: &Dependencies, changes: &mut Vec<Change>) {
    match deps.kind {
        EntityKind::Investigator => {
            for key in &deps.holders.experiments {
                let mut experiment = store
                    .experiment(key)
                    .unwrap_or_else(|| panic!("plan holder '{}' vanished", key))
                    .clone();
                experiment
                    .investigators
                    .retain(|i| !deps.roots.contains(i));
                changes.extend(store.set_experiment(key, experiment));
            }
        }
        EntityKind::Control => {
            for key in &deps.holders.control_points {
                let mut point = store
                    .data_point(key)
                    .unwrap_or_else(|| panic!("plan holder '{}' vanished", key))
                    .clone();
                point.control = None;
                changes.extend(store.set_data_point(key, point));
            }
        }
        EntityKind::Annotation => {
            for key in &deps.holders.note_holders {
                let notes: KeyList = store
                    .data_point_notes(key)
                    .map(|n| n.iter().filter(|a| !deps.roots.contains(*a)).cloned().collect())
                    .unwrap_or_default();
                changes.extend(store.set_data_point_notes(key, notes));
            }
            for key in &deps.holders.targets {
                let mut target = store
                    .target(key)
                    .unwrap_or_else(|| panic!("plan holder '{}' vanished", key))
                    .clone();
                target.footnotes.retain(|a| !deps.roots.contains(a));
                changes.extend(store.set_target(key, target));
            }
            for key in &deps.holders.annotated_sources {
                let mut def = store
                    .pert_source(key)
                    .unwrap_or_else(|| panic!("plan holder '{}' vanished", key))
                    .clone();
                def.annotations.retain(|a| !deps.roots.contains(a));
                changes.extend(store.set_pert_source(key, def));
            }
        }
        EntityKind::UserField => {
            for point in &deps.holders.value_points {
                for field in &deps.roots {
                    changes.extend(store.set_user_field_value(point, field, None));
                }
            }
        }
        // Structural root kinds have nothing to prune; their holders are
        // destroyed outright.
        _ => {}
    }
}

/// Deletes dependent records, downstream kinds first.
fn destroy_holders(store: &mut PerturbStore, deps: &Dependencies, changes: &mut Vec<Change>) {
    for key in &deps.holders.data_points {
        trace!(%key, "cascade removes data point");
        changes.push(store.delete_data_point(key));
    }
    // Experiments are holders-to-destroy for every structural root except
    // investigators, whose holders were pruned above.
    if deps.kind != EntityKind::Investigator {
        for key in &deps.holders.experiments {
            trace!(%key, "cascade removes experiment");
            changes.push(store.delete_experiment(key));
        }
    }
    for key in &deps.holders.pert_sources {
        trace!(%key, "cascade removes source definition");
        changes.push(store.delete_pert_source(key));
    }
    for key in &deps.holders.measure_props {
        trace!(%key, "cascade removes measurement property");
        changes.push(store.delete_measure_prop(key));
    }
}

fn destroy_roots(store: &mut PerturbStore, deps: &Dependencies, changes: &mut Vec<Change>) {
    for root in &deps.roots {
        changes.push(delete_by_kind(store, deps.kind, root));
    }
}

fn delete_by_kind(store: &mut PerturbStore, kind: EntityKind, key: &Key) -> Change {
    match kind {
        EntityKind::Investigator => store.delete_investigator(key),
        EntityKind::Target => store.delete_target(key),
        EntityKind::SourceName => store.delete_source_name(key),
        EntityKind::PertSource => store.delete_pert_source(key),
        EntityKind::Experiment => store.delete_experiment(key),
        EntityKind::DataPoint => store.delete_data_point(key),
        EntityKind::PertType => store.delete_pert_type(key),
        EntityKind::MeasureScale => store.delete_measure_scale(key),
        EntityKind::MeasureProp => store.delete_measure_prop(key),
        EntityKind::Condition => store.delete_condition(key),
        EntityKind::Control => store.delete_control(key),
        EntityKind::Annotation => store.delete_annotation(key),
        EntityKind::UserField => store.delete_user_field(key),
    }
}

/// Executes a merge plan: rewrites every holder of an abandoned key onto
/// the survivor (deduplicating survivor occurrences introduced by the
/// substitution, preserving list order otherwise), then removes the
/// abandoned roots. Returns one change per mutation, in application order.
///
/// # Panics
///
/// On a non-merge plan, a stale plan, or a root kind without merge support.
pub fn merge(store: &mut PerturbStore, deps: &Dependencies) -> Vec<Change> {
    assert_fresh(store, deps);
    let survivor = match &deps.operation {
        Operation::MergeInto(s) => s.clone(),
        other => panic!("non-merge plan handed to the merge cascade: {:?}", other),
    };
    debug!(kind = %deps.kind, survivor = %survivor, abandoned = deps.roots.len(), "executing merge cascade");

    let mut changes = Vec::new();
    match deps.kind {
        EntityKind::Investigator => {
            for key in &deps.holders.experiments {
                let mut experiment = holder(store.experiment(key), key).clone();
                experiment.investigators =
                    rewrite_list(&experiment.investigators, &deps.roots, &survivor);
                changes.extend(store.set_experiment(key, experiment));
            }
        }
        EntityKind::SourceName => {
            for key in &deps.holders.pert_sources {
                let mut def = holder(store.pert_source(key), key).clone();
                if deps.roots.contains(&def.source_name) {
                    def.source_name = survivor.clone();
                }
                if let Some(proxy) = &mut def.proxy {
                    if deps.roots.contains(&proxy.source_name) {
                        proxy.source_name = survivor.clone();
                    }
                }
                changes.extend(store.set_pert_source(key, def));
            }
        }
        EntityKind::PertSource => {
            for key in &deps.holders.experiments {
                let mut experiment = holder(store.experiment(key), key).clone();
                experiment.sources = rewrite_list(&experiment.sources, &deps.roots, &survivor);
                changes.extend(store.set_experiment(key, experiment));
            }
        }
        EntityKind::Target => {
            for key in &deps.holders.data_points {
                let mut point = holder(store.data_point(key), key).clone();
                point.target = survivor.clone();
                changes.extend(store.set_data_point(key, point));
            }
        }
        EntityKind::PertType => {
            for key in &deps.holders.pert_sources {
                let mut def = holder(store.pert_source(key), key).clone();
                def.pert_type = survivor.clone();
                changes.extend(store.set_pert_source(key, def));
            }
        }
        EntityKind::MeasureScale => {
            for key in &deps.holders.measure_props {
                let mut prop = holder(store.measure_prop(key), key).clone();
                prop.scale = survivor.clone();
                changes.extend(store.set_measure_prop(key, prop));
            }
        }
        EntityKind::MeasureProp => {
            for key in &deps.holders.data_points {
                let mut point = holder(store.data_point(key), key).clone();
                point.measurement = survivor.clone();
                changes.extend(store.set_data_point(key, point));
            }
        }
        EntityKind::Condition => {
            for key in &deps.holders.experiments {
                let mut experiment = holder(store.experiment(key), key).clone();
                experiment.condition = survivor.clone();
                changes.extend(store.set_experiment(key, experiment));
            }
        }
        EntityKind::Control => {
            for key in &deps.holders.control_points {
                let mut point = holder(store.data_point(key), key).clone();
                point.control = Some(survivor.clone());
                changes.extend(store.set_data_point(key, point));
            }
        }
        EntityKind::Annotation => {
            for key in &deps.holders.note_holders {
                let notes = holder(store.data_point_notes(key), key).clone();
                let notes = rewrite_list(&notes, &deps.roots, &survivor);
                changes.extend(store.set_data_point_notes(key, notes));
            }
            for key in &deps.holders.targets {
                let mut target = holder(store.target(key), key).clone();
                target.footnotes = rewrite_list(&target.footnotes, &deps.roots, &survivor);
                changes.extend(store.set_target(key, target));
            }
            for key in &deps.holders.annotated_sources {
                let mut def = holder(store.pert_source(key), key).clone();
                def.annotations = rewrite_list(&def.annotations, &deps.roots, &survivor);
                changes.extend(store.set_pert_source(key, def));
            }
        }
        kind => panic!("no merge support for {} roots", kind),
    }

    for root in &deps.roots {
        changes.push(delete_by_kind(store, deps.kind, root));
    }
    changes
}

fn holder<'a, T>(found: Option<&'a T>, key: &Key) -> &'a T {
    found.unwrap_or_else(|| panic!("plan holder '{}' vanished", key))
}

/// Substitutes abandoned keys with the survivor, preserving order and
/// collapsing survivor occurrences introduced by the substitution to the
/// first one.
fn rewrite_list(
    list: &KeyList,
    abandoned: &std::collections::BTreeSet<Key>,
    survivor: &Key,
) -> KeyList {
    let mut out = KeyList::new();
    let mut seen_survivor = false;
    for key in list {
        let mapped = if abandoned.contains(key) {
            survivor.clone()
        } else {
            key.clone()
        };
        if mapped == *survivor {
            if seen_survivor {
                continue;
            }
            seen_survivor = true;
        }
        out.push(mapped);
    }
    out
}
