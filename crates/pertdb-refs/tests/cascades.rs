//! Cascade-execution tests: destroy and merge plans applied end-to-end,
//! including undo of a whole cascade in reverse order.

use std::collections::BTreeSet;

use pertdb_core::{
    Annotation, Condition, DataPoint, Experiment, ExperimentTime, Investigator, Key, KeyList,
    LinkSign, MeasureProp, MeasureScale, MeasureValue, PertSource, PertType, PerturbStore,
    SourceName, Target, UserField,
};
use pertdb_refs::{cascade, closure};

fn k(id: &str) -> Key {
    Key::from(id)
}

fn set(keys: &[&Key]) -> BTreeSet<Key> {
    keys.iter().map(|key| (*key).clone()).collect()
}

/// One scale, one property, one condition, one target: the skeleton most
/// cascade tests hang their records on.
fn skeleton() -> PerturbStore {
    let mut store = PerturbStore::new();
    store
        .add_measure_scale_for_io(k("scale"), MeasureScale { name: "fold change".into(), unsigned: false })
        .unwrap();
    store
        .add_measure_prop_for_io(
            k("prop"),
            MeasureProp { name: "qPCR".into(), scale: k("scale"), neg_thresh: None, pos_thresh: None },
        )
        .unwrap();
    store
        .add_pert_type_for_io(
            k("maso"),
            PertType { name: "MASO".into(), abbrev: None, link_sign: LinkSign::Negative },
        )
        .unwrap();
    store
        .add_condition_for_io(k("std"), Condition { name: "standard".into() })
        .unwrap();
    store
        .add_target_for_io(k("target"), Target { name: "endo16".into(), footnotes: KeyList::new() })
        .unwrap();
    store
        .add_source_name_for_io(k("gene-x"), SourceName { name: "GeneX".into() })
        .unwrap();
    store
}

fn add_point(store: &mut PerturbStore, key: &str, experiment: &str, value: f64) {
    store
        .add_data_point_for_io(
            k(key),
            DataPoint {
                experiment: k(experiment),
                target: k("target"),
                measurement: k("prop"),
                value: MeasureValue::Number(value),
                control: None,
                force_significant: None,
                batch: None,
                date: None,
                comment: None,
            },
        )
        .unwrap();
}

#[test]
fn destroy_measure_scale_removes_points_then_props_then_scale() {
    let mut store = skeleton();
    store
        .add_experiment_for_io(
            k("exp"),
            Experiment {
                sources: KeyList::new(),
                time: ExperimentTime::Point(24),
                investigators: KeyList::new(),
                condition: k("std"),
            },
        )
        .unwrap();
    add_point(&mut store, "point", "exp", 2.0);

    let deps = closure::measure_scale_reference_set(&store, &k("scale"));
    assert_eq!(deps.holders.data_points, set(&[&k("point")]));
    assert_eq!(deps.holders.measure_props, set(&[&k("prop")]));

    let changes = cascade::destroy(&mut store, &deps);

    // Downstream first: the data point, then the property, then the scale.
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[0].key(), &k("point"));
    assert_eq!(changes[1].key(), &k("prop"));
    assert_eq!(changes[2].key(), &k("scale"));

    assert!(store.data_point(&k("point")).is_none());
    assert!(store.measure_prop(&k("prop")).is_none());
    assert!(store.measure_scale(&k("scale")).is_none());
    // The experiment was never a holder of the scale and survives.
    assert!(store.experiment(&k("exp")).is_some());
}

#[test]
fn destroy_annotation_prunes_every_list_and_undo_restores_them() {
    let mut store = skeleton();
    store
        .add_annotation_for_io(k("note"), Annotation { tag: "1".into(), message: "weak".into() })
        .unwrap();
    store
        .add_pert_source_for_io(
            k("def"),
            PertSource {
                source_name: k("gene-x"),
                pert_type: k("maso"),
                proxy: None,
                annotations: KeyList::from_vec(vec![k("note")]),
            },
        )
        .unwrap();
    store
        .add_experiment_for_io(
            k("exp"),
            Experiment {
                sources: KeyList::from_vec(vec![k("def")]),
                time: ExperimentTime::Point(24),
                investigators: KeyList::new(),
                condition: k("std"),
            },
        )
        .unwrap();
    add_point(&mut store, "point", "exp", 1.0);
    store
        .add_data_point_notes_for_io(k("point"), KeyList::from_vec(vec![k("note")]))
        .unwrap();
    let mut annotated_target = store.target(&k("target")).unwrap().clone();
    annotated_target.footnotes.push(k("note"));
    store.set_target(&k("target"), annotated_target).unwrap();

    let serial = store.serial();
    let deps = closure::annotation_reference_set(&store, &k("note"));
    let changes = cascade::destroy(&mut store, &deps);

    assert!(store.annotation(&k("note")).is_none());
    assert!(store.data_point_notes(&k("point")).is_none(), "empty list drops the row");
    assert!(store.target(&k("target")).unwrap().footnotes.is_empty());
    assert!(store.pert_source(&k("def")).unwrap().annotations.is_empty());
    // Holders survive an annotation cascade.
    assert!(store.data_point(&k("point")).is_some());

    // Undoing the collected changes in reverse restores every holder list
    // and the annotation itself, serial included.
    for change in changes.iter().rev() {
        store.change_undo(change);
    }
    assert_eq!(store.serial(), serial);
    assert!(store.annotation(&k("note")).is_some());
    assert_eq!(
        store.data_point_notes(&k("point")).map(|n| n.as_slice()),
        Some(&[k("note")][..])
    );
    assert_eq!(store.target(&k("target")).unwrap().footnotes.as_slice(), &[k("note")][..]);
    assert_eq!(store.pert_source(&k("def")).unwrap().annotations.as_slice(), &[k("note")][..]);
}

#[test]
fn destroy_source_name_cascades_three_hops() {
    let mut store = skeleton();
    store
        .add_pert_source_for_io(
            k("def"),
            PertSource {
                source_name: k("gene-x"),
                pert_type: k("maso"),
                proxy: None,
                annotations: KeyList::new(),
            },
        )
        .unwrap();
    store
        .add_experiment_for_io(
            k("exp"),
            Experiment {
                sources: KeyList::from_vec(vec![k("def")]),
                time: ExperimentTime::Point(24),
                investigators: KeyList::new(),
                condition: k("std"),
            },
        )
        .unwrap();
    add_point(&mut store, "point", "exp", 1.5);

    let deps = closure::source_name_reference_set(&store, &k("gene-x"));
    cascade::destroy(&mut store, &deps);

    assert!(store.source_name(&k("gene-x")).is_none());
    assert!(store.pert_source(&k("def")).is_none());
    assert!(store.experiment(&k("exp")).is_none());
    assert!(store.data_point(&k("point")).is_none());
    // Unrelated dictionaries stand.
    assert!(store.condition(&k("std")).is_some());
    assert!(store.target(&k("target")).is_some());
}

#[test]
fn destroy_investigator_prunes_experiment_lists() {
    let mut store = skeleton();
    store
        .add_investigator_for_io(k("smith"), Investigator { name: "Smith".into() })
        .unwrap();
    store
        .add_investigator_for_io(k("jones"), Investigator { name: "Jones".into() })
        .unwrap();
    store
        .add_experiment_for_io(
            k("exp"),
            Experiment {
                sources: KeyList::new(),
                time: ExperimentTime::Point(24),
                investigators: KeyList::from_vec(vec![k("jones"), k("smith")]),
                condition: k("std"),
            },
        )
        .unwrap();

    let deps = closure::investigator_reference_set(&store, &k("smith"));
    cascade::destroy(&mut store, &deps);

    assert!(store.investigator(&k("smith")).is_none());
    let experiment = store.experiment(&k("exp")).unwrap();
    assert_eq!(experiment.investigators.as_slice(), &[k("jones")][..]);
}

#[test]
fn prune_plan_leaves_the_root_alive() {
    let mut store = skeleton();
    store
        .add_investigator_for_io(k("smith"), Investigator { name: "Smith".into() })
        .unwrap();
    store
        .add_experiment_for_io(
            k("exp"),
            Experiment {
                sources: KeyList::new(),
                time: ExperimentTime::Point(24),
                investigators: KeyList::from_vec(vec![k("smith")]),
                condition: k("std"),
            },
        )
        .unwrap();

    let deps = closure::investigator_prune_set(&store, &k("smith"));
    cascade::destroy(&mut store, &deps);

    assert!(store.investigator(&k("smith")).is_some(), "prune spares the root");
    assert!(store.experiment(&k("exp")).unwrap().investigators.is_empty());
}

#[test]
fn destroy_user_field_drops_the_column() {
    let mut store = skeleton();
    store
        .add_experiment_for_io(
            k("exp"),
            Experiment {
                sources: KeyList::new(),
                time: ExperimentTime::Point(24),
                investigators: KeyList::new(),
                condition: k("std"),
            },
        )
        .unwrap();
    add_point(&mut store, "point", "exp", 1.0);
    store
        .add_user_field_for_io(k("lot"), UserField { name: "lot".into() })
        .unwrap();
    store
        .add_user_field_values_for_io(
            k("point"),
            [(k("lot"), "L-17".to_string())].into_iter().collect(),
        )
        .unwrap();

    let deps = closure::user_field_reference_set(&store, &k("lot"));
    cascade::destroy(&mut store, &deps);

    assert!(store.user_field(&k("lot")).is_none());
    assert!(store.user_field_values(&k("point")).is_none(), "empty row is dropped");
    assert!(store.data_point(&k("point")).is_some());
}

/// Three structurally duplicate definitions (loaded before the resolver
/// could have deduplicated them) merge onto one survivor. Every
/// experiment referencing an abandoned definition is rewritten to the
/// survivor only, collapsing introduced duplicates.
#[test]
fn merge_pert_sources_rewrites_experiments_and_collapses_duplicates() {
    let mut store = skeleton();
    for def in ["s1", "s2", "s3"] {
        store
            .add_pert_source_for_io(
                k(def),
                PertSource {
                    source_name: k("gene-x"),
                    pert_type: k("maso"),
                    proxy: None,
                    annotations: KeyList::new(),
                },
            )
            .unwrap();
    }
    store
        .add_experiment_for_io(
            k("exp-mixed"),
            Experiment {
                sources: KeyList::from_vec(vec![k("s1"), k("s2")]),
                time: ExperimentTime::Point(24),
                investigators: KeyList::new(),
                condition: k("std"),
            },
        )
        .unwrap();
    store
        .add_experiment_for_io(
            k("exp-late"),
            Experiment {
                sources: KeyList::from_vec(vec![k("s3"), k("s2")]),
                time: ExperimentTime::Point(30),
                investigators: KeyList::new(),
                condition: k("std"),
            },
        )
        .unwrap();
    add_point(&mut store, "point", "exp-mixed", 2.0);

    let keys = [k("s1"), k("s2"), k("s3")];
    let deps = closure::pert_source_merge_set(&store, &keys, &k("s1"));
    assert_eq!(deps.holders.experiments, set(&[&k("exp-mixed"), &k("exp-late")]));

    // exp-mixed holds survivor and abandoned at once: flagged for collapse.
    let collapsing = closure::multi_source_collapse_merge_set(&store, &deps);
    assert_eq!(collapsing, set(&[&k("exp-mixed")]));

    cascade::merge(&mut store, &deps);

    assert_eq!(
        store.experiment(&k("exp-mixed")).unwrap().sources.as_slice(),
        &[k("s1")][..],
        "duplicate introduced by the merge collapses to one occurrence"
    );
    assert_eq!(store.experiment(&k("exp-late")).unwrap().sources.as_slice(), &[k("s1")][..]);
    assert!(store.pert_source(&k("s1")).is_some());
    assert!(store.pert_source(&k("s2")).is_none());
    assert!(store.pert_source(&k("s3")).is_none());

    // Closure completeness check: nothing references the abandoned keys.
    for (_, experiment) in store.experiments() {
        assert!(!experiment.sources.contains(&k("s2")));
        assert!(!experiment.sources.contains(&k("s3")));
    }
    // The data point still reaches the survivor through its experiment.
    let point = store.data_point(&k("point")).unwrap();
    assert!(store
        .experiment(&point.experiment)
        .unwrap()
        .sources
        .contains(&k("s1")));
}

#[test]
fn merge_investigators_preserves_list_order() {
    let mut store = skeleton();
    for (key, name) in [("a", "Adams"), ("b", "Baker"), ("c", "Clark")] {
        store
            .add_investigator_for_io(k(key), Investigator { name: name.into() })
            .unwrap();
    }
    store
        .add_experiment_for_io(
            k("exp"),
            Experiment {
                sources: KeyList::new(),
                time: ExperimentTime::Point(24),
                investigators: KeyList::from_vec(vec![k("b"), k("a"), k("c")]),
                condition: k("std"),
            },
        )
        .unwrap();

    // Merge Clark into Baker: Baker keeps its original slot, Clark's slot
    // disappears, Adams is untouched.
    let deps = closure::investigator_merge_set(&store, &[k("b"), k("c")], &k("b"));
    cascade::merge(&mut store, &deps);

    let experiment = store.experiment(&k("exp")).unwrap();
    assert_eq!(experiment.investigators.as_slice(), &[k("b"), k("a")][..]);
    assert!(store.investigator(&k("c")).is_none());
    assert!(store.investigator(&k("b")).is_some());
}

#[test]
fn merge_source_names_rewrites_agents_and_proxies() {
    let mut store = skeleton();
    store
        .add_source_name_for_io(k("gene-x2"), SourceName { name: "GeneX-alias".into() })
        .unwrap();
    store
        .add_pert_source_for_io(
            k("def"),
            PertSource {
                source_name: k("gene-x2"),
                pert_type: k("maso"),
                proxy: Some(pertdb_core::Proxy {
                    source_name: k("gene-x2"),
                    sign: pertdb_core::ProxySign::Same,
                }),
                annotations: KeyList::new(),
            },
        )
        .unwrap();

    let deps = closure::source_name_merge_set(&store, &[k("gene-x"), k("gene-x2")], &k("gene-x"));
    cascade::merge(&mut store, &deps);

    let def = store.pert_source(&k("def")).unwrap();
    assert_eq!(def.source_name, k("gene-x"));
    assert_eq!(def.proxy.as_ref().unwrap().source_name, k("gene-x"));
    assert!(store.source_name(&k("gene-x2")).is_none());
}

#[test]
fn merge_annotations_deduplicates_note_lists() {
    let mut store = skeleton();
    store
        .add_annotation_for_io(k("note-a"), Annotation { tag: "1".into(), message: "weak".into() })
        .unwrap();
    store
        .add_annotation_for_io(k("note-b"), Annotation { tag: "2".into(), message: "weak signal".into() })
        .unwrap();
    store
        .add_experiment_for_io(
            k("exp"),
            Experiment {
                sources: KeyList::new(),
                time: ExperimentTime::Point(24),
                investigators: KeyList::new(),
                condition: k("std"),
            },
        )
        .unwrap();
    add_point(&mut store, "point", "exp", 1.0);
    // The point already cites the survivor ahead of the abandoned note.
    store
        .add_data_point_notes_for_io(k("point"), KeyList::from_vec(vec![k("note-a"), k("note-b")]))
        .unwrap();

    let deps = closure::annotation_merge_set(&store, &[k("note-a"), k("note-b")], &k("note-a"));
    cascade::merge(&mut store, &deps);

    assert_eq!(
        store.data_point_notes(&k("point")).map(|n| n.as_slice()),
        Some(&[k("note-a")][..])
    );
    assert!(store.annotation(&k("note-b")).is_none());
}

#[test]
fn merge_measure_props_rewrites_points() {
    let mut store = skeleton();
    store
        .add_measure_prop_for_io(
            k("prop-dup"),
            MeasureProp { name: "qPCR (dup)".into(), scale: k("scale"), neg_thresh: None, pos_thresh: None },
        )
        .unwrap();
    store
        .add_experiment_for_io(
            k("exp"),
            Experiment {
                sources: KeyList::new(),
                time: ExperimentTime::Point(24),
                investigators: KeyList::new(),
                condition: k("std"),
            },
        )
        .unwrap();
    store
        .add_data_point_for_io(
            k("point"),
            DataPoint {
                experiment: k("exp"),
                target: k("target"),
                measurement: k("prop-dup"),
                value: MeasureValue::Number(1.0),
                control: None,
                force_significant: None,
                batch: None,
                date: None,
                comment: None,
            },
        )
        .unwrap();

    let deps = closure::measure_prop_merge_set(&store, &[k("prop"), k("prop-dup")], &k("prop"));
    cascade::merge(&mut store, &deps);

    assert_eq!(store.data_point(&k("point")).unwrap().measurement, k("prop"));
    assert!(store.measure_prop(&k("prop-dup")).is_none());
}

#[test]
#[should_panic(expected = "stale dependency plan")]
fn stale_plans_refuse_to_execute() {
    let mut store = skeleton();
    store
        .add_investigator_for_io(k("smith"), Investigator { name: "Smith".into() })
        .unwrap();

    let deps = closure::investigator_reference_set(&store, &k("smith"));
    // Any intervening mutation invalidates the plan.
    store.provide_investigator("Taylor");
    cascade::destroy(&mut store, &deps);
}

#[test]
#[should_panic(expected = "merge plan handed to the destroy cascade")]
fn destroy_rejects_merge_plans() {
    let mut store = skeleton();
    store
        .add_investigator_for_io(k("smith"), Investigator { name: "Smith".into() })
        .unwrap();
    store
        .add_investigator_for_io(k("jones"), Investigator { name: "Jones".into() })
        .unwrap();

    let deps = closure::investigator_merge_set(&store, &[k("smith"), k("jones")], &k("smith"));
    cascade::destroy(&mut store, &deps);
}
