//! The perturbation-experiment entity model.
//!
//! Every record type the store holds, from the numerous leaf
//! [`DataPoint`]s up through [`Experiment`]s and [`PertSource`] definitions
//! to the small controlled-vocabulary dictionaries. Entities reference each
//! other exclusively through [`Key`]s; none of these structs embeds another
//! entity, which is what keeps reference-closure computation total.
//!
//! Short ordered reference lists (source sets, investigator lists,
//! annotation lists) use [`SmallVec`] -- they are almost always a handful of
//! entries. Identity rules live alongside the types:
//! [`norm_name`] for the name-identified kinds, plain structural equality
//! for the composite kinds (entities do not store their own key, so
//! "equality minus ID" is just `==`).

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::key::Key;

/// Ordered list of entity keys, inline up to four entries.
pub type KeyList = SmallVec<[Key; 4]>;

/// Normalizes a display name for identity comparison: surrounding
/// whitespace and letter case are not identity-bearing.
pub fn norm_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Returns true when two display names denote the same identity.
pub fn same_name(a: &str, b: &str) -> bool {
    norm_name(a) == norm_name(b)
}

// ---------------------------------------------------------------------------
// Principal entities
// ---------------------------------------------------------------------------

/// A researcher credited on experiments. Identified by normalized name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investigator {
    pub name: String,
}

/// A measured gene or other target of perturbation effects.
///
/// Carries an ordered list of annotation keys (footnotes) displayed with
/// the target wherever it appears.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub footnotes: KeyList,
}

/// A named perturbation agent. Identified by normalized name.
///
/// A source name may exist only as the proxied species of some
/// [`PertSource`] and never as a principal agent; such "proxy-only" names
/// are ordinary records here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceName {
    pub name: String,
}

/// Sign relationship between a proxying agent and the species it stands in
/// for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxySign {
    /// The proxy perturbs in the same direction as the proxied species.
    Same,
    /// The proxy perturbs in the opposite direction.
    Opposite,
}

/// A proxied-species reference on a source definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    /// The [`SourceName`] this source stands in for.
    pub source_name: Key,
    pub sign: ProxySign,
}

/// A perturbation-source definition: agent plus perturbation type, an
/// optional proxied species, and an ordered annotation list.
///
/// Identified structurally: two definitions with equal fields are the same
/// definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PertSource {
    /// The [`SourceName`] of the perturbing agent.
    pub source_name: Key,
    /// The [`PertType`] applied (knockdown, overexpression, ...).
    pub pert_type: Key,
    pub proxy: Option<Proxy>,
    /// Ordered [`Annotation`] keys attached to this definition.
    pub annotations: KeyList,
}

/// When an experiment was performed: a single time point, or the legacy
/// span representation older data sets still carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentTime {
    Point(i32),
    /// Legacy representation; `min <= max`.
    Span { min: i32, max: i32 },
}

/// The shared context of one or more data points: an ordered set of
/// perturbation sources, timing, credited investigators, and the
/// experimental condition.
///
/// Identified structurally across all four fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Ordered [`PertSource`] keys. Order is display-significant; the set
    /// never holds the same key twice.
    pub sources: KeyList,
    pub time: ExperimentTime,
    /// Ordered [`Investigator`] keys.
    pub investigators: KeyList,
    /// The [`Condition`] under which the experiment ran.
    pub condition: Key,
}

/// A measured value: numeric in current data, free text in legacy imports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeasureValue {
    Number(f64),
    Text(String),
}

impl MeasureValue {
    /// The numeric value, if this is not a legacy textual measurement.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            MeasureValue::Number(v) => Some(*v),
            MeasureValue::Text(_) => None,
        }
    }
}

/// A single measurement: the most numerous entity in the store.
///
/// References an [`Experiment`], a [`Target`], and a [`MeasureProp`];
/// optionally an experiment [`Control`]. Annotation notes, region
/// restrictions, and user-field values ride in side tables keyed by the
/// data point's own key (see [`crate::side`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub experiment: Key,
    pub target: Key,
    /// The [`MeasureProp`] describing how the value was measured.
    pub measurement: Key,
    pub value: MeasureValue,
    pub control: Option<Key>,
    /// Overrides threshold-based significance when set.
    pub force_significant: Option<bool>,
    pub batch: Option<String>,
    pub date: Option<String>,
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// Dictionaries
// ---------------------------------------------------------------------------

/// Sign convention a perturbation type implies for downstream links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkSign {
    Positive,
    Negative,
    Unspecified,
}

/// A kind of perturbation (e.g. morpholino knockdown, mRNA overexpression).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PertType {
    pub name: String,
    pub abbrev: Option<String>,
    pub link_sign: LinkSign,
}

/// A measurement scale (fold change, delta-delta-Ct, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureScale {
    pub name: String,
    /// True when the scale has no meaningful sign (magnitudes only).
    pub unsigned: bool,
}

/// A measurement property: name, the scale values are expressed in, and the
/// significance thresholds used by the derived significant-point view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureProp {
    pub name: String,
    /// The [`MeasureScale`] this property reports in.
    pub scale: Key,
    pub neg_thresh: Option<f64>,
    pub pos_thresh: Option<f64>,
}

impl MeasureProp {
    /// Whether `value` clears this property's significance thresholds.
    /// With no thresholds configured, every value is significant.
    pub fn is_significant(&self, value: f64) -> bool {
        match (self.neg_thresh, self.pos_thresh) {
            (None, None) => true,
            (neg, pos) => {
                neg.map_or(false, |t| value <= t) || pos.map_or(false, |t| value >= t)
            }
        }
    }
}

/// An experimental condition (standard, heat shock, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
}

/// An experiment control a data point can be measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub name: String,
}

/// A footnote: short display tag plus message text. Identified by
/// normalized tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub tag: String,
    pub message: String,
}

/// A user-defined data-point column. Values live in a side table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserField {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn norm_name_folds_case_and_whitespace() {
        assert_eq!(norm_name("  Smith "), "smith");
        assert!(same_name("Smith", "smith"));
        assert!(!same_name("Smith", "Smythe"));
    }

    #[test]
    fn structural_equality_ignores_nothing_but_key() {
        let a = PertSource {
            source_name: Key::from("0"),
            pert_type: Key::from("1"),
            proxy: None,
            annotations: KeyList::new(),
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.annotations.push(Key::from("2"));
        assert_ne!(a, b);
    }

    #[test]
    fn thresholds_gate_significance() {
        let prop = MeasureProp {
            name: "fold".into(),
            scale: Key::from("0"),
            neg_thresh: Some(-1.5),
            pos_thresh: Some(1.5),
        };
        assert!(prop.is_significant(2.0));
        assert!(prop.is_significant(-1.5));
        assert!(!prop.is_significant(0.3));

        let open = MeasureProp {
            name: "raw".into(),
            scale: Key::from("0"),
            neg_thresh: None,
            pos_thresh: None,
        };
        assert!(open.is_significant(0.0));
    }

    #[test]
    fn legacy_text_values_have_no_number() {
        assert_eq!(MeasureValue::Number(1.25).as_number(), Some(1.25));
        assert_eq!(MeasureValue::Text("nd".into()).as_number(), None);
    }
}
