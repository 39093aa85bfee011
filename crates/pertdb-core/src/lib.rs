//! pertdb-core: the in-memory perturbation-experiment entity store.
//!
//! A single [`PerturbStore`](store::PerturbStore) owns every entity table,
//! keyed by opaque string [`Key`](key::Key)s. All mutation flows through
//! the store's `provide_*` / `set_*` / `delete_*` families, each of which
//! returns a [`Change`](change::Change) record driving the undo/redo
//! engine. Reference-closure analysis and cascade execution live in the
//! companion `pertdb-refs` crate, layered on this crate's public API.

pub mod cache;
pub mod change;
pub mod error;
pub mod key;
pub mod model;
pub mod side;
pub mod store;

// Re-export commonly used types
pub use change::{Change, DataPointSnapshot, Delta};
pub use error::StoreError;
pub use key::{EntityKind, Key, KeyMinter};
pub use model::{
    Annotation, Condition, Control, DataPoint, Experiment, ExperimentTime, Investigator, KeyList,
    LinkSign, MeasureProp, MeasureScale, MeasureValue, PertSource, PertType, Proxy, ProxySign,
    SourceName, Target, UserField,
};
pub use side::{RegionRestriction, SideTable};
pub use store::{PerturbStore, Provided, ProvideOutcome};
