//! Opaque entity keys and the per-store key minter.
//!
//! Every record in the store is addressed by a [`Key`]: an opaque,
//! store-minted string identifier. Keys are the only cross-entity linkage
//! mechanism; entities never embed references to each other's structs.
//! A key is never reused within a session, even after the record it named
//! has been deleted.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier for a stored entity.
///
/// Keys are minted by [`KeyMinter`] and draw from a single key space shared
/// by all entity tables, so a key can never name records of two different
/// kinds at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    /// Wraps an externally supplied identifier (used by the IO-load path,
    /// which replays keys produced by an earlier session).
    pub fn new(id: impl Into<String>) -> Self {
        Key(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Key {
    fn from(id: &str) -> Self {
        Key(id.to_string())
    }
}

/// The kinds of entity the store holds. Used for diagnostics and for typing
/// dependency-closure results; never for dynamic dispatch into the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Investigator,
    Target,
    SourceName,
    PertSource,
    Experiment,
    DataPoint,
    PertType,
    MeasureScale,
    MeasureProp,
    Condition,
    Control,
    Annotation,
    UserField,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Investigator => "investigator",
            EntityKind::Target => "target",
            EntityKind::SourceName => "source name",
            EntityKind::PertSource => "perturbation source",
            EntityKind::Experiment => "experiment",
            EntityKind::DataPoint => "data point",
            EntityKind::PertType => "perturbation type",
            EntityKind::MeasureScale => "measurement scale",
            EntityKind::MeasureProp => "measurement property",
            EntityKind::Condition => "experiment condition",
            EntityKind::Control => "experiment control",
            EntityKind::Annotation => "annotation",
            EntityKind::UserField => "user field",
        };
        write!(f, "{}", name)
    }
}

/// Mints fresh keys from a monotonically advancing counter.
///
/// Loaded keys are reported back through [`note_loaded`](Self::note_loaded)
/// so that keys minted after an IO load never collide with keys already
/// present in the loaded data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyMinter {
    next: u64,
}

impl KeyMinter {
    pub fn new() -> Self {
        KeyMinter { next: 0 }
    }

    /// Mints a fresh, never-before-issued key.
    pub fn mint(&mut self) -> Key {
        let key = Key(self.next.to_string());
        self.next += 1;
        key
    }

    /// Advances the counter past an externally loaded key so future mints
    /// cannot collide with it. Non-numeric keys (from foreign tooling) are
    /// already outside the minter's key space and are ignored.
    pub fn note_loaded(&mut self, key: &Key) {
        if let Ok(n) = key.0.parse::<u64>() {
            self.next = self.next.max(n + 1);
        }
    }
}
