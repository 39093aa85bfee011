//! Core error types for pertdb-core.
//!
//! Uses `thiserror` for structured, matchable error variants. Errors cover
//! only recoverable, caller-facing conditions -- chiefly the IO-load entry
//! points, whose input originates outside this process. Contract violations
//! (a mutator handed a key absent from its table, a stale cascade plan)
//! panic instead: they indicate a bug in the caller, not a data condition.

use crate::key::{EntityKind, Key};
use thiserror::Error;

/// Recoverable errors produced by the pertdb-core crate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An IO-load insertion reused a key that already names a live entity.
    #[error("duplicate key on load: '{key}' already names a {kind}")]
    DuplicateKey { key: Key, kind: EntityKind },

    /// An IO-load side-table row arrived for a data point that was never
    /// loaded.
    #[error("side table row for unknown data point '{key}'")]
    DanglingOwner { key: Key },

    /// A user-field value referenced a field name absent from the store's
    /// user-field dictionary.
    #[error("unknown user field '{key}'")]
    UnknownUserField { key: Key },
}
