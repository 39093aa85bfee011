//! pertdb-refs: reference analysis over the pertdb entity store.
//!
//! Layered on `pertdb-core`'s public API, this crate answers "who still
//! references this record?" ahead of destructive operations, and then
//! executes the answer:
//!
//! - [`closure`] computes typed dependency closures over the fixed entity
//!   schema (`*_reference_set`, `*_prune_set`, `*_merge_set`), each a
//!   point-in-time [`Dependencies`] plan.
//! - [`cascade`] drives the store through a plan ([`cascade::destroy`] /
//!   [`cascade::merge`]), downstream holders first, collecting one change
//!   record per mutation for the caller's undo grouping.
//! - [`counts`] answers the bulk usage-count queries shown in dictionary
//!   editors.
//!
//! Inspecting a plan without executing it is the supported way to preview
//! (and decline) a destructive operation.

pub mod cascade;
pub mod closure;
pub mod counts;

pub use closure::{Dependencies, FieldTag, HolderSets, Operation};
