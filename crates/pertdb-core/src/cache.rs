//! Serial-number-gated derived views.
//!
//! The store's serial number advances by exactly one per recorded change and
//! is the sole cache-invalidation signal. [`Stale`] packages the
//! compute-if-stale pattern once, so every derived view (the significant
//! data-point set, the name-inversion maps) performs the same comparison
//! instead of each call site hand-rolling it.

use std::fmt;

/// A lazily built value tagged with the store serial it was built against.
///
/// The value is served only while the observed serial equals the build
/// serial; any drift forces a rebuild on next access.
#[derive(Clone, Default)]
pub struct Stale<T> {
    built: Option<(u64, T)>,
}

impl<T> Stale<T> {
    pub fn new() -> Self {
        Stale { built: None }
    }

    /// True when a value built against `serial` is available.
    pub fn is_fresh(&self, serial: u64) -> bool {
        matches!(&self.built, Some((s, _)) if *s == serial)
    }

    /// Stores a freshly computed value built against `serial`.
    pub fn put(&mut self, serial: u64, value: T) {
        self.built = Some((serial, value));
    }

    /// The cached value regardless of freshness; callers check
    /// [`is_fresh`](Self::is_fresh) first.
    pub fn get(&self) -> Option<&T> {
        self.built.as_ref().map(|(_, v)| v)
    }

    /// Drops the cached value outright. Undo/redo use this rather than
    /// trusting serial comparison across a serial reset.
    pub fn invalidate(&mut self) {
        self.built = None;
    }
}

impl<T> fmt::Debug for Stale<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.built {
            Some((serial, _)) => write!(f, "Stale {{ built_at: {} }}", serial),
            None => write!(f, "Stale {{ empty }}"),
        }
    }
}
