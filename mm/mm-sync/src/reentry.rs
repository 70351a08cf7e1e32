use core::cell::Cell;

/// Scoped re-entrancy marker.
///
/// While a [`scoped`](ReentryFlag::scoped) closure runs, [`is_set`](ReentryFlag::is_set)
/// reports `true`. The previous state is restored when the closure returns,
/// so nested scopes behave correctly.
///
/// The guard controller sets this around attribute updates; allocations made
/// while the flag is set are never guarded, which breaks the recursion
/// between guarding and page-table growth.
#[derive(Default)]
pub struct ReentryFlag(Cell<bool>);

impl ReentryFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self(Cell::new(false))
    }

    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.get()
    }

    /// Run `f` with the flag set, restoring the previous state afterwards.
    #[inline]
    pub fn scoped<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = self.0.replace(true);
        let result = f();
        self.0.set(previous);
        result
    }
}
