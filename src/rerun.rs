/// Force-rerun scope
///
/// While a scope is open every operation and stage lookup misses, so bodies
/// run again. Results are still written, so closing the scope resumes normal
/// caching against the refreshed entries. Nested scopes collapse into one:
/// the override stays on until every open scope has been dropped, in
/// whatever order they go.
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct RerunOverride {
    depth: AtomicUsize,
}

impl RerunOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    /// Open a scope. The override ends when the last open scope drops.
    pub fn enter(&self) -> RerunScope<'_> {
        let owner = self.depth.fetch_add(1, Ordering::SeqCst) == 0;
        RerunScope { flag: self, owner }
    }

    /// Run `f` with the override active
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let _scope = self.enter();
        f()
    }
}

/// Guard returned by [`RerunOverride::enter`]
#[must_use = "the override ends when the scope is dropped"]
pub struct RerunScope<'a> {
    flag: &'a RerunOverride,
    owner: bool,
}

impl RerunScope<'_> {
    /// Whether this guard turned the override on
    pub fn is_outermost(&self) -> bool {
        self.owner
    }
}

impl Drop for RerunScope<'_> {
    fn drop(&mut self) {
        self.flag.depth.fetch_sub(1, Ordering::SeqCst);
    }
}
