use std::marker::PhantomData;

/// Runs a closure when it goes out of scope, on normal exit, early return and
/// unwinding alike.
///
/// Used for bookkeeping that must be undone no matter how a scope is left, e.g.
/// the "blocked" count of a worker pool around a group wait or the in-flight
/// count of a task around its body.
pub(crate) struct ScopeGuard<'a, F: FnOnce()> {
    // Taken on drop, so the closure runs at most once.
    closure: Option<F>,

    _p: PhantomData<&'a ()>,
}

impl<'a, F: FnOnce()> ScopeGuard<'a, F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
            _p: PhantomData,
        }
    }
}

impl<'a, F: FnOnce()> Drop for ScopeGuard<'a, F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
