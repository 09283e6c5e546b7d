/// Guard that runs a closure when dropped, unless it was [`cancel`](DeferGuard::cancel)ed.
#[must_use = "the closure runs as soon as the guard is dropped"]
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> DeferGuard<F> {
    /// Disarms the guard, the closure will not run.
    pub fn cancel(mut self) {
        self.0 = None;
    }
}

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers a closure, returning a `DeferGuard` that will run it when dropped.
///
/// The closure also runs when the owning future is dropped mid-way or unwinds.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let ran = Cell::new(false);
        {
            let _guard = defer(|| ran.set(true));
        }
        assert!(ran.get());
    }

    #[test]
    fn test_cancel() {
        let ran = Cell::new(false);
        defer(|| ran.set(true)).cancel();
        assert!(!ran.get());
    }
}
