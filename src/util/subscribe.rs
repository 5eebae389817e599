/// Disposer returned by callback registrations; calling it detaches the callback.
pub type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;

/// RAII guard around a cleanup closure.
///
/// The closure runs exactly once, either through [`Disposer::dispose`] or when the
/// guard is dropped.
pub struct Disposer {
    cleanup: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Disposer {
    pub fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    pub fn dispose(mut self) {
        self.run();
    }

    /// Converts the guard into a plain [`Unsubscribe`] closure.
    pub fn into_unsubscribe(mut self) -> Unsubscribe {
        match self.cleanup.take() {
            Some(cleanup) => cleanup,
            None => Box::new(|| {}),
        }
    }

    fn run(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("armed", &self.cleanup.is_some())
            .finish()
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn cleanup_runs_once_on_dispose_or_drop() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        Disposer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = calls.clone();
        {
            let _guard = Disposer::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn into_unsubscribe_defers_cleanup_to_the_caller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let unsubscribe = Disposer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .into_unsubscribe();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
