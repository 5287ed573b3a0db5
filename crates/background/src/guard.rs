//! Single-use completion handlers.

use std::fmt;

use tracing::warn;

/// Wraps an OS-provided completion handler so it runs exactly once.
///
/// [`complete`](Self::complete) consumes the guard, so a second call does
/// not compile. A guard dropped without completing invokes the handler with
/// `A::default()` (`false` for task completions) and logs a warning.
pub struct CompletionGuard<A: Default + 'static = bool> {
    identifier: String,
    handler: Option<Box<dyn FnOnce(A) + Send>>,
}

impl<A: Default + 'static> CompletionGuard<A> {
    pub fn new(identifier: impl Into<String>, handler: impl FnOnce(A) + Send + 'static) -> Self {
        Self {
            identifier: identifier.into(),
            handler: Some(Box::new(handler)),
        }
    }

    /// Identifier of the OS task or background session this guard belongs to.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn complete(mut self, value: A) {
        if let Some(handler) = self.handler.take() {
            handler(value);
        }
    }
}

impl<A: Default + 'static> Drop for CompletionGuard<A> {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            warn!(identifier = %self.identifier, "completion guard dropped without completing");
            handler(A::default());
        }
    }
}

impl<A: Default + 'static> fmt::Debug for CompletionGuard<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionGuard")
            .field("identifier", &self.identifier)
            .field("pending", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<bool>>>, CompletionGuard) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let guard = CompletionGuard::new("refresh", move |ok| sink.lock().unwrap().push(ok));
        (calls, guard)
    }

    #[test]
    fn complete_invokes_once() {
        let (calls, guard) = recorder();
        guard.complete(true);
        assert_eq!(*calls.lock().unwrap(), vec![true]);
    }

    #[test]
    fn dropped_guard_reports_failure() {
        let (calls, guard) = recorder();
        assert_eq!(guard.identifier(), "refresh");
        drop(guard);
        assert_eq!(*calls.lock().unwrap(), vec![false]);
    }
}
