//! Completion handlers of background URL sessions.
//!
//! When the OS relaunches the app to deliver background-session events it
//! hands over a completion handler per session identifier. The handler has
//! to be called once every delegate callback for that session was
//! delivered, on the main context.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use vaultsync_transfer::MainContext;

use crate::guard::CompletionGuard;

pub struct SessionCompletionHandlers {
    main: MainContext,
    pending: Mutex<HashMap<String, CompletionGuard<()>>>,
}

impl SessionCompletionHandlers {
    pub fn new(main: MainContext) -> Self {
        Self {
            main,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Keeps `handler` until the events of `identifier` drain. A handler
    /// already stored for the same identifier is invoked right away, since
    /// the OS will not expect it anymore.
    pub fn store_handler(&self, handler: CompletionGuard<()>) {
        let identifier = handler.identifier().to_string();
        let replaced = self.lock().insert(identifier.clone(), handler);
        debug!(%identifier, "stored background session completion handler");
        if let Some(old) = replaced {
            warn!(%identifier, "replacing pending session completion handler");
            self.invoke(old);
        }
    }

    /// Called once every delegate callback for `identifier` was delivered.
    /// Returns `false` if no handler was pending.
    pub fn events_drained(&self, identifier: &str) -> bool {
        let Some(handler) = self.lock().remove(identifier) else {
            debug!(identifier, "no pending completion handler");
            return false;
        };
        self.invoke(handler);
        true
    }

    pub fn is_pending(&self, identifier: &str) -> bool {
        self.lock().contains_key(identifier)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn invoke(&self, handler: CompletionGuard<()>) {
        let identifier = handler.identifier().to_string();
        // If the main queue is gone the closure is dropped here and the
        // guard still fires from its Drop.
        if !self.main.dispatch(move || handler.complete(())) {
            warn!(%identifier, "main context closed, completing session handler inline");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CompletionGuard<()>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(identifier: &str, count: &Arc<AtomicUsize>) -> CompletionGuard<()> {
        let count = Arc::clone(count);
        CompletionGuard::new(identifier, move |()| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn handler_runs_once_after_events_drain() {
        let (main, _queue) = MainContext::spawn();
        let handlers = SessionCompletionHandlers::new(main.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        handlers.store_handler(counting("bg-session", &calls));
        assert!(handlers.is_pending("bg-session"));
        main.barrier().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(handlers.events_drained("bg-session"));
        assert!(!handlers.events_drained("bg-session"));
        main.barrier().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handlers.pending_count(), 0);
    }

    #[tokio::test]
    async fn replaced_handler_is_completed() {
        let (main, _queue) = MainContext::spawn();
        let handlers = SessionCompletionHandlers::new(main.clone());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        handlers.store_handler(counting("bg-session", &first));
        handlers.store_handler(counting("bg-session", &second));
        main.barrier().await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        handlers.events_drained("bg-session");
        main.barrier().await;
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_runs_on_the_main_queue() {
        let (main, mut queue) = MainContext::channel();
        let handlers = SessionCompletionHandlers::new(main);
        let calls = Arc::new(AtomicUsize::new(0));
        handlers.store_handler(counting("bg-session", &calls));

        handlers.events_drained("bg-session");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.drain_pending(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
