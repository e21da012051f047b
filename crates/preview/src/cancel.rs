use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag for one generation attempt. Consulted once,
/// at commit time, before the attempt's result is written back.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    fn fresh() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

/// At most one live token per record id. Starting a new generation for an id
/// cancels the previous token, so the most recently started attempt wins no
/// matter which one finishes first.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    live: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any live token for `id` and install a fresh one.
    pub fn begin(&self, id: &str) -> CancellationToken {
        let mut live = self.live.lock();
        if let Some(prev) = live.get(id) {
            prev.cancel();
        }
        let token = CancellationToken::fresh();
        live.insert(id.to_string(), token.clone());
        token
    }

    /// Retire `token` after its attempt committed or was discarded. Only the
    /// still-live token is removed; a superseded token must not evict its
    /// successor. Idempotent.
    pub fn end(&self, id: &str, token: &CancellationToken) {
        let mut live = self.live.lock();
        if live.get(id).is_some_and(|current| current.same_as(token)) {
            live.remove(id);
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_cancels_predecessor() {
        let registry = CancellationRegistry::new();
        let first = registry.begin("a");
        assert!(!first.is_cancelled());

        let second = registry.begin("a");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_tokens_are_per_id() {
        let registry = CancellationRegistry::new();
        let a = registry.begin("a");
        let _b = registry.begin("b");
        assert!(!a.is_cancelled());
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn test_end_is_idempotent_and_guarded() {
        let registry = CancellationRegistry::new();
        let first = registry.begin("a");
        let second = registry.begin("a");

        // The superseded attempt finishing late must not evict the live token.
        registry.end("a", &first);
        assert_eq!(registry.live_count(), 1);

        registry.end("a", &second);
        assert_eq!(registry.live_count(), 0);
        registry.end("a", &second);
        assert_eq!(registry.live_count(), 0);
    }
}
