//! Timer Tracking
//!
//! Every `setTimeout`/`setInterval` a script creates is recorded against its
//! node instance so it can be swept when the artifact that created it is
//! superseded or the node closes. The registry holds no script values, only
//! ids and cancellation handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use flowscript_types::ErrorDetail;

use crate::host::NodeHost;

pub type TimerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Timeout,
    Interval,
}

/// One outstanding timer
#[derive(Debug, Clone)]
struct TimerEntry {
    kind: TimerKind,
    /// Artifact generation that created the timer
    generation: u64,
    cancel: Arc<Notify>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Timer Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Outstanding timers of one node instance
#[derive(Debug)]
pub struct TimerRegistry {
    node_id: String,
    next_id: AtomicU32,
    entries: DashMap<TimerId, TimerEntry>,
}

impl TimerRegistry {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            next_id: AtomicU32::new(1),
            entries: DashMap::new(),
        }
    }

    /// Create a new registry wrapped in an Arc
    pub fn new_shared(node_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(node_id))
    }

    /// Record a new timer, returning its id and the handle its task waits on
    pub fn register(&self, kind: TimerKind, generation: u64) -> (TimerId, Arc<Notify>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(Notify::new());
        self.entries.insert(
            id,
            TimerEntry {
                kind,
                generation,
                cancel: cancel.clone(),
            },
        );
        (id, cancel)
    }

    /// Forget a timer without signalling it
    pub fn remove(&self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Cancel and forget a timer; unknown ids are ignored
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                entry.cancel.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn kind(&self, id: TimerId) -> Option<TimerKind> {
        self.entries.get(&id).map(|e| e.kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of timers created by one artifact generation
    pub fn len_for(&self, generation: u64) -> usize {
        self.entries.iter().filter(|e| e.generation == generation).count()
    }

    /// Cancel every timer created by one artifact generation
    pub fn drain_generation(&self, generation: u64) -> usize {
        let ids: Vec<TimerId> = self
            .entries
            .iter()
            .filter(|e| e.generation == generation)
            .map(|e| *e.key())
            .collect();
        let count = ids.into_iter().filter(|id| self.cancel(*id)).count();
        if count > 0 {
            debug!(node = %self.node_id, generation, "Cancelled {} outstanding timers", count);
        }
        count
    }

    /// Cancel every timer of the node
    pub fn drain_all(&self) -> usize {
        let ids: Vec<TimerId> = self.entries.iter().map(|e| *e.key()).collect();
        let count = ids.into_iter().filter(|id| self.cancel(*id)).count();
        if count > 0 {
            debug!(node = %self.node_id, "Cancelled {} outstanding timers", count);
        }
        count
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Callback Wrappers
// ─────────────────────────────────────────────────────────────────────────────

/// Fire a one-shot timer
///
/// The entry is removed before the callback runs, so a timer that fires
/// normally never lingers in the registry. Returns false without running the
/// callback when the timer was already cancelled.
pub fn fire_once<F>(registry: &TimerRegistry, id: TimerId, host: &dyn NodeHost, callback: F) -> bool
where
    F: FnOnce() -> Result<(), ErrorDetail>,
{
    if !registry.remove(id) {
        return false;
    }
    run_guarded(id, host, callback);
    true
}

/// Fire one tick of an interval, leaving it registered
pub fn fire_guarded<F>(registry: &TimerRegistry, id: TimerId, host: &dyn NodeHost, callback: F) -> bool
where
    F: FnOnce() -> Result<(), ErrorDetail>,
{
    if !registry.contains(id) {
        return false;
    }
    run_guarded(id, host, callback);
    true
}

/// Failure boundary around a timer callback
fn run_guarded<F>(id: TimerId, host: &dyn NodeHost, callback: F)
where
    F: FnOnce() -> Result<(), ErrorDetail>,
{
    if let Err(detail) = callback() {
        report_callback_error(id, host, &detail);
    }
}

/// Report a timer callback failure, including a later async rejection
pub fn report_callback_error(id: TimerId, host: &dyn NodeHost, detail: &ErrorDetail) {
    warn!(node = %host.id(), timer = id, "Timer callback failed: {}", detail);
    host.error(&format!("Error in timer callback: {}", detail));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ContextHandles;
    use flowscript_types::Outputs;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ErrorLog(Mutex<Vec<String>>);

    impl NodeHost for ErrorLog {
        fn id(&self) -> &str {
            "n1"
        }
        fn name(&self) -> &str {
            "timers"
        }
        fn context(&self) -> ContextHandles {
            ContextHandles::in_memory()
        }
        fn send(&self, _outputs: Outputs) {}
        fn log(&self, _message: &str) {}
        fn warn(&self, _message: &str) {}
        fn error(&self, message: &str) {
            self.0.lock().push(message.to_string());
        }
        fn get_setting(&self, _key: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_register_and_cancel() {
        let registry = TimerRegistry::new("n1");
        let (a, _) = registry.register(TimerKind::Timeout, 1);
        let (b, _) = registry.register(TimerKind::Interval, 1);

        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.kind(b), Some(TimerKind::Interval));

        assert!(registry.cancel(a));
        assert!(!registry.cancel(a));
        assert!(!registry.cancel(999));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_signals_waiter() {
        let registry = TimerRegistry::new("n1");
        let (id, cancel) = registry.register(TimerKind::Timeout, 1);

        registry.cancel(id);
        // The permit is stored, so a late waiter still sees the cancellation
        tokio::time::timeout(std::time::Duration::from_millis(100), cancel.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_fire_once_deregisters_before_callback() {
        let registry = TimerRegistry::new("n1");
        let host = ErrorLog::default();
        let (id, _) = registry.register(TimerKind::Timeout, 1);

        let fired = fire_once(&registry, id, &host, || {
            assert!(!registry.contains(id));
            Ok(())
        });

        assert!(fired);
        assert!(registry.is_empty());
        assert!(host.0.lock().is_empty());
    }

    #[test]
    fn test_fire_once_reports_failure() {
        let registry = TimerRegistry::new("n1");
        let host = ErrorLog::default();
        let (id, _) = registry.register(TimerKind::Timeout, 1);

        fire_once(&registry, id, &host, || Err(ErrorDetail::new("boom")));

        assert!(registry.is_empty());
        assert_eq!(*host.0.lock(), vec!["Error in timer callback: boom".to_string()]);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let registry = TimerRegistry::new("n1");
        let host = ErrorLog::default();
        let (id, _) = registry.register(TimerKind::Timeout, 1);
        registry.cancel(id);

        let fired = fire_once(&registry, id, &host, || panic!("must not run"));
        assert!(!fired);
    }

    #[test]
    fn test_interval_stays_registered() {
        let registry = TimerRegistry::new("n1");
        let host = ErrorLog::default();
        let (id, _) = registry.register(TimerKind::Interval, 1);

        assert!(fire_guarded(&registry, id, &host, || Err(ErrorDetail::new("tick failed"))));
        assert!(fire_guarded(&registry, id, &host, || Ok(())));
        assert!(registry.contains(id));
        assert_eq!(host.0.lock().len(), 1);
    }

    #[test]
    fn test_late_rejection_uses_same_report() {
        let host = ErrorLog::default();
        report_callback_error(7, &host, &ErrorDetail::new("async tick"));
        assert_eq!(*host.0.lock(), vec!["Error in timer callback: async tick".to_string()]);
    }

    #[test]
    fn test_drain_generation() {
        let registry = TimerRegistry::new("n1");
        registry.register(TimerKind::Timeout, 1);
        registry.register(TimerKind::Interval, 1);
        registry.register(TimerKind::Timeout, 2);

        assert_eq!(registry.drain_generation(1), 2);
        assert_eq!(registry.len_for(1), 0);
        assert_eq!(registry.len_for(2), 1);

        assert_eq!(registry.drain_all(), 1);
        assert!(registry.is_empty());
    }
}
