//! Execution context shared by long-running operations: first-error-wins
//! reporting and a cooperative cancellation flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    cancelled: AtomicBool,
    error: Mutex<Option<String>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error. Only the first report sticks; later reports are
    /// logged and dropped.
    pub fn report_error(&self, err: impl std::fmt::Display) {
        let mut slot = self.inner.error.lock().expect("context error lock");
        if let Some(existing) = slot.as_ref() {
            tracing::debug!(error = %err, first = %existing, "suppressing secondary error");
            return;
        }
        tracing::warn!(error = %err, "context error");
        *slot = Some(err.to_string());
    }

    pub fn error(&self) -> Option<String> {
        self.inner.error.lock().expect("context error lock").clone()
    }

    pub fn has_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// True once the operation should stop, for any reason.
    pub fn is_stopped(&self) -> bool {
        self.is_cancelled() || self.has_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let cntx = ExecutionContext::new();
        assert!(!cntx.is_stopped());
        cntx.report_error("stream timeout");
        cntx.report_error("broken pipe");
        assert_eq!(cntx.error().as_deref(), Some("stream timeout"));
        assert!(cntx.is_stopped());
    }

    #[test]
    fn cancellation_is_shared() {
        let cntx = ExecutionContext::new();
        let clone = cntx.clone();
        clone.cancel();
        assert!(cntx.is_cancelled());
    }
}
