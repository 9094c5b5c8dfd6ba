//! Generalizes the Go original's `*testing.T` thread-through: every
//! component that can fail a test holds a `Arc<dyn Reporter>` instead of a
//! concrete test-framework handle. "First reported failure wins"
//! is a property of the implementation, not of this trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub trait Reporter: Send + Sync {
    /// Record a failure against the running test. Safe to call from any
    /// task, any number of times; idempotent in the sense that only the
    /// first message need be surfaced to the user.
    fn error(&self, msg: &str);

    /// Record a failure and abort the test immediately. Implementations
    /// that cannot unwind the calling stack (e.g. a background task) should
    /// still call `error` and rely on the session to observe `failed()`.
    fn fail_now(&self, msg: &str);

    /// Whether `error` or `fail_now` has been called at least once.
    fn failed(&self) -> bool;
}

/// Default reporter: logs through `tracing` and panics on `fail_now`, so a
/// panic inside a `#[tokio::test]` fails the enclosing test the same way a
/// Go `t.Fatalf` would.
#[derive(Default)]
pub struct PanicReporter {
    failed: AtomicBool,
}

impl Reporter for PanicReporter {
    fn error(&self, msg: &str) {
        self.failed.store(true, Ordering::SeqCst);
        tracing::error!(target: "pgsnap", "{msg}");
    }

    fn fail_now(&self, msg: &str) {
        self.failed.store(true, Ordering::SeqCst);
        panic!("{msg}");
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Records messages instead of panicking or printing, so the harness's own
/// test suite can assert on what *would* have been reported without
/// nesting a real test failure inside a test assertion (needed for the
/// timeout and mismatch-injection behaviors below).
#[derive(Default)]
pub struct CollectingReporter {
    first_error: Mutex<Option<String>>,
    errors: Mutex<Vec<String>>,
    failed_now: AtomicBool,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn first_message(&self) -> Option<String> {
        self.first_error.lock().expect("reporter lock").clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.lock().expect("reporter lock").clone()
    }

    pub fn fail_now_called(&self) -> bool {
        self.failed_now.load(Ordering::SeqCst)
    }
}

impl Reporter for CollectingReporter {
    fn error(&self, msg: &str) {
        let mut first = self.first_error.lock().expect("reporter lock");
        if first.is_none() {
            *first = Some(msg.to_string());
        }
        self.errors.lock().expect("reporter lock").push(msg.to_string());
    }

    fn fail_now(&self, msg: &str) {
        self.failed_now.store(true, Ordering::SeqCst);
        self.error(msg);
    }

    fn failed(&self) -> bool {
        self.first_error.lock().expect("reporter lock").is_some() || self.fail_now_called()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_reporter_keeps_first_message_only() {
        let r = CollectingReporter::new();
        r.error("first");
        r.error("second");
        assert_eq!(r.first_message(), Some("first".to_string()));
        assert_eq!(r.messages(), vec!["first".to_string(), "second".to_string()]);
        assert!(r.failed());
    }

    #[test]
    fn collecting_reporter_fail_now_sets_flag_and_is_idempotent() {
        let r = CollectingReporter::new();
        assert!(!r.fail_now_called());
        r.fail_now("boom");
        r.fail_now("boom again");
        assert!(r.fail_now_called());
        assert_eq!(r.first_message(), Some("boom".to_string()));
    }
}
