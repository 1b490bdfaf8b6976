//! Safety violation tracking
//!
//! Protocol violations by foreign callers (null handles, wrong argument
//! classes, out-of-range indices) are not recoverable errors for the caller
//! that made them, but they must never turn into undefined behaviour on the
//! host side. They are logged, counted and, with the
//! `panic-on-safety-violation` feature, escalated to a panic.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for safety violations
static SAFETY_VIOLATION_COUNT: AtomicU64 = AtomicU64::new(0);

/// Safety violation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyViolation {
    /// NULL handle where a live instance or descriptor was expected
    NullHandle,
    /// Object header names a class the operation does not accept
    ClassMismatch,
    /// Array index outside `[0, count)`
    IndexOutOfBounds,
    /// Variadic cursor read past the supplied arguments
    ArgumentUnderflow,
    /// Variadic cursor read an argument as the wrong promoted class
    ArgumentClassMismatch,
}

/// Report a safety violation with context
///
/// Logs the violation and increments the global counter.
/// With the `panic-on-safety-violation` feature it panics instead of returning.
pub fn report_violation(violation: SafetyViolation, function: &str, details: &str) {
    let count = SAFETY_VIOLATION_COUNT.fetch_add(1, Ordering::SeqCst);

    log::error!(
        "[SAFETY VIOLATION #{:04}] {:?} in {}: {}",
        count + 1,
        violation,
        function,
        details
    );

    #[cfg(feature = "panic-on-safety-violation")]
    {
        panic!(
            "Safety violation detected: {:?} in {} - {}",
            violation, function, details
        );
    }
}

/// Get total count of safety violations
pub fn violation_count() -> u64 {
    SAFETY_VIOLATION_COUNT.load(Ordering::SeqCst)
}

#[cfg(all(test, not(feature = "panic-on-safety-violation")))]
mod tests {
    use super::*;

    #[test]
    fn test_report_increments_counter() {
        let before = violation_count();
        report_violation(SafetyViolation::NullHandle, "test", "null receiver");
        assert!(violation_count() > before);
    }
}
