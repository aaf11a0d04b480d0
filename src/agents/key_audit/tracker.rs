//! Bad principal tracking
//!
//! Principals whose public certificate fetch failed are recorded here so the
//! later phases skip them instead of failing on them again.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Append-only, thread-safe set of principals whose fetch failed.
///
/// Lookups are linear; bad principals are expected to be a small minority.
#[derive(Debug, Default)]
pub struct BadPrincipalTracker {
    bad: Mutex<Vec<String>>,
}

impl BadPrincipalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_bad(&self, principal: &str) {
        let mut bad = self.lock();
        if !bad.iter().any(|p| p == principal) {
            debug!(principal = %principal, "Marking principal as bad");
            bad.push(principal.to_string());
        }
    }

    pub fn is_bad(&self, principal: &str) -> bool {
        self.lock().iter().any(|p| p == principal)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the bad principals in the order they were marked
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().clone()
    }

    // The guarded Vec is append-only, so a panic mid-push cannot leave it torn
    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.bad.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
