//! Named in-process locks guarding cross-kind critical sections.
//!
//! Currently only `"service-controller"` is used: the service-create filter
//! races the service reconciler on the physical service object.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide map from name to a non-reentrant async mutex. Locks are
/// created on first use and never deleted.
#[derive(Default)]
pub struct LockFactory {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock registered under `name`, creating it if needed. Idempotent:
    /// every caller gets the same mutex.
    pub fn get_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
