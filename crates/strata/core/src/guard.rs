use crate::error::VaultError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Explicit "operation in progress" flags keyed by resource.
///
/// Entering a key that is already held fails with
/// [`VaultError::OperationInProgress`]. The returned token clears the flag on
/// drop, so every exit path (including `?` early returns) releases it.
#[derive(Debug, Clone, Default)]
pub struct ReentrancyGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, key: impl Into<String>) -> Result<GuardToken, VaultError> {
        let key = key.into();
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| VaultError::LockPoisoned("reentrancy guard"))?;
        if !in_flight.insert(key.clone()) {
            return Err(VaultError::OperationInProgress { key });
        }
        Ok(GuardToken {
            key,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .map(|in_flight| in_flight.contains(key))
            .unwrap_or(true)
    }
}

#[derive(Debug)]
pub struct GuardToken {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.remove(&self.key);
    }
}
