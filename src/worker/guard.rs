//! Per-account in-flight tracking.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Set of accounts with a poll task currently running.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    accounts: Arc<Mutex<HashSet<i64>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `account_id`, or `None` if a task already holds it.
    pub fn try_acquire(&self, account_id: i64) -> Option<InFlightGuard> {
        if !lock(&self.accounts).insert(account_id) {
            return None;
        }
        Some(InFlightGuard {
            accounts: Arc::clone(&self.accounts),
            account_id,
        })
    }

    pub fn contains(&self, account_id: i64) -> bool {
        lock(&self.accounts).contains(&account_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.accounts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the account when dropped, including on panic.
#[derive(Debug)]
pub struct InFlightGuard {
    accounts: Arc<Mutex<HashSet<i64>>>,
    account_id: i64,
}

impl InFlightGuard {
    pub fn account_id(&self) -> i64 {
        self.account_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.accounts).remove(&self.account_id);
    }
}

// A panicking poll task must not wedge the set.
fn lock(accounts: &Mutex<HashSet<i64>>) -> MutexGuard<'_, HashSet<i64>> {
    accounts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
