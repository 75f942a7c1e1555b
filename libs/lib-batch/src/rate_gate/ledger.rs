use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::error::LedgerError;

use super::StoredWindow;

/// Exclusive access to the shared rate window.
pub trait RateLedger: Send + Sync {
    /// Run `f` on the stored window while holding the ledger lock, waiting at
    /// most `timeout` for it. Whatever `f` leaves in the slot is persisted.
    fn transact(
        &self,
        timeout: Duration,
        f: &mut dyn FnMut(&mut Option<StoredWindow>),
    ) -> Result<(), LedgerError>;
}

/// Process-local ledger. The window lives only as long as the value.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    released: Condvar,
}

#[derive(Default)]
struct LedgerState {
    held: bool,
    slot: Option<StoredWindow>,
}

impl MemoryLedger {
    pub fn snapshot(&self) -> Option<StoredWindow> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .slot
            .clone()
    }
}

impl RateLedger for MemoryLedger {
    fn transact(
        &self,
        timeout: Duration,
        f: &mut dyn FnMut(&mut Option<StoredWindow>),
    ) -> Result<(), LedgerError> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut guard, _) = self
            .released
            .wait_timeout_while(guard, timeout, |state| state.held)
            .unwrap_or_else(PoisonError::into_inner);
        if guard.held {
            return Err(LedgerError::LockTimeout(timeout));
        }

        // The mutex is released while `f` runs (it may sleep); `held` keeps
        // other callers out.
        guard.held = true;
        let mut slot = guard.slot.take();
        drop(guard);

        f(&mut slot);

        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.slot = slot;
        guard.held = false;
        drop(guard);
        self.released.notify_one();
        Ok(())
    }
}
