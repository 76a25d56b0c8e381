//! Cooperative cancellation for store calls.
//!
//! A `Cancellation` is cloned into blocking store tasks and checked between
//! statements. While a write plan runs, the connection's interrupt handle is
//! registered with the token, so `cancel()` also aborts the statement in
//! flight. A cancelled store transaction is rolled back, never committed.

use crate::repo::error::{RepoError, RepoResult};
use rusqlite::InterruptHandle;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Shared {
    cancelled: AtomicBool,
    next_interrupt: AtomicU64,
    interrupts: Mutex<Vec<(u64, InterruptHandle)>>,
}

impl Shared {
    fn interrupts(&self) -> MutexGuard<'_, Vec<(u64, InterruptHandle)>> {
        self.interrupts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Default)]
pub struct Cancellation {
    shared: Arc<Shared>,
}

impl Debug for Cancellation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals every clone of this token and interrupts running statements.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        for (_, handle) in self.shared.interrupts().iter() {
            handle.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `RepoError::Cancelled` once the token has been signalled.
    pub fn check(&self) -> RepoResult<()> {
        if self.is_cancelled() {
            Err(RepoError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Interrupts `handle`'s connection on `cancel()` until the guard drops.
    ///
    /// Callers must still `check()` before starting each statement: SQLite
    /// ignores an interrupt that arrives while no statement is running.
    pub(crate) fn interrupt_on_cancel(&self, handle: InterruptHandle) -> InterruptGuard<'_> {
        let id = self.shared.next_interrupt.fetch_add(1, Ordering::SeqCst);
        self.shared.interrupts().push((id, handle));
        InterruptGuard { token: self, id }
    }

    #[cfg(test)]
    fn registered_interrupts(&self) -> usize {
        self.shared.interrupts().len()
    }
}

/// Unregisters an interrupt handle on drop.
pub(crate) struct InterruptGuard<'a> {
    token: &'a Cancellation,
    id: u64,
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        self.token
            .shared
            .interrupts()
            .retain(|(id, _)| *id != self.id);
    }
}
