//! HTTP plumbing shared by every metadata backend
//!
//! [`fetch::RetryingFetcher`] performs one logical request against a single
//! URL under a wall-clock [`fetch::RetryBudget`]. [`race::AddressRacer`] runs
//! several candidates concurrently with staggered starts and keeps whichever
//! answers first.

pub mod fetch;
pub mod race;

pub use fetch::{FetchRequest, FetchResponse, RetryBudget, RetryingFetcher, SleepSchedule};
pub use race::{AddressRacer, RaceWinner, wait_for_url};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation signal checked between retry attempts
///
/// Cancelling never interrupts an HTTP call that is already in flight; the
/// holder notices at its next checkpoint and stops.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
