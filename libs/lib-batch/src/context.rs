use std::sync::Arc;
use std::time::Duration;

use crate::budget::BudgetConfig;
use crate::caller::ResilientCaller;
use crate::clock::SharedClock;
use crate::store::TaskStore;

/// Added to the invocation window to get the default claim lease. A live run
/// never holds a task past its window, so only a crashed run's claims lapse,
/// and they lapse before the next scheduled invocation.
pub const CLAIM_LEASE_MARGIN: Duration = Duration::from_secs(60);

/// Everything one invocation needs, passed explicitly instead of living in
/// globals.
#[derive(Clone)]
pub struct RunContext {
    pub job: String,
    pub store: Arc<dyn TaskStore>,
    pub caller: Arc<ResilientCaller>,
    pub clock: SharedClock,
    pub budget: BudgetConfig,
    pub claim_lease: Duration,
}

impl RunContext {
    pub fn new(
        job: impl Into<String>,
        store: Arc<dyn TaskStore>,
        caller: Arc<ResilientCaller>,
        clock: SharedClock,
        budget: BudgetConfig,
    ) -> Self {
        Self {
            job: job.into(),
            store,
            caller,
            clock,
            claim_lease: budget.max_window + CLAIM_LEASE_MARGIN,
            budget,
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }
}
