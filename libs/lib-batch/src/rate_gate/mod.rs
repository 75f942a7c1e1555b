//! Cross-invocation request pacing.
//!
//! A single [`RateWindow`] is shared by every invocation through a
//! [`RateLedger`]. Admission enforces a minimum spacing between calls and a
//! cap on calls inside a sliding window. Each admission reserves its slot
//! under the ledger lock and then waits for it with the lock released, so a
//! waiting invocation never blocks writers sharing the ledger's database.

mod ledger;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

pub use ledger::{MemoryLedger, RateLedger};
pub use sqlite::SqliteLedger;

#[derive(Debug, Clone)]
pub struct RateGateConfig {
    pub min_interval: Duration,
    pub rpm_limit: usize,
    pub window: Duration,
    /// Stored windows older than this are ignored.
    pub ttl: Duration,
    pub lock_timeout: Duration,
    /// Upper bound of the random delay added when the lock can't be taken.
    pub fallback_jitter: Duration,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
            rpm_limit: 45,
            window: Duration::from_secs(60),
            ttl: Duration::from_secs(70),
            lock_timeout: Duration::from_secs(10),
            fallback_jitter: Duration::from_millis(1000),
        }
    }
}

/// Admission history. Timestamps are epoch milliseconds in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub last_call_ms: Option<i64>,
    pub timestamps: Vec<i64>,
}

impl RateWindow {
    fn prune(&mut self, now_ms: i64, window_ms: i64) {
        self.timestamps.retain(|ts| *ts > now_ms - window_ms);
    }

    pub fn calls_in_window(&self, now_ms: i64, window: Duration) -> usize {
        let window_ms = window.as_millis() as i64;
        self.timestamps
            .iter()
            .filter(|ts| **ts > now_ms - window_ms)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredWindow {
    pub window: RateWindow,
    pub expires_at_ms: i64,
}

pub struct RateGate {
    config: RateGateConfig,
    ledger: Arc<dyn RateLedger>,
    clock: SharedClock,
}

impl RateGate {
    pub fn new(mut config: RateGateConfig, ledger: Arc<dyn RateLedger>, clock: SharedClock) -> Self {
        config.rpm_limit = config.rpm_limit.max(1);
        Self {
            config,
            ledger,
            clock,
        }
    }

    pub fn in_memory(config: RateGateConfig, clock: SharedClock) -> Self {
        Self::new(config, Arc::new(MemoryLedger::default()), clock)
    }

    pub fn config(&self) -> &RateGateConfig {
        &self.config
    }

    /// Block until one call may be made. Never fails: if the ledger lock
    /// can't be taken the gate falls back to a fixed jittered delay.
    pub fn acquire(&self) {
        let mut reserved = None;
        let result = self.ledger.transact(self.config.lock_timeout, &mut |slot| {
            reserved = Some(self.reserve(slot));
        });

        match (result, reserved) {
            (Ok(()), Some(at)) => {
                let wait = at - self.clock.now_ms();
                if wait > 0 {
                    self.clock.sleep(Duration::from_millis(wait as u64));
                }
            }
            (Ok(()), None) => {}
            (Err(err), _) => {
                let jitter_ms = self.config.fallback_jitter.as_millis() as u64;
                let delay = self.config.min_interval
                    + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
                tracing::warn!(
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Rate gate unavailable, falling back to fixed delay"
                );
                self.clock.sleep(delay);
            }
        }
    }

    /// Human-readable snapshot, e.g. `calls: 12/45 in 60s`.
    pub fn status(&self) -> String {
        let mut snapshot = None;
        let result = self
            .ledger
            .transact(self.config.lock_timeout, &mut |slot| snapshot = slot.clone());
        if let Err(err) = result {
            return format!("unavailable ({err})");
        }

        let now = self.clock.now_ms();
        let calls = snapshot
            .filter(|stored| stored.expires_at_ms > now)
            .map(|stored| stored.window.calls_in_window(now, self.config.window))
            .unwrap_or(0);
        format!(
            "calls: {}/{} in {}s",
            calls,
            self.config.rpm_limit,
            self.config.window.as_secs()
        )
    }

    /// Pick the earliest admissible time for the next call and record it.
    /// Returns the reserved epoch millis; the caller waits for it unlocked.
    fn reserve(&self, slot: &mut Option<StoredWindow>) -> i64 {
        let min_interval_ms = self.config.min_interval.as_millis() as i64;
        let window_ms = self.config.window.as_millis() as i64;

        let now = self.clock.now_ms();
        let mut window = slot
            .take()
            .filter(|stored| stored.expires_at_ms > now)
            .map(|stored| stored.window)
            .unwrap_or_default();

        let mut at = now;
        if let Some(last) = window.last_call_ms {
            // A last call in the future means clock skew; wait one interval at most.
            at = at.max((last + min_interval_ms).min(now + min_interval_ms));
        }

        window.prune(at, window_ms);
        let limit = self.config.rpm_limit;
        if window.timestamps.len() >= limit {
            // The call at this index has to leave the window before one more fits.
            let blocking = window.timestamps[window.timestamps.len() - limit];
            let earliest = (blocking + window_ms).min(at + window_ms);
            if earliest > at {
                tracing::info!(
                    rpm_limit = limit,
                    wait_ms = earliest - now,
                    "Call limit for the window reached, waiting"
                );
                at = earliest;
            }
        }

        window.prune(at, window_ms);
        window.timestamps.push(at);
        window.last_call_ms = Some(at);
        *slot = Some(StoredWindow {
            window,
            expires_at_ms: at + self.config.ttl.as_millis() as i64,
        });
        at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::LedgerError;

    const T0: i64 = 1_700_000_000_000;

    fn gate_with(config: RateGateConfig) -> (RateGate, Arc<ManualClock>, Arc<MemoryLedger>) {
        let clock = Arc::new(ManualClock::starting_at(T0));
        let ledger = Arc::new(MemoryLedger::default());
        let gate = RateGate::new(config, ledger.clone(), clock.clone());
        (gate, clock, ledger)
    }

    #[test]
    fn test_spacing_and_window_cap_hold() {
        let (gate, clock, _) = gate_with(RateGateConfig::default());

        let mut stamps = Vec::new();
        for _ in 0..120 {
            gate.acquire();
            stamps.push(clock.now_ms());
        }

        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= 1000, "calls too close: {pair:?}");
        }
        for (i, ts) in stamps.iter().enumerate() {
            let in_window = stamps[..=i].iter().filter(|s| **s > ts - 60_000).count();
            assert!(in_window <= 45, "{in_window} calls in window ending at {ts}");
        }
    }

    #[test]
    fn test_waits_for_oldest_to_leave_window() {
        let config = RateGateConfig {
            min_interval: Duration::from_millis(100),
            rpm_limit: 3,
            ..Default::default()
        };
        let (gate, clock, _) = gate_with(config);

        gate.acquire();
        gate.acquire();
        gate.acquire();
        assert_eq!(clock.now_ms(), T0 + 200);

        gate.acquire();
        assert_eq!(clock.now_ms(), T0 + 60_000);
    }

    #[test]
    fn test_first_call_does_not_wait() {
        let (gate, clock, ledger) = gate_with(RateGateConfig::default());
        gate.acquire();

        assert!(clock.sleeps().is_empty());
        let stored = ledger.snapshot().unwrap();
        assert_eq!(stored.window.last_call_ms, Some(T0));
        assert_eq!(stored.expires_at_ms, T0 + 70_000);
    }

    #[test]
    fn test_expired_window_is_ignored() {
        let config = RateGateConfig {
            rpm_limit: 1,
            ..Default::default()
        };
        let (gate, clock, _) = gate_with(config);

        gate.acquire();
        clock.advance(Duration::from_secs(71));
        gate.acquire();

        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_gates_sharing_a_ledger_pace_together() {
        let clock = Arc::new(ManualClock::starting_at(T0));
        let ledger: Arc<dyn RateLedger> = Arc::new(MemoryLedger::default());
        let first = RateGate::new(RateGateConfig::default(), ledger.clone(), clock.clone());
        let second = RateGate::new(RateGateConfig::default(), ledger, clock.clone());

        first.acquire();
        second.acquire();

        assert_eq!(clock.now_ms(), T0 + 1000);
    }

    struct LockedLedger;

    impl RateLedger for LockedLedger {
        fn transact(
            &self,
            timeout: Duration,
            _f: &mut dyn FnMut(&mut Option<StoredWindow>),
        ) -> Result<(), LedgerError> {
            Err(LedgerError::LockTimeout(timeout))
        }
    }

    #[test]
    fn test_lock_timeout_falls_back_to_fixed_delay() {
        let clock = Arc::new(ManualClock::starting_at(T0));
        let gate = RateGate::new(RateGateConfig::default(), Arc::new(LockedLedger), clock.clone());

        gate.acquire();

        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 1);
        assert!(sleeps[0] >= Duration::from_millis(1000));
        assert!(sleeps[0] <= Duration::from_millis(2000));
        assert!(gate.status().starts_with("unavailable"));
    }

    /// Writes to a task store on the ledger's database file whenever the gate
    /// sleeps, recording whether each write got through.
    struct WritingClock {
        inner: ManualClock,
        store: crate::store::SqliteTaskStore,
        writes: std::sync::Mutex<Vec<bool>>,
    }

    impl Clock for WritingClock {
        fn now_ms(&self) -> i64 {
            self.inner.now_ms()
        }

        fn sleep(&self, duration: Duration) {
            use crate::store::TaskStore;
            let ok = self.store.write_scratch("progress", "x").is_ok();
            self.writes.lock().unwrap().push(ok);
            self.inner.sleep(duration);
        }
    }

    #[test]
    fn test_waiting_leaves_shared_database_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.db");

        let ledger = Arc::new(crate::rate_gate::SqliteLedger::open(&path, "gemini").unwrap());
        let conn = crate::store::sqlite::open_connection(&path).unwrap();
        conn.busy_timeout(Duration::from_millis(50)).unwrap();
        let store = crate::store::SqliteTaskStore::from_connection(conn, "job").unwrap();
        let clock = Arc::new(WritingClock {
            inner: ManualClock::starting_at(T0),
            store,
            writes: std::sync::Mutex::new(Vec::new()),
        });
        let gate = RateGate::new(RateGateConfig::default(), ledger, clock.clone());

        gate.acquire();
        gate.acquire();
        gate.acquire();

        assert_eq!(clock.now_ms(), T0 + 2000);
        assert_eq!(*clock.writes.lock().unwrap(), vec![true, true]);
    }

    #[test]
    fn test_status_reports_calls() {
        let (gate, _, _) = gate_with(RateGateConfig::default());
        gate.acquire();
        gate.acquire();
        assert_eq!(gate.status(), "calls: 2/45 in 60s");
    }
}
