//! Per-invocation execution window.
//!
//! Before each task the runner asks whether the mean observed task duration,
//! scaled by a safety margin, still fits in what is left of the window.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub max_window: Duration,
    pub safety_margin: f64,
    /// Time that must remain before the first task, when nothing is known yet.
    pub first_task_reserve: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_window: Duration::from_secs(28 * 60),
            safety_margin: 1.5,
            first_task_reserve: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub elapsed_ms: i64,
    pub remaining_ms: i64,
    pub required_ms: f64,
    pub proceed: bool,
}

#[derive(Debug, Clone)]
pub struct Budget {
    config: BudgetConfig,
    started_ms: i64,
    durations_ms: Vec<i64>,
}

impl Budget {
    pub fn start(config: BudgetConfig, now_ms: i64) -> Self {
        Self {
            config,
            started_ms: now_ms,
            durations_ms: Vec::new(),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn elapsed_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.started_ms
    }

    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.config.max_window.as_millis() as i64 - self.elapsed_ms(now_ms)
    }

    pub fn mean_duration_ms(&self) -> Option<f64> {
        if self.durations_ms.is_empty() {
            return None;
        }
        let total: i64 = self.durations_ms.iter().sum();
        Some(total as f64 / self.durations_ms.len() as f64)
    }

    pub fn record(&mut self, duration_ms: i64) {
        self.durations_ms.push(duration_ms.max(0));
    }

    pub fn samples(&self) -> &[i64] {
        &self.durations_ms
    }

    /// Whether one more unit of work fits, using `margin` instead of the
    /// configured safety margin. Margins below 1.0 are treated as 1.0.
    pub fn assess(&self, now_ms: i64, margin: f64) -> Assessment {
        let elapsed_ms = self.elapsed_ms(now_ms);
        let remaining_ms = self.remaining_ms(now_ms);
        match self.mean_duration_ms() {
            None => {
                let reserve = self.config.first_task_reserve.as_millis() as i64;
                Assessment {
                    elapsed_ms,
                    remaining_ms,
                    required_ms: reserve as f64,
                    proceed: remaining_ms > reserve,
                }
            }
            Some(mean) => {
                let required_ms = mean * margin.max(1.0);
                Assessment {
                    elapsed_ms,
                    remaining_ms,
                    required_ms,
                    proceed: remaining_ms as f64 >= required_ms,
                }
            }
        }
    }

    pub fn can_start(&self, now_ms: i64) -> bool {
        self.assess(now_ms, self.config.safety_margin).proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 10_000;

    fn budget(window_ms: u64, margin: f64, reserve_ms: u64) -> Budget {
        Budget::start(
            BudgetConfig {
                max_window: Duration::from_millis(window_ms),
                safety_margin: margin,
                first_task_reserve: Duration::from_millis(reserve_ms),
            },
            T0,
        )
    }

    #[test]
    fn test_refuses_when_mean_does_not_fit() {
        let mut b = budget(1000, 1.5, 0);
        b.record(400);

        assert!(!b.can_start(T0 + 500));
        assert!(b.can_start(T0 + 400));
        let a = b.assess(T0 + 500, 1.5);
        assert_eq!(a.remaining_ms, 500);
        assert_eq!(a.required_ms, 600.0);
    }

    #[test]
    fn test_first_task_needs_reserve() {
        let b = Budget::start(BudgetConfig::default(), T0);
        assert!(b.can_start(T0));
        // 23 minutes in, exactly 5 minutes are left: not strictly more.
        assert!(!b.can_start(T0 + 23 * 60 * 1000));
        assert!(b.can_start(T0 + 23 * 60 * 1000 - 1));
    }

    #[test]
    fn test_mean_over_samples() {
        let mut b = budget(10_000, 2.0, 0);
        b.record(100);
        b.record(300);
        assert_eq!(b.mean_duration_ms(), Some(200.0));
        assert_eq!(b.assess(T0, 2.0).required_ms, 400.0);
        // Margins below one never shrink the requirement.
        assert_eq!(b.assess(T0, 0.5).required_ms, 200.0);
    }

    #[test]
    fn test_negative_durations_clamp_to_zero() {
        let mut b = budget(1000, 1.5, 0);
        b.record(-50);
        assert_eq!(b.samples(), &[0]);
    }
}
