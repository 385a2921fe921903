//! Restart policy for crashed workers.
//!
//! The budget is a sliding window: at most [`RestartPolicy::max_restarts`]
//! restarts are granted within any [`RestartPolicy::window`]. Once a crash
//! arrives with the window already full the budget latches as exhausted and
//! further crashes are not restarted until [`RestartBudget::reset`] is called
//! (the supervisor does this on an operator reload).
//!
//! The delay before attempt `n` inside the window is `first × factor^n`,
//! clamped to `max`, with optional equal jitter.

use rand::Rng;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Delay growth between consecutive restarts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first restart.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
    /// Randomize each delay within `[delay/2, delay]`.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// No delay at all; restarts happen on the next monitor tick.
    pub fn immediate() -> Self {
        Self {
            first: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1.0,
            jitter: false,
        }
    }

    /// Computes the delay for the given attempt number (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped)
        };

        if self.jitter && !base.is_zero() {
            let half = base / 2;
            let extra = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(extra)
        } else {
            base
        }
    }
}

/// Restart budget parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RestartPolicy {
    /// Restarts allowed within `window`. Zero disables restarts.
    pub max_restarts: u32,
    /// Sliding window length.
    pub window: Duration,
    /// Delay policy between restarts inside the window.
    pub backoff: BackoffPolicy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Outcome of reporting a crash to the budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after `delay`; `attempt` counts restarts inside the window (1-based)
    Restart { delay: Duration, attempt: u32 },
    /// Budget exhausted, do not respawn
    Exhausted,
}

/// Mutable restart accounting owned by the supervisor control loop
#[derive(Debug)]
pub struct RestartBudget {
    policy: RestartPolicy,
    history: VecDeque<Instant>,
    total: u64,
    exhausted: bool,
}

impl RestartBudget {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            history: VecDeque::new(),
            total: 0,
            exhausted: false,
        }
    }

    /// Record a crash (or failed spawn) at `now` and decide whether to restart
    pub fn on_crash(&mut self, now: Instant) -> RestartDecision {
        if self.exhausted {
            return RestartDecision::Exhausted;
        }

        self.prune(now);

        if self.history.len() >= self.policy.max_restarts as usize {
            self.exhausted = true;
            return RestartDecision::Exhausted;
        }

        let attempt = self.history.len() as u32;
        self.history.push_back(now);
        self.total += 1;

        RestartDecision::Restart {
            delay: self.policy.backoff.next(attempt),
            attempt: attempt + 1,
        }
    }

    /// Clear history and the exhausted latch
    pub fn reset(&mut self) {
        self.history.clear();
        self.exhausted = false;
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Restarts granted since the supervisor started
    pub fn total_restarts(&self) -> u64 {
        self.total
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.history.front() {
            if now.saturating_duration_since(oldest) >= self.policy.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_backoff() -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_growth_clamped() {
        let backoff = fixed_backoff();
        assert_eq!(backoff.next(0), Duration::from_millis(100));
        assert_eq!(backoff.next(1), Duration::from_millis(200));
        assert_eq!(backoff.next(3), Duration::from_millis(800));
        assert_eq!(backoff.next(4), Duration::from_secs(1));
        assert_eq!(backoff.next(40), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = BackoffPolicy {
            jitter: true,
            ..fixed_backoff()
        };
        for attempt in 0..8 {
            let base = fixed_backoff().next(attempt);
            let delay = backoff.next(attempt);
            assert!(delay <= base, "attempt {}: {:?} > {:?}", attempt, delay, base);
            assert!(delay >= base / 2, "attempt {}: {:?} < half", attempt, delay);
        }
    }

    #[test]
    fn test_immediate_backoff_is_zero() {
        let backoff = BackoffPolicy::immediate();
        assert_eq!(backoff.next(0), Duration::ZERO);
        assert_eq!(backoff.next(7), Duration::ZERO);
    }

    #[test]
    fn test_budget_exhausts_and_latches() {
        let mut budget = RestartBudget::new(RestartPolicy {
            max_restarts: 2,
            window: Duration::from_secs(60),
            backoff: fixed_backoff(),
        });
        let now = Instant::now();

        assert_eq!(
            budget.on_crash(now),
            RestartDecision::Restart {
                delay: Duration::from_millis(100),
                attempt: 1
            }
        );
        assert_eq!(
            budget.on_crash(now),
            RestartDecision::Restart {
                delay: Duration::from_millis(200),
                attempt: 2
            }
        );
        assert_eq!(budget.on_crash(now), RestartDecision::Exhausted);
        assert!(budget.is_exhausted());

        // Still exhausted after the window slides; only reset clears it
        let later = now + Duration::from_secs(120);
        assert_eq!(budget.on_crash(later), RestartDecision::Exhausted);
        assert_eq!(budget.total_restarts(), 2);

        budget.reset();
        assert!(!budget.is_exhausted());
        assert!(matches!(budget.on_crash(later), RestartDecision::Restart { attempt: 1, .. }));
    }

    #[test]
    fn test_window_slides() {
        let mut budget = RestartBudget::new(RestartPolicy {
            max_restarts: 2,
            window: Duration::from_secs(10),
            backoff: fixed_backoff(),
        });
        let start = Instant::now();

        assert!(matches!(budget.on_crash(start), RestartDecision::Restart { .. }));
        assert!(matches!(
            budget.on_crash(start + Duration::from_secs(5)),
            RestartDecision::Restart { .. }
        ));
        // The first crash has left the window by now, so one slot is free again
        assert!(matches!(
            budget.on_crash(start + Duration::from_secs(11)),
            RestartDecision::Restart { attempt: 2, .. }
        ));
        assert!(matches!(
            budget.on_crash(start + Duration::from_secs(12)),
            RestartDecision::Exhausted
        ));
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_zero_max_restarts_never_restarts() {
        let mut budget = RestartBudget::new(RestartPolicy {
            max_restarts: 0,
            ..RestartPolicy::default()
        });
        assert_eq!(budget.on_crash(Instant::now()), RestartDecision::Exhausted);
    }
}
