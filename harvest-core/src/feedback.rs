//! Component #9: FeedbackController.
//!
//! Observes a bounded sliding window of success/failure signals per domain
//! and periodically decides whether to adjust rate, concurrency, or
//! proxy-rotation cadence. A cooldown after each adjustment prevents
//! oscillation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Success,
    RateLimitError,
    BlockError,
    /// A run of consecutive blocks on one task crossed the block-storm
    /// threshold. Distinct from `BlockError` so a caller can observe that
    /// a storm fired without recounting ordinary block signals.
    BlockStorm,
    OtherError,
}

#[derive(Debug, Clone, Copy)]
pub struct Signal {
    pub kind: SignalKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub window_size: usize,
    pub low_success_rate: f64,
    pub high_success_rate: f64,
    pub min_error_count: usize,
    pub cooldown: StdDuration,
    pub rate_min: f64,
    pub rate_max: f64,
    pub concurrency_min: usize,
    pub proxy_rotate_min: StdDuration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            window_size: 50,
            low_success_rate: 0.5,
            high_success_rate: 0.9,
            min_error_count: 3,
            cooldown: StdDuration::from_secs(60),
            rate_min: 0.1,
            rate_max: 1000.0,
            concurrency_min: 1,
            proxy_rotate_min: StdDuration::from_secs(1),
        }
    }
}

/// An action the FeedbackController decided to take, for logging and for
/// the Coordinator to apply to `RateGate`/worker concurrency/proxy cadence.
#[derive(Debug, Clone, PartialEq)]
pub enum Adjustment {
    HalveRateAndDecrementConcurrency { new_rate: f64, new_concurrency: usize },
    HalveProxyRotateInterval { new_interval: StdDuration },
    IncreaseRate { new_rate: f64 },
}

struct DomainState {
    window: VecDeque<Signal>,
    current_rate: f64,
    current_concurrency: usize,
    current_proxy_rotate_interval: StdDuration,
    last_adjustment_at: Option<DateTime<Utc>>,
}

impl DomainState {
    fn new(initial_rate: f64, initial_concurrency: usize, initial_proxy_rotate: StdDuration) -> Self {
        Self {
            window: VecDeque::new(),
            current_rate: initial_rate,
            current_concurrency: initial_concurrency,
            current_proxy_rotate_interval: initial_proxy_rotate,
            last_adjustment_at: None,
        }
    }
}

pub struct FeedbackController {
    thresholds: Thresholds,
    domains: Mutex<HashMap<String, DomainState>>,
    default_rate: f64,
    default_concurrency: usize,
    default_proxy_rotate: StdDuration,
}

impl FeedbackController {
    pub fn new(
        thresholds: Thresholds,
        default_rate: f64,
        default_concurrency: usize,
        default_proxy_rotate: StdDuration,
    ) -> Self {
        Self {
            thresholds,
            domains: Mutex::new(HashMap::new()),
            default_rate,
            default_concurrency,
            default_proxy_rotate,
        }
    }

    pub fn observe(&self, domain: &str, kind: SignalKind, at: DateTime<Utc>) {
        let mut guard = self.domains.lock().expect("feedback controller poisoned");
        let state = guard.entry(domain.to_owned()).or_insert_with(|| {
            DomainState::new(
                self.default_rate,
                self.default_concurrency,
                self.default_proxy_rotate,
            )
        });
        state.window.push_back(Signal { kind, at });
        while state.window.len() > self.thresholds.window_size {
            state.window.pop_front();
        }
    }

    /// Evaluate policy for `domain` and apply at most one adjustment if the
    /// cooldown has elapsed. Returns `None` if no adjustment was warranted
    /// or the domain is still in cooldown.
    pub fn tick(&self, domain: &str, now: DateTime<Utc>) -> Option<Adjustment> {
        let mut guard = self.domains.lock().expect("feedback controller poisoned");
        let state = guard.get_mut(domain)?;

        if let Some(last) = state.last_adjustment_at {
            let elapsed = (now - last).to_std().unwrap_or(StdDuration::ZERO);
            if elapsed < self.thresholds.cooldown {
                return None;
            }
        }

        if state.window.is_empty() {
            return None;
        }

        let total = state.window.len() as f64;
        let successes = state
            .window
            .iter()
            .filter(|s| s.kind == SignalKind::Success)
            .count() as f64;
        let rate_limit_errors = state
            .window
            .iter()
            .filter(|s| s.kind == SignalKind::RateLimitError)
            .count();
        let block_errors = state
            .window
            .iter()
            .filter(|s| s.kind == SignalKind::BlockError || s.kind == SignalKind::BlockStorm)
            .count();
        let success_rate = successes / total;

        let adjustment = if success_rate < self.thresholds.low_success_rate
            && rate_limit_errors > self.thresholds.min_error_count
        {
            let new_rate = (state.current_rate / 2.0).max(self.thresholds.rate_min);
            let new_concurrency = state
                .current_concurrency
                .saturating_sub(2)
                .max(self.thresholds.concurrency_min);
            state.current_rate = new_rate;
            state.current_concurrency = new_concurrency;
            Some(Adjustment::HalveRateAndDecrementConcurrency {
                new_rate,
                new_concurrency,
            })
        } else if success_rate < self.thresholds.low_success_rate
            && block_errors > self.thresholds.min_error_count
        {
            let new_interval_secs =
                (state.current_proxy_rotate_interval.as_secs_f64() / 2.0).max(1.0);
            let new_interval = StdDuration::from_secs_f64(new_interval_secs);
            state.current_proxy_rotate_interval = new_interval;
            Some(Adjustment::HalveProxyRotateInterval { new_interval })
        } else if success_rate > self.thresholds.high_success_rate {
            let new_rate = (state.current_rate * 1.2).min(self.thresholds.rate_max);
            state.current_rate = new_rate;
            Some(Adjustment::IncreaseRate { new_rate })
        } else {
            None
        };

        if adjustment.is_some() {
            state.last_adjustment_at = Some(now);
        }
        adjustment
    }

    /// Domains currently carrying a signal window, for the periodic tick
    /// loop to iterate without a separate domain registry.
    pub fn domains(&self) -> Vec<String> {
        self.domains
            .lock()
            .expect("feedback controller poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn current_rate(&self, domain: &str) -> Option<f64> {
        self.domains
            .lock()
            .expect("feedback controller poisoned")
            .get(domain)
            .map(|s| s.current_rate)
    }

    /// Count of signals of `kind` currently held in `domain`'s window, for
    /// observability and tests (e.g. proving a `BlockStorm` fired exactly
    /// once for a given streak).
    pub fn signal_count(&self, domain: &str, kind: SignalKind) -> usize {
        self.domains
            .lock()
            .expect("feedback controller poisoned")
            .get(domain)
            .map(|s| s.window.iter().filter(|sig| sig.kind == kind).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(controller: &FeedbackController, domain: &str, kind: SignalKind, n: usize, now: DateTime<Utc>) {
        for _ in 0..n {
            controller.observe(domain, kind, now);
        }
    }

    #[test]
    fn low_success_with_ratelimit_errors_halves_rate_and_concurrency() {
        let controller = FeedbackController::new(Thresholds::default(), 10.0, 8, StdDuration::from_secs(30));
        let now = Utc::now();
        fill(&controller, "d", SignalKind::Success, 5, now);
        fill(&controller, "d", SignalKind::RateLimitError, 10, now);

        let adjustment = controller.tick("d", now).unwrap();
        match adjustment {
            Adjustment::HalveRateAndDecrementConcurrency {
                new_rate,
                new_concurrency,
            } => {
                assert_eq!(new_rate, 5.0);
                assert_eq!(new_concurrency, 6);
            }
            other => panic!("unexpected adjustment: {other:?}"),
        }
    }

    #[test]
    fn low_success_with_block_errors_halves_proxy_rotate_interval() {
        let controller = FeedbackController::new(Thresholds::default(), 10.0, 8, StdDuration::from_secs(30));
        let now = Utc::now();
        fill(&controller, "d", SignalKind::Success, 5, now);
        fill(&controller, "d", SignalKind::BlockError, 10, now);

        let adjustment = controller.tick("d", now).unwrap();
        assert_eq!(
            adjustment,
            Adjustment::HalveProxyRotateInterval {
                new_interval: StdDuration::from_secs(15)
            }
        );
    }

    #[test]
    fn high_success_rate_increases_rate_up_to_cap() {
        let mut thresholds = Thresholds::default();
        thresholds.rate_max = 11.0;
        let controller = FeedbackController::new(thresholds, 10.0, 8, StdDuration::from_secs(30));
        let now = Utc::now();
        fill(&controller, "d", SignalKind::Success, 20, now);

        let adjustment = controller.tick("d", now).unwrap();
        assert_eq!(adjustment, Adjustment::IncreaseRate { new_rate: 11.0 });
    }

    #[test]
    fn cooldown_suppresses_back_to_back_adjustments() {
        let controller = FeedbackController::new(Thresholds::default(), 10.0, 8, StdDuration::from_secs(30));
        let now = Utc::now();
        fill(&controller, "d", SignalKind::Success, 20, now);

        assert!(controller.tick("d", now).is_some());
        assert!(controller.tick("d", now + chrono::Duration::seconds(1)).is_none());

        let later = now + chrono::Duration::seconds(120);
        fill(&controller, "d", SignalKind::Success, 20, later);
        assert!(controller.tick("d", later).is_some());
    }

    #[test]
    fn unknown_domain_ticks_to_none() {
        let controller = FeedbackController::new(Thresholds::default(), 10.0, 8, StdDuration::from_secs(30));
        assert!(controller.tick("ghost", Utc::now()).is_none());
    }
}
