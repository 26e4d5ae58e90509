//! Component #4: RateGate.
//!
//! A per-domain token bucket with lazy refill: tokens accrue only when
//! observed (on `acquire`), never via a background timer. Rate and
//! capacity are adjustable at runtime by the FeedbackController, which
//! `governor`'s construction-time quota cannot express - the reason this
//! substrate hand-rolls the bucket instead of depending on `governor`.

use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use dashmap::DashMap;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ok,
    TimedOut,
    Canceled,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to take one token; returns the wait needed if unavailable.
    fn try_take(&mut self, now: Instant) -> Result<(), StdDuration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let wait_secs = if self.rate_per_sec > 0.0 {
                deficit / self.rate_per_sec
            } else {
                f64::INFINITY
            };
            Err(StdDuration::from_secs_f64(wait_secs))
        }
    }
}

struct ConcurrencyState {
    in_flight: usize,
    limit: usize,
}

/// Released automatically on drop, returning the domain's in-flight slot
/// the way a `Semaphore` permit releases on drop - except resizable per
/// domain at runtime, which `tokio::sync::Semaphore` cannot do.
pub struct ConcurrencyPermit {
    gate: Arc<RateGate>,
    domain: String,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.gate.release_concurrency(&self.domain);
    }
}

/// Per-domain adaptive rate limiter.
pub struct RateGate {
    buckets: DashMap<String, Mutex<Bucket>>,
    concurrency: DashMap<String, Mutex<ConcurrencyState>>,
    default_rate: f64,
    default_capacity: f64,
    default_concurrency: usize,
}

impl RateGate {
    pub fn new(default_rate_per_sec: f64, default_capacity: f64, default_concurrency: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            concurrency: DashMap::new(),
            default_rate: default_rate_per_sec,
            default_capacity,
            default_concurrency,
        }
    }

    fn bucket_for(&self, domain: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<Bucket>> {
        self.buckets
            .entry(domain.to_owned())
            .or_insert_with(|| Mutex::new(Bucket::new(self.default_rate, self.default_capacity)));
        self.buckets.get(domain).expect("just inserted")
    }

    /// Block (cooperatively, respecting `cancel`) until a token for
    /// `domain` is available, `timeout` elapses, or `cancel` fires.
    pub async fn acquire(
        &self,
        domain: &str,
        timeout: StdDuration,
        cancel: &CancellationToken,
    ) -> AcquireOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            let wait = {
                let entry = self.bucket_for(domain);
                let mut bucket = entry.lock().expect("rate bucket poisoned");
                match bucket.try_take(Instant::now()) {
                    Ok(()) => return AcquireOutcome::Ok,
                    Err(wait) => wait,
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return AcquireOutcome::TimedOut;
            }
            let remaining = deadline - now;
            let sleep_for = wait.min(remaining);

            tokio::select! {
                _ = sleep(sleep_for) => {
                    if Instant::now() >= deadline {
                        return AcquireOutcome::TimedOut;
                    }
                    // loop again and re-check the bucket
                }
                _ = cancel.cancelled() => return AcquireOutcome::Canceled,
            }
        }
    }

    /// Adjust the rate and/or capacity for `domain` at runtime; current
    /// token count is preserved (clamped to the new capacity).
    pub fn update(&self, domain: &str, rate_per_sec: f64, capacity: f64) {
        let entry = self.bucket_for(domain);
        let mut bucket = entry.lock().expect("rate bucket poisoned");
        bucket.refill(Instant::now());
        bucket.rate_per_sec = rate_per_sec;
        bucket.capacity = capacity;
        bucket.tokens = bucket.tokens.min(capacity);
    }

    pub fn current_rate(&self, domain: &str) -> Option<f64> {
        self.buckets
            .get(domain)
            .map(|b| b.lock().expect("rate bucket poisoned").rate_per_sec)
    }

    fn concurrency_for(&self, domain: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<ConcurrencyState>> {
        self.concurrency.entry(domain.to_owned()).or_insert_with(|| {
            Mutex::new(ConcurrencyState {
                in_flight: 0,
                limit: self.default_concurrency,
            })
        });
        self.concurrency.get(domain).expect("just inserted")
    }

    /// Adjust the concurrency limit for `domain` at runtime. Permits
    /// already in flight are unaffected; the new limit takes effect for
    /// subsequent `acquire_concurrency` calls.
    pub fn set_concurrency_limit(&self, domain: &str, limit: usize) {
        let entry = self.concurrency_for(domain);
        entry.lock().expect("concurrency state poisoned").limit = limit;
    }

    pub fn concurrency_limit(&self, domain: &str) -> usize {
        self.concurrency
            .get(domain)
            .map(|s| s.lock().expect("concurrency state poisoned").limit)
            .unwrap_or(self.default_concurrency)
    }

    fn release_concurrency(&self, domain: &str) {
        if let Some(state) = self.concurrency.get(domain) {
            let mut state = state.lock().expect("concurrency state poisoned");
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }

    /// Block (cooperatively, respecting `cancel`) until an in-flight slot
    /// for `domain` is available, `timeout` elapses, or `cancel` fires.
    /// Returns a guard that releases the slot on drop.
    pub async fn acquire_concurrency(
        self: &Arc<Self>,
        domain: &str,
        timeout: StdDuration,
        cancel: &CancellationToken,
    ) -> Result<ConcurrencyPermit, AcquireOutcome> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let entry = self.concurrency_for(domain);
                let mut state = entry.lock().expect("concurrency state poisoned");
                if state.in_flight < state.limit {
                    state.in_flight += 1;
                    return Ok(ConcurrencyPermit {
                        gate: self.clone(),
                        domain: domain.to_owned(),
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AcquireOutcome::TimedOut);
            }
            let remaining = deadline - now;
            let poll_interval = StdDuration::from_millis(10).min(remaining);

            tokio::select! {
                _ = sleep(poll_interval) => {
                    if Instant::now() >= deadline {
                        return Err(AcquireOutcome::TimedOut);
                    }
                }
                _ = cancel.cancelled() => return Err(AcquireOutcome::Canceled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_succeeds_immediately_when_capacity_available() {
        let gate = RateGate::new(10.0, 5.0, 4);
        let cancel = CancellationToken::new();
        let outcome = gate
            .acquire("example.com", StdDuration::from_millis(100), &cancel)
            .await;
        assert_eq!(outcome, AcquireOutcome::Ok);
    }

    #[tokio::test]
    async fn acquire_exhausts_capacity_then_waits() {
        let gate = RateGate::new(1000.0, 1.0, 4);
        let cancel = CancellationToken::new();
        let first = gate
            .acquire("example.com", StdDuration::from_millis(50), &cancel)
            .await;
        assert_eq!(first, AcquireOutcome::Ok);

        // Capacity is 1, refill is fast (1000/s) so the second acquire
        // should still succeed well within the timeout.
        let second = gate
            .acquire("example.com", StdDuration::from_millis(50), &cancel)
            .await;
        assert_eq!(second, AcquireOutcome::Ok);
    }

    #[tokio::test]
    async fn acquire_times_out_when_rate_is_zero_capacity_exhausted() {
        let gate = RateGate::new(0.0, 1.0, 4);
        let cancel = CancellationToken::new();
        let first = gate
            .acquire("example.com", StdDuration::from_millis(10), &cancel)
            .await;
        assert_eq!(first, AcquireOutcome::Ok);

        let second = gate
            .acquire("example.com", StdDuration::from_millis(20), &cancel)
            .await;
        assert_eq!(second, AcquireOutcome::TimedOut);
    }

    #[tokio::test]
    async fn acquire_is_canceled_by_token() {
        let gate = RateGate::new(0.0, 1.0, 4);
        let cancel = CancellationToken::new();
        let _ = gate
            .acquire("example.com", StdDuration::from_millis(10), &cancel)
            .await;

        cancel.cancel();
        let outcome = gate
            .acquire("example.com", StdDuration::from_secs(5), &cancel)
            .await;
        assert_eq!(outcome, AcquireOutcome::Canceled);
    }

    #[tokio::test]
    async fn update_changes_rate_and_clamps_tokens_to_new_capacity() {
        let gate = RateGate::new(1.0, 10.0, 4);
        gate.update("example.com", 2.0, 3.0);
        assert_eq!(gate.current_rate("example.com"), Some(2.0));
    }

    #[tokio::test]
    async fn acquire_concurrency_blocks_until_a_permit_is_released() {
        let gate = Arc::new(RateGate::new(1000.0, 1000.0, 1));
        let cancel = CancellationToken::new();

        let first = gate
            .acquire_concurrency("example.com", StdDuration::from_millis(50), &cancel)
            .await
            .unwrap();

        let second = gate
            .acquire_concurrency("example.com", StdDuration::from_millis(20), &cancel)
            .await;
        assert_eq!(second.unwrap_err(), AcquireOutcome::TimedOut);

        drop(first);
        let third = gate
            .acquire_concurrency("example.com", StdDuration::from_millis(50), &cancel)
            .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn set_concurrency_limit_changes_future_acquires() {
        let gate = Arc::new(RateGate::new(1000.0, 1000.0, 1));
        let cancel = CancellationToken::new();

        let first = gate
            .acquire_concurrency("example.com", StdDuration::from_millis(50), &cancel)
            .await
            .unwrap();

        gate.set_concurrency_limit("example.com", 2);
        let second = gate
            .acquire_concurrency("example.com", StdDuration::from_millis(50), &cancel)
            .await;
        assert!(second.is_ok());
        drop(first);
    }
}
