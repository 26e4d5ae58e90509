//! Component #3: ProxyPool.
//!
//! Weighted-random proxy selection per domain, backed by exponentially
//! decayed success/failure counters (so old outcomes fade rather than
//! being purged). A proxy is removed from selection while banned; if
//! every proxy for a domain is banned, the soonest-to-unban proxy is
//! returned instead of failing the caller outright.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use harvest_common::model::ProxyDomainStats;
use rand::distributions::{Distribution, WeightedIndex};
use rand::thread_rng;
use thiserror::Error;

/// Half-life of the exponential decay applied to rolling counters.
const DECAY_HALF_LIFE: StdDuration = StdDuration::from_secs(3600);

#[derive(Error, Debug)]
pub enum ProxyPoolError {
    #[error("no proxies configured for domain {0}")]
    NoProxiesForDomain(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProxyOutcome {
    Success,
    Failure,
}

/// What the pool returns for a selection: which proxy, and whether it
/// was chosen healthy or as a last-resort soonest-available pick.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySelection {
    pub proxy: String,
    pub all_banned: bool,
}

fn decay_factor(elapsed: StdDuration) -> f64 {
    let half_lives = elapsed.as_secs_f64() / DECAY_HALF_LIFE.as_secs_f64();
    0.5f64.powf(half_lives)
}

fn decayed(stats: &ProxyDomainStats, now: DateTime<Utc>) -> ProxyDomainStats {
    let Some(last) = stats.last_used_at else {
        return stats.clone();
    };
    let elapsed = (now - last).to_std().unwrap_or(StdDuration::ZERO);
    let factor = decay_factor(elapsed);
    ProxyDomainStats {
        success_count: stats.success_count * factor,
        fail_count: stats.fail_count * factor,
        total_rtt_ms: stats.total_rtt_ms * factor,
        last_used_at: stats.last_used_at,
        banned_until: stats.banned_until,
    }
}

/// Per-domain, per-proxy rolling health and weighted selection.
pub struct ProxyPool {
    /// domain -> proxy -> stats
    stats: DashMap<String, DashMap<String, ProxyDomainStats>>,
    /// domain -> configured proxy list, in a stable order for weighting.
    members: DashMap<String, Vec<String>>,
    /// domain -> how long a selection stays sticky before re-weighting.
    /// Zero (the default) disables stickiness: every `select` re-weights.
    rotate_interval: DashMap<String, StdDuration>,
    /// domain -> (proxy, selected_at) for the currently-sticky pick.
    sticky: DashMap<String, (String, DateTime<Utc>)>,
    ban_duration: StdDuration,
    min_success_weight: f64,
}

impl ProxyPool {
    pub fn new(ban_duration: StdDuration) -> Self {
        Self {
            stats: DashMap::new(),
            members: DashMap::new(),
            rotate_interval: DashMap::new(),
            sticky: DashMap::new(),
            ban_duration,
            min_success_weight: 0.05,
        }
    }

    /// Set how long a domain's proxy selection stays sticky before the
    /// next `select` call re-weights among all non-banned proxies. Called
    /// by the feedback loop's `HalveProxyRotateInterval` adjustment.
    pub fn set_rotate_interval(&self, domain: &str, interval: StdDuration) {
        self.rotate_interval.insert(domain.to_owned(), interval);
    }

    pub fn rotate_interval(&self, domain: &str) -> StdDuration {
        self.rotate_interval
            .get(domain)
            .map(|d| *d)
            .unwrap_or(StdDuration::ZERO)
    }

    /// Register the proxies available for `domain`. Idempotent; proxies
    /// already known retain their stats.
    pub fn configure_domain(&self, domain: &str, proxies: Vec<String>) {
        let domain_stats = self.stats.entry(domain.to_owned()).or_default();
        for proxy in &proxies {
            domain_stats.entry(proxy.clone()).or_default();
        }
        self.members.insert(domain.to_owned(), proxies);
    }

    /// Select a proxy for `domain` by weight `1 + decayed(success_count)`
    /// among non-banned proxies. Falls back to the proxy with the
    /// soonest `banned_until` if every proxy is currently banned.
    pub fn select(
        &self,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<ProxySelection, ProxyPoolError> {
        let members = self
            .members
            .get(domain)
            .ok_or_else(|| ProxyPoolError::NoProxiesForDomain(domain.to_owned()))?;
        if members.is_empty() {
            return Err(ProxyPoolError::NoProxiesForDomain(domain.to_owned()));
        }

        let domain_stats = self
            .stats
            .get(domain)
            .ok_or_else(|| ProxyPoolError::NoProxiesForDomain(domain.to_owned()))?;

        let rotate_interval = self.rotate_interval(domain);
        if rotate_interval > StdDuration::ZERO {
            if let Some(sticky) = self.sticky_if_fresh(domain, &domain_stats, rotate_interval, now) {
                return Ok(sticky);
            }
        }

        let mut available: Vec<(String, f64)> = Vec::new();
        let mut banned: Vec<(String, DateTime<Utc>)> = Vec::new();

        for proxy in members.iter() {
            let stats = domain_stats
                .get(proxy)
                .map(|s| decayed(&s, now))
                .unwrap_or_default();

            if let Some(until) = stats.banned_until {
                if until > now {
                    banned.push((proxy.clone(), until));
                    continue;
                }
            }

            let total = stats.success_count + stats.fail_count;
            let success_rate = if total > 0.0 {
                stats.success_count / total
            } else {
                1.0
            };
            let avg_rtt_ms = if total > 0.0 {
                stats.total_rtt_ms / total
            } else {
                0.0
            };
            let weight = success_rate.max(self.min_success_weight) / (avg_rtt_ms + 1.0);
            available.push((proxy.clone(), weight));
        }

        if available.is_empty() {
            let soonest = banned
                .into_iter()
                .min_by(|a, b| a.1.cmp(&b.1))
                .map(|(proxy, _)| proxy)
                .expect("members is non-empty so banned is non-empty when available is empty");
            return Ok(ProxySelection {
                proxy: soonest,
                all_banned: true,
            });
        }

        let weights: Vec<f64> = available.iter().map(|(_, w)| *w).collect();
        let dist = WeightedIndex::new(&weights).expect("weights are positive and finite");
        let idx = dist.sample(&mut thread_rng());
        let chosen = available[idx].0.clone();

        if rotate_interval > StdDuration::ZERO {
            self.sticky.insert(domain.to_owned(), (chosen.clone(), now));
        }

        Ok(ProxySelection {
            proxy: chosen,
            all_banned: false,
        })
    }

    /// `Some` if `domain` has a sticky selection still within its rotate
    /// interval and that proxy is not currently banned.
    fn sticky_if_fresh(
        &self,
        domain: &str,
        domain_stats: &DashMap<String, ProxyDomainStats>,
        rotate_interval: StdDuration,
        now: DateTime<Utc>,
    ) -> Option<ProxySelection> {
        let (proxy, selected_at) = self.sticky.get(domain).map(|e| e.value().clone())?;
        let elapsed = (now - selected_at).to_std().unwrap_or(StdDuration::ZERO);
        if elapsed >= rotate_interval {
            return None;
        }
        let banned = domain_stats
            .get(&proxy)
            .and_then(|s| s.banned_until)
            .map(|until| until > now)
            .unwrap_or(false);
        if banned {
            return None;
        }
        Some(ProxySelection {
            proxy,
            all_banned: false,
        })
    }

    /// Record the outcome of a fetch attempt through `proxy` for `domain`,
    /// applying decay to prior counters before accumulating.
    pub fn record(
        &self,
        domain: &str,
        proxy: &str,
        outcome: ProxyOutcome,
        rtt: StdDuration,
        now: DateTime<Utc>,
    ) {
        let domain_stats = self.stats.entry(domain.to_owned()).or_default();
        let mut entry = domain_stats.entry(proxy.to_owned()).or_default();
        let mut fresh = decayed(&entry, now);
        match outcome {
            ProxyOutcome::Success => fresh.success_count += 1.0,
            ProxyOutcome::Failure => fresh.fail_count += 1.0,
        }
        fresh.total_rtt_ms += rtt.as_millis() as f64;
        fresh.last_used_at = Some(now);
        *entry = fresh;
    }

    /// Ban `proxy` for `domain` for the pool's configured ban duration.
    pub fn ban(&self, domain: &str, proxy: &str, now: DateTime<Utc>) {
        let domain_stats = self.stats.entry(domain.to_owned()).or_default();
        let mut entry = domain_stats.entry(proxy.to_owned()).or_default();
        entry.banned_until = Some(
            now + chrono::Duration::from_std(self.ban_duration).unwrap_or_default(),
        );
    }

    pub fn stats_snapshot(&self, domain: &str) -> Vec<(String, ProxyDomainStats)> {
        self.stats
            .get(domain)
            .map(|m| {
                m.iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_domain_errors() {
        let pool = ProxyPool::new(StdDuration::from_secs(60));
        let err = pool.select("example.com", Utc::now()).unwrap_err();
        assert!(matches!(err, ProxyPoolError::NoProxiesForDomain(_)));
    }

    #[test]
    fn healthy_proxy_is_preferred_over_failing_one() {
        let pool = ProxyPool::new(StdDuration::from_secs(60));
        pool.configure_domain("example.com", vec!["p1".into(), "p2".into()]);
        let now = Utc::now();

        for _ in 0..20 {
            pool.record(
                "example.com",
                "p1",
                ProxyOutcome::Success,
                StdDuration::from_millis(50),
                now,
            );
            pool.record(
                "example.com",
                "p2",
                ProxyOutcome::Failure,
                StdDuration::from_millis(50),
                now,
            );
        }

        let mut p1_wins = 0;
        for _ in 0..200 {
            let sel = pool.select("example.com", now).unwrap();
            if sel.proxy == "p1" {
                p1_wins += 1;
            }
        }
        assert!(p1_wins > 150, "expected p1 to dominate selection, got {p1_wins}/200");
    }

    #[test]
    fn banned_proxy_is_excluded_until_expiry() {
        let pool = ProxyPool::new(StdDuration::from_secs(60));
        pool.configure_domain("example.com", vec!["p1".into(), "p2".into()]);
        let now = Utc::now();
        pool.ban("example.com", "p1", now);

        for _ in 0..10 {
            let sel = pool.select("example.com", now).unwrap();
            assert_eq!(sel.proxy, "p2");
            assert!(!sel.all_banned);
        }

        let later = now + chrono::Duration::seconds(61);
        let sel = pool.select("example.com", later).unwrap();
        assert!(sel.proxy == "p1" || sel.proxy == "p2");
    }

    #[test]
    fn all_proxies_banned_falls_back_to_soonest_available() {
        let pool = ProxyPool::new(StdDuration::from_secs(60));
        pool.configure_domain("example.com", vec!["p1".into(), "p2".into()]);
        let now = Utc::now();
        pool.ban("example.com", "p1", now);
        pool.ban("example.com", "p2", now + chrono::Duration::seconds(10));

        let sel = pool.select("example.com", now).unwrap();
        assert!(sel.all_banned);
        assert_eq!(sel.proxy, "p1");
    }

    #[test]
    fn decay_reduces_influence_of_old_outcomes() {
        let pool = ProxyPool::new(StdDuration::from_secs(60));
        pool.configure_domain("example.com", vec!["p1".into()]);
        let now = Utc::now();
        pool.record(
            "example.com",
            "p1",
            ProxyOutcome::Failure,
            StdDuration::from_millis(10),
            now,
        );

        let much_later = now + chrono::Duration::seconds(3600 * 10);
        let snapshot = pool.stats_snapshot("example.com");
        let (_, stats) = &snapshot[0];
        let decayed_stats = decayed(stats, much_later);
        assert!(decayed_stats.fail_count < 0.01);
    }

    #[test]
    fn rotate_interval_sticks_to_one_proxy_until_it_elapses() {
        let pool = ProxyPool::new(StdDuration::from_secs(60));
        pool.configure_domain("example.com", vec!["p1".into(), "p2".into()]);
        pool.set_rotate_interval("example.com", StdDuration::from_secs(30));
        let now = Utc::now();

        let first = pool.select("example.com", now).unwrap().proxy;
        for offset in 1..10 {
            let sel = pool
                .select("example.com", now + chrono::Duration::seconds(offset))
                .unwrap();
            assert_eq!(sel.proxy, first, "selection should stay sticky within the interval");
        }

        let after_rotation = pool
            .select("example.com", now + chrono::Duration::seconds(31))
            .unwrap();
        assert!(after_rotation.proxy == "p1" || after_rotation.proxy == "p2");
    }

    #[test]
    fn zero_rotate_interval_never_sticks() {
        let pool = ProxyPool::new(StdDuration::from_secs(60));
        pool.configure_domain("example.com", vec!["p1".into()]);
        let now = Utc::now();
        assert_eq!(pool.rotate_interval("example.com"), StdDuration::ZERO);
        let sel = pool.select("example.com", now).unwrap();
        assert_eq!(sel.proxy, "p1");
    }
}
