//! IP-reputation signal feeding the DecisionEngine's fusion formula.
//!
//! The design treats `ip_reputation` as an external collaborator's input
//! (0 = clean, 1 = known-bad, 0.5 = unknown). No external reputation feed is
//! wired into this pipeline, so `LocalReputationProvider` derives the same
//! signal from observed request-rate behaviour per source IP, in lieu of a
//! threat-intel subscription.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub trait ReputationProvider: Send + Sync {
    /// `0.5` (unknown) for any IP the provider has no signal for.
    fn reputation(&self, ip: IpAddr) -> f64;
}

/// Rate-based local heuristic: an IP seen opening many flows within a
/// sliding window gets a reputation score scaled toward 1.0. Unlike the
/// teacher's single global counter, this is keyed per-IP (via a concurrent
/// map, since inference workers call it from multiple threads) so one
/// noisy source doesn't inflate every other address's score.
pub struct LocalReputationProvider {
    window: Duration,
    threshold: usize,
    seen: DashMap<IpAddr, Vec<Instant>>,
}

impl LocalReputationProvider {
    pub fn new(window_secs: u64, threshold: usize) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            threshold: threshold.max(1),
            seen: DashMap::new(),
        }
    }

    /// Records a new flow initiation from `ip`, for future reputation
    /// queries. Call this once per completed flow.
    pub fn record(&self, ip: IpAddr) {
        let now = Instant::now();
        let window = self.window;
        let mut timestamps = self.seen.entry(ip).or_default();
        timestamps.push(now);
        timestamps.retain(|&t| now.saturating_duration_since(t) <= window);
    }
}

impl ReputationProvider for LocalReputationProvider {
    fn reputation(&self, ip: IpAddr) -> f64 {
        match self.seen.get(&ip) {
            Some(timestamps) if !timestamps.is_empty() => {
                let ratio = timestamps.len() as f64 / self.threshold as f64;
                ratio.clamp(0.0, 1.0)
            }
            _ => 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn unseen_ip_is_unknown() {
        let provider = LocalReputationProvider::new(60, 10);
        assert_eq!(provider.reputation(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))), 0.5);
    }

    #[test]
    fn frequent_ip_trends_toward_bad() {
        let provider = LocalReputationProvider::new(60, 5);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        for _ in 0..5 {
            provider.record(ip);
        }
        assert_eq!(provider.reputation(ip), 1.0);
    }

    #[test]
    fn single_observation_stays_well_below_bad() {
        let provider = LocalReputationProvider::new(60, 10);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));
        provider.record(ip);
        assert!((provider.reputation(ip) - 0.1).abs() < 1e-9);
    }
}
