use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Picks which base URL a network call should target.
///
/// Candidates come from the peer-discovery collaborator via
/// `refresh_candidates`. An address handed to `exclude_own_address` is
/// permanently removed from the pool: a validator must never treat its
/// own advertised address as an external source of truth, even if it is
/// the most responsive peer. When no external candidate survives, the
/// selector may fall back to a registered local node URL, and that
/// state is observable so the shell can flag local-only data.
pub struct EndpointSelector {
    candidates: RwLock<Vec<String>>,
    excluded: RwLock<HashSet<String>>,
    stats: DashMap<String, EndpointStats>,
    local_fallback: RwLock<Option<String>>,
    using_fallback: AtomicBool,
}

struct EndpointStats {
    latency: Option<Histogram<u64>>,
    successes: u64,
    failures: u64,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            // 1ms..10min range covers anything a SOCKS round trip does.
            latency: Histogram::new_with_bounds(1, 600_000, 2).ok(),
            successes: 0,
            failures: 0,
        }
    }

    fn record(&mut self, latency: Duration, ok: bool) {
        if ok {
            self.successes += 1;
            if let Some(h) = self.latency.as_mut() {
                h.saturating_record((latency.as_millis() as u64).max(1));
            }
        } else {
            self.failures += 1;
        }
    }

    /// Sort key: error rate first, then median latency. Untried
    /// endpoints rank ahead of known-bad ones.
    fn rank_key(&self) -> (u64, u64) {
        let samples = self.successes + self.failures;
        if samples == 0 {
            return (0, 0);
        }
        let failure_permille = self.failures * 1000 / samples;
        let p50 = self
            .latency
            .as_ref()
            .filter(|_| self.successes > 0)
            .map(|h| h.value_at_quantile(0.5))
            .unwrap_or(u64::MAX);
        (failure_permille, p50)
    }
}

fn normalize(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

impl EndpointSelector {
    pub fn new() -> Self {
        Self {
            candidates: RwLock::new(Vec::new()),
            excluded: RwLock::new(HashSet::new()),
            stats: DashMap::new(),
            local_fallback: RwLock::new(None),
            using_fallback: AtomicBool::new(false),
        }
    }

    /// Replace the external candidate pool. Exclusions survive any
    /// number of refreshes.
    pub fn refresh_candidates<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cands = self.candidates.write();
        cands.clear();
        for url in urls {
            let n = normalize(url.as_ref());
            if !n.is_empty() && !cands.contains(&n) {
                cands.push(n);
            }
        }
    }

    /// Permanently remove this node's own address from the pool.
    pub fn exclude_own_address(&self, url: &str) {
        self.excluded.write().insert(normalize(url));
    }

    pub fn set_local_fallback(&self, url: &str) {
        *self.local_fallback.write() = Some(normalize(url));
    }

    pub fn clear_local_fallback(&self) {
        *self.local_fallback.write() = None;
        self.using_fallback.store(false, Ordering::Relaxed);
    }

    /// True when the last `resolve_base_url` answered with the local
    /// fallback instead of an external peer.
    pub fn is_using_local_fallback(&self) -> bool {
        self.using_fallback.load(Ordering::Relaxed)
    }

    /// Feed one observed probe result into the ranking.
    pub fn record_probe(&self, url: &str, latency: Duration, ok: bool) {
        let n = normalize(url);
        self.stats
            .entry(n)
            .or_insert_with(EndpointStats::new)
            .record(latency, ok);
    }

    /// Choose the base URL for the next read. Never returns an excluded
    /// address, not even as a last resort.
    pub fn resolve_base_url(&self) -> Option<String> {
        let excluded = self.excluded.read();

        let best = {
            let cands = self.candidates.read();
            let mut live: Vec<&String> =
                cands.iter().filter(|c| !excluded.contains(*c)).collect();
            live.sort_by_key(|c| {
                self.stats
                    .get(c.as_str())
                    .map(|s| s.rank_key())
                    .unwrap_or((0, 0))
            });
            live.first().map(|s| s.to_string())
        };

        if let Some(url) = best {
            self.using_fallback.store(false, Ordering::Relaxed);
            return Some(url);
        }

        let fallback = self.local_fallback.read().clone();
        match fallback {
            Some(url) if !excluded.contains(&url) => {
                self.using_fallback.store(true, Ordering::Relaxed);
                Some(url)
            }
            _ => {
                self.using_fallback.store(false, Ordering::Relaxed);
                None
            }
        }
    }
}

impl Default for EndpointSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excluded_address_never_returned() {
        let sel = EndpointSelector::new();
        sel.refresh_candidates(["http://peer-a:3030", "http://self:3030"]);
        sel.exclude_own_address("http://self:3030/");

        for _ in 0..10 {
            assert_eq!(sel.resolve_base_url().as_deref(), Some("http://peer-a:3030"));
        }

        // Exclusion survives candidate refreshes, including ones that
        // only contain the excluded address.
        sel.refresh_candidates(["http://self:3030"]);
        assert_eq!(sel.resolve_base_url(), None);
    }

    #[test]
    fn ranks_by_recorded_latency() {
        let sel = EndpointSelector::new();
        sel.refresh_candidates(["http://slow:3030", "http://fast:3030"]);
        for _ in 0..5 {
            sel.record_probe("http://slow:3030", Duration::from_millis(900), true);
            sel.record_probe("http://fast:3030", Duration::from_millis(40), true);
        }
        assert_eq!(sel.resolve_base_url().as_deref(), Some("http://fast:3030"));
    }

    #[test]
    fn failing_endpoint_ranks_last() {
        let sel = EndpointSelector::new();
        sel.refresh_candidates(["http://flaky:3030", "http://steady:3030"]);
        sel.record_probe("http://flaky:3030", Duration::from_millis(10), true);
        for _ in 0..5 {
            sel.record_probe("http://flaky:3030", Duration::from_millis(10), false);
        }
        sel.record_probe("http://steady:3030", Duration::from_millis(500), true);
        assert_eq!(sel.resolve_base_url().as_deref(), Some("http://steady:3030"));
    }

    #[test]
    fn falls_back_to_local_and_reports_it() {
        let sel = EndpointSelector::new();
        sel.set_local_fallback("http://127.0.0.1:3030");
        assert!(!sel.is_using_local_fallback());

        assert_eq!(
            sel.resolve_base_url().as_deref(),
            Some("http://127.0.0.1:3030")
        );
        assert!(sel.is_using_local_fallback());

        // An external candidate clears the fallback flag again.
        sel.refresh_candidates(["http://peer-a:3030"]);
        assert_eq!(sel.resolve_base_url().as_deref(), Some("http://peer-a:3030"));
        assert!(!sel.is_using_local_fallback());
    }

    #[test]
    fn clearing_the_fallback_removes_the_last_resort() {
        let sel = EndpointSelector::new();
        sel.set_local_fallback("http://127.0.0.1:3030");
        assert!(sel.resolve_base_url().is_some());

        sel.clear_local_fallback();
        assert_eq!(sel.resolve_base_url(), None);
        assert!(!sel.is_using_local_fallback());
    }

    #[test]
    fn excluded_fallback_is_not_a_last_resort() {
        let sel = EndpointSelector::new();
        sel.set_local_fallback("http://127.0.0.1:3030");
        sel.exclude_own_address("http://127.0.0.1:3030");
        assert_eq!(sel.resolve_base_url(), None);
        assert!(!sel.is_using_local_fallback());
    }
}
