use super::backend::{backend_key, Backend};
use super::meter::MeterOptions;
use super::BalancerError;
use http::Uri;
use std::sync::Mutex;

/// Selector state: the backend list, the rotating cursor, and the
/// interleave budget. Shared by [`RoundRobin`] and the rebalancer, which
/// each guard it with a single lock.
#[derive(Debug)]
pub(crate) struct WrrState {
    backends: Vec<Backend>,
    meter_options: MeterOptions,
    cursor: Option<usize>,
    budget: u32,
}

impl WrrState {
    pub(crate) fn new(meter_options: MeterOptions) -> Self {
        Self {
            backends: Vec::new(),
            meter_options,
            cursor: None,
            budget: 0,
        }
    }

    /// GCD-interleaved weighted round robin. Each full pass over the list
    /// lowers the budget by the GCD of the weights; a backend is eligible
    /// while its weight covers the budget. Selection frequency is
    /// proportional to weight and interleaved rather than bursty.
    pub(crate) fn next(&mut self) -> Result<Uri, BalancerError> {
        if self.backends.is_empty() {
            return Err(BalancerError::NoServers);
        }
        let max = self.max_weight();
        if max == 0 {
            return Err(BalancerError::AllWeightsZero);
        }
        let step = self.weights_gcd();
        loop {
            let index = match self.cursor {
                Some(previous) => (previous + 1) % self.backends.len(),
                None => 0,
            };
            self.cursor = Some(index);
            if index == 0 {
                self.budget = if self.budget <= step {
                    max
                } else {
                    self.budget - step
                };
            }
            let backend = &self.backends[index];
            if backend.current_weight >= self.budget {
                return Ok(backend.url().clone());
            }
        }
    }

    /// Insert a backend or update the declared weight of an existing one.
    /// Either way the cursor and budget restart to avoid stale skew.
    pub(crate) fn upsert(&mut self, url: Uri, weight: u32) -> Result<(), BalancerError> {
        let key = backend_key(&url)?;
        match self.backends.iter_mut().find(|b| b.key() == key) {
            Some(existing) => {
                existing.original_weight = weight;
                existing.current_weight = weight;
            }
            None => {
                self.backends
                    .push(Backend::new(url, weight, self.meter_options)?);
            }
        }
        self.reset_cursor();
        Ok(())
    }

    pub(crate) fn remove(&mut self, url: &Uri) -> Result<(), BalancerError> {
        let key = backend_key(url)?;
        let before = self.backends.len();
        self.backends.retain(|b| b.key() != key);
        if self.backends.len() == before {
            return Err(BalancerError::ServerNotFound(url.clone()));
        }
        self.reset_cursor();
        Ok(())
    }

    pub(crate) fn weight_of(&self, url: &Uri) -> Option<u32> {
        let key = backend_key(url).ok()?;
        self.backends
            .iter()
            .find(|b| b.key() == key)
            .map(|b| b.current_weight)
    }

    pub(crate) fn servers(&self) -> Vec<Uri> {
        self.backends.iter().map(|b| b.url().clone()).collect()
    }

    pub(crate) fn reset_cursor(&mut self) {
        self.cursor = None;
        self.budget = 0;
    }

    pub(crate) fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub(crate) fn backends_mut(&mut self) -> &mut [Backend] {
        &mut self.backends
    }

    pub(crate) fn find_mut(&mut self, key: &str) -> Option<&mut Backend> {
        self.backends.iter_mut().find(|b| b.key() == key)
    }

    pub(crate) fn max_weight(&self) -> u32 {
        self.backends
            .iter()
            .map(|b| b.current_weight)
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn weights_gcd(&self) -> u32 {
        self.backends
            .iter()
            .map(|b| b.current_weight)
            .filter(|w| *w > 0)
            .fold(0, gcd)
    }
}

pub(crate) fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Weighted round-robin selector over a mutable backend set.
///
/// All selection and mutation run under one lock, so the interleaving
/// sequence is well defined under concurrent callers. The lock is only
/// held for the in-memory update, never across I/O.
#[derive(Debug)]
pub struct RoundRobin {
    state: Mutex<WrrState>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::with_meter_options(MeterOptions::default())
    }

    pub fn with_meter_options(meter_options: MeterOptions) -> Self {
        Self {
            state: Mutex::new(WrrState::new(meter_options)),
        }
    }

    /// Pick the next backend URL.
    pub fn next(&self) -> Result<Uri, BalancerError> {
        self.state.lock().unwrap().next()
    }

    pub fn upsert(&self, url: Uri, weight: u32) -> Result<(), BalancerError> {
        self.state.lock().unwrap().upsert(url, weight)
    }

    pub fn remove(&self, url: &Uri) -> Result<(), BalancerError> {
        self.state.lock().unwrap().remove(url)
    }

    /// Current weight of a backend, or `None` when it is not in the set.
    pub fn server_weight(&self, url: &Uri) -> Option<u32> {
        self.state.lock().unwrap().weight_of(url)
    }

    pub fn servers(&self) -> Vec<Uri> {
        self.state.lock().unwrap().servers()
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn url(s: &str) -> Uri {
        s.parse().unwrap()
    }

    fn selector(weights: &[(&str, u32)]) -> RoundRobin {
        let rr = RoundRobin::new();
        for (server, weight) in weights {
            rr.upsert(url(server), *weight).unwrap();
        }
        rr
    }

    fn take(rr: &RoundRobin, n: usize) -> Vec<String> {
        (0..n).map(|_| rr.next().unwrap().to_string()).collect()
    }

    #[test]
    fn test_equal_weights_alternate() {
        let rr = selector(&[("http://a/", 1), ("http://b/", 1)]);
        assert_eq!(take(&rr, 4), vec!["http://a/", "http://b/", "http://a/", "http://b/"]);
    }

    #[test]
    fn test_three_two_interleaves() {
        let rr = selector(&[("http://a/", 3), ("http://b/", 2)]);
        assert_eq!(
            take(&rr, 6),
            vec![
                "http://a/",
                "http://a/",
                "http://b/",
                "http://a/",
                "http://b/",
                "http://a/"
            ]
        );
    }

    #[test]
    fn test_selection_quota_per_window() {
        let rr = selector(&[("http://a/", 1), ("http://b/", 2), ("http://c/", 3)]);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for pick in take(&rr, 6) {
            *counts.entry(pick).or_default() += 1;
        }
        assert_eq!(counts["http://a/"], 1);
        assert_eq!(counts["http://b/"], 2);
        assert_eq!(counts["http://c/"], 3);
    }

    #[test]
    fn test_zero_weight_backend_is_skipped() {
        let rr = selector(&[("http://a/", 0), ("http://b/", 1)]);
        assert_eq!(take(&rr, 3), vec!["http://b/", "http://b/", "http://b/"]);
    }

    #[test]
    fn test_empty_set_errors() {
        let rr = RoundRobin::new();
        assert!(matches!(rr.next(), Err(BalancerError::NoServers)));
    }

    #[test]
    fn test_all_zero_weights_error() {
        let rr = selector(&[("http://a/", 0), ("http://b/", 0)]);
        assert!(matches!(rr.next(), Err(BalancerError::AllWeightsZero)));
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let rr = selector(&[("http://a/", 1), ("http://b/", 1)]);
        rr.upsert(url("http://a/"), 5).unwrap();
        assert_eq!(rr.servers().len(), 2);
        assert_eq!(rr.server_weight(&url("http://a/")), Some(5));
    }

    #[test]
    fn test_repeated_upsert_is_idempotent() {
        let once = selector(&[("http://a/", 3), ("http://b/", 2)]);
        let twice = selector(&[("http://a/", 3), ("http://b/", 2)]);
        twice.upsert(url("http://b/"), 2).unwrap();
        assert_eq!(take(&once, 10), take(&twice, 10));
    }

    #[test]
    fn test_identity_ignores_query() {
        let rr = selector(&[("http://a/?x=1", 1)]);
        rr.upsert(url("http://a/?x=2"), 4).unwrap();
        assert_eq!(rr.servers().len(), 1);
        assert_eq!(rr.server_weight(&url("http://a/")), Some(4));
    }

    #[test]
    fn test_remove_absent_errors() {
        let rr = selector(&[("http://a/", 1)]);
        assert!(matches!(
            rr.remove(&url("http://missing/")),
            Err(BalancerError::ServerNotFound(_))
        ));
        rr.remove(&url("http://a/")).unwrap();
        assert!(matches!(rr.next(), Err(BalancerError::NoServers)));
    }
}
