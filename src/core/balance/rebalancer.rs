use super::backend::{backend_key, Backend};
use super::meter::MeterOptions;
use super::round_robin::{gcd, WrrState};
use super::BalancerError;
use http::Uri;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tuning knobs for the adaptive weight controller.
#[derive(Debug, Clone, Copy)]
pub struct RebalanceOptions {
    /// Minimum time between two applied weight changes.
    pub backoff: Duration,
    /// Multiplier applied to good backends during a grow phase, and the
    /// divisor walking weights back during converge.
    pub grow_factor: u32,
    /// Hard cap on any adapted weight.
    pub max_weight: u32,
    /// Deviation multiplier for the outlier split.
    pub split_threshold: f64,
    pub meter: MeterOptions,
}

impl Default for RebalanceOptions {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(10),
            grow_factor: 4,
            max_weight: 4096,
            split_threshold: 1.5,
            meter: MeterOptions::default(),
        }
    }
}

#[derive(Debug)]
struct RebalancerState {
    wrr: WrrState,
    /// Weight changes only take effect once this deadline has passed; it is
    /// pushed out by the backoff whenever a change is applied.
    next_adjust: Instant,
}

/// Wraps the weighted round-robin selector and drifts backend weights
/// toward the better-performing backends, relaxing back to the declared
/// weights once no backend is measurably worse.
///
/// Selection, outcome recording, and weight recomputation all run under
/// one lock held only for the in-memory update. The recompute is invoked
/// opportunistically after each completed request and is an idempotent
/// no-op whenever the backoff has not expired or nothing would change.
#[derive(Debug)]
pub struct Rebalancer {
    state: Mutex<RebalancerState>,
    options: RebalanceOptions,
}

impl Rebalancer {
    pub fn new(options: RebalanceOptions) -> Self {
        Self {
            state: Mutex::new(RebalancerState {
                wrr: WrrState::new(options.meter),
                next_adjust: Instant::now(),
            }),
            options,
        }
    }

    pub fn from_backends<I>(backends: I, options: RebalanceOptions) -> Result<Self, BalancerError>
    where
        I: IntoIterator<Item = (Uri, u32)>,
    {
        let rebalancer = Self::new(options);
        for (url, weight) in backends {
            rebalancer.upsert_server(url, weight)?;
        }
        Ok(rebalancer)
    }

    /// Pick the next backend URL.
    pub fn next(&self) -> Result<Uri, BalancerError> {
        self.state.lock().unwrap().wrr.next()
    }

    /// Add a backend or replace the declared weight of an existing one.
    pub fn upsert_server(&self, url: Uri, weight: u32) -> Result<(), BalancerError> {
        self.state.lock().unwrap().wrr.upsert(url, weight)
    }

    pub fn remove_server(&self, url: &Uri) -> Result<(), BalancerError> {
        self.state.lock().unwrap().wrr.remove(url)
    }

    pub fn servers(&self) -> Vec<Uri> {
        self.state.lock().unwrap().wrr.servers()
    }

    /// Current (possibly adapted) weight of a backend.
    pub fn server_weight(&self, url: &Uri) -> Option<u32> {
        self.state.lock().unwrap().wrr.weight_of(url)
    }

    /// Feed one request outcome into the backend's meter. Outcomes for a
    /// backend that has left the pool are dropped.
    pub fn record_outcome(&self, url: &Uri, favorable: bool) {
        let key = match backend_key(url) {
            Ok(key) => key,
            Err(_) => return,
        };
        let mut state = self.state.lock().unwrap();
        match state.wrr.find_mut(&key) {
            Some(backend) => backend.meter.record(favorable),
            None => debug!(backend = %url, "outcome for a backend no longer in the pool"),
        }
    }

    /// Run one recompute cycle if the backoff has expired. Never surfaces
    /// errors to the request path.
    pub fn maybe_rebalance(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if now < state.next_adjust {
            return;
        }
        if state.wrr.backends().len() < 2 {
            return;
        }
        if state.wrr.backends().iter().any(|b| !b.meter.is_ready()) {
            return;
        }

        let has_outliers = classify(state.wrr.backends_mut(), self.options.split_threshold);
        let changed = if has_outliers {
            grow(
                state.wrr.backends_mut(),
                self.options.grow_factor.max(2),
                self.options.max_weight,
            )
        } else {
            converge(state.wrr.backends_mut(), self.options.grow_factor.max(2))
        };

        if changed {
            state.wrr.reset_cursor();
            state.next_adjust = now + self.options.backoff;
            for backend in state.wrr.backends() {
                debug!(
                    backend = %backend.url(),
                    weight = backend.current_weight(),
                    good = backend.good,
                    "adjusted backend weight"
                );
            }
        }
    }
}

/// Split backends into good and bad by failure ratio. Perfect scores are
/// good by definition and excluded from the center/deviation computation;
/// the rest split around their median with a `threshold`-scaled
/// median-absolute-deviation band. Returns true only when both sets are
/// non-empty, i.e. there is a genuine outlier to react to.
fn classify(backends: &mut [Backend], threshold: f64) -> bool {
    let failures: Vec<f64> = backends.iter().map(|b| 1.0 - b.meter.rating()).collect();
    let imperfect: Vec<f64> = failures.iter().copied().filter(|f| *f > 0.0).collect();
    if imperfect.is_empty() {
        for backend in backends.iter_mut() {
            backend.good = true;
        }
        return false;
    }

    let center = median(&imperfect);
    let deviation = median_deviation(&imperfect, center);
    let cutoff = center + threshold * deviation;

    let mut good = 0usize;
    let mut bad = 0usize;
    for (backend, failure) in backends.iter_mut().zip(failures) {
        backend.good = failure < cutoff;
        if backend.good {
            good += 1;
        } else {
            bad += 1;
        }
    }
    good > 0 && bad > 0
}

/// Multiply every good backend's weight, capped, then normalize the whole
/// set by its GCD to keep the numbers small.
fn grow(backends: &mut [Backend], factor: u32, cap: u32) -> bool {
    let mut changed = false;
    for backend in backends.iter_mut().filter(|b| b.good) {
        let next = backend.current_weight.saturating_mul(factor).min(cap);
        if next != backend.current_weight {
            backend.current_weight = next;
            changed = true;
        }
    }
    if changed {
        normalize(backends);
    }
    changed
}

/// Walk adapted weights back toward the declared originals, never past
/// them.
fn converge(backends: &mut [Backend], factor: u32) -> bool {
    let mut changed = false;
    for backend in backends.iter_mut() {
        if backend.current_weight == backend.original_weight {
            continue;
        }
        let mut next = backend.current_weight / factor;
        if next < backend.original_weight {
            next = backend.original_weight;
        }
        if next != backend.current_weight {
            backend.current_weight = next;
            changed = true;
        }
    }
    changed
}

fn normalize(backends: &mut [Backend]) {
    let divisor = backends
        .iter()
        .map(|b| b.current_weight)
        .filter(|w| *w > 0)
        .fold(0, gcd);
    if divisor > 1 {
        for backend in backends.iter_mut() {
            backend.current_weight /= divisor;
        }
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn median_deviation(values: &[f64], center: f64) -> f64 {
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations)
}
