use super::meter::{MeterOptions, RatioMeter};
use super::BalancerError;
use http::Uri;

/// One upstream server a request may be forwarded to.
///
/// Identity is the normalized (scheme, host[:port], path) triple; the query
/// is ignored, so two URLs differing only in query name the same backend.
#[derive(Debug)]
pub struct Backend {
    url: Uri,
    key: String,
    /// Weight declared by the operator; the floor the rebalancer relaxes to.
    pub(crate) original_weight: u32,
    /// Weight the selector currently uses; mutated by the rebalancer.
    pub(crate) current_weight: u32,
    /// Transient classification flag set during a recompute cycle.
    pub(crate) good: bool,
    pub(crate) meter: RatioMeter,
}

impl Backend {
    pub fn new(url: Uri, weight: u32, meter: MeterOptions) -> Result<Self, BalancerError> {
        let key = backend_key(&url)?;
        Ok(Self {
            url,
            key,
            original_weight: weight,
            current_weight: weight,
            good: true,
            meter: RatioMeter::new(meter),
        })
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn current_weight(&self) -> u32 {
        self.current_weight
    }

    pub fn original_weight(&self) -> u32 {
        self.original_weight
    }
}

/// Normalized identity of a backend URL: lowercase scheme and host, the
/// port as given, the path as given ("/" when absent). Query dropped.
pub fn backend_key(url: &Uri) -> Result<String, BalancerError> {
    let scheme = url
        .scheme_str()
        .ok_or_else(|| BalancerError::RelativeUrl(url.clone()))?
        .to_ascii_lowercase();
    let host = url
        .host()
        .ok_or_else(|| BalancerError::RelativeUrl(url.clone()))?
        .to_ascii_lowercase();
    let path = match url.path() {
        "" => "/",
        p => p,
    };
    Ok(match url.port_u16() {
        Some(port) => format!("{}://{}:{}{}", scheme, host, port, path),
        None => format!("{}://{}{}", scheme, host, path),
    })
}
