pub mod backend;
pub mod meter;
pub mod rebalancer;
pub mod round_robin;
pub mod sticky;

pub use backend::{backend_key, Backend};
pub use meter::{MeterOptions, RatioMeter};
pub use rebalancer::{RebalanceOptions, Rebalancer};
pub use round_robin::RoundRobin;
pub use sticky::{StickyError, StickySession};

use http::Uri;

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("no servers in the pool")]
    NoServers,
    #[error("all server weights are zero")]
    AllWeightsZero,
    #[error("server not found: {0}")]
    ServerNotFound(Uri),
    #[error("server url must be absolute: {0}")]
    RelativeUrl(Uri),
}
