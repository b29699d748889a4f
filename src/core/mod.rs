pub mod balance;
pub mod forward;
pub mod logger;

// Re-export core components
pub use balance::{
    backend_key, BalancerError, MeterOptions, RatioMeter, RebalanceOptions, Rebalancer,
    RoundRobin, StickyError, StickySession,
};
pub use forward::{
    classify, DefaultErrorHandler, ErrorHandler, ForwardError, ForwardKind, ForwardOptions,
    Forwarder, HttpForwarder, ProxyBody, ProxyError, WebsocketForwarder,
};
pub use logger::{RequestLogger, RequestRecord, TracingLogger};
