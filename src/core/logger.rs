use http::{Method, StatusCode, Uri};
use std::time::Duration;

/// What gets logged for one forwarded request.
#[derive(Debug)]
pub struct RequestRecord<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    /// Chosen backend; `None` when selection itself failed.
    pub target: Option<&'a Uri>,
    pub status: StatusCode,
    pub latency: Duration,
}

/// Pluggable per-request log sink. Implementations must not block request
/// serving; dropping lines under backpressure is acceptable.
pub trait RequestLogger: Send + Sync {
    fn log(&self, record: &RequestRecord<'_>);
}

/// Default sink emitting through `tracing`. The binary pairs it with a
/// non-blocking writer, so a slow stderr consumer drops lines instead of
/// stalling workers.
#[derive(Debug, Default)]
pub struct TracingLogger;

impl RequestLogger for TracingLogger {
    fn log(&self, record: &RequestRecord<'_>) {
        let backend = record
            .target
            .map(|target| target.to_string())
            .unwrap_or_else(|| "-".to_string());
        tracing::info!(
            method = %record.method,
            path = record.path,
            backend = %backend,
            status = record.status.as_u16(),
            latency_ms = record.latency.as_millis() as u64,
            "forwarded request"
        );
    }
}
