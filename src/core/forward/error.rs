use super::{full_body, ProxyBody};
use crate::core::balance::{BalancerError, StickyError};
use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Response, StatusCode};

/// Transport-leg failures while relaying one exchange.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to reach backend: {0}")]
    Connect(String),
    #[error("timed out waiting for the backend response")]
    ResponseTimeout,
    #[error("backend websocket handshake failed: {0}")]
    Handshake(String),
    #[error("backend request failed: {0}")]
    Upstream(String),
    #[error("invalid forwarding target: {0}")]
    BadTarget(String),
}

/// Everything that can fail while serving one request. Failures are
/// contained to their request/response pair and never corrupt the shared
/// selector or rebalancer state.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Balancer(#[from] BalancerError),
    #[error(transparent)]
    Sticky(#[from] StickyError),
    #[error(transparent)]
    Forward(#[from] ForwardError),
}

/// Pluggable translation of a proxy error into the client-visible
/// response.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, error: &ProxyError) -> Response<ProxyBody>;
}

/// Default policy: 502 for transport failures, 504 for timeouts, 503 for
/// an unusable pool, 400 for a malformed sticky cookie. Bodies carry only
/// the generic reason phrase, never upstream error text.
#[derive(Debug, Default)]
pub struct DefaultErrorHandler;

impl DefaultErrorHandler {
    pub fn status_for(error: &ProxyError) -> StatusCode {
        match error {
            ProxyError::Balancer(BalancerError::NoServers)
            | ProxyError::Balancer(BalancerError::AllWeightsZero) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Balancer(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Sticky(StickyError::MalformedCookie(_)) => StatusCode::BAD_REQUEST,
            ProxyError::Forward(ForwardError::ResponseTimeout) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Forward(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn handle(&self, error: &ProxyError) -> Response<ProxyBody> {
        let status = Self::status_for(error);
        let reason = status.canonical_reason().unwrap_or("error");
        let mut response = Response::new(full_body(format!("{}\n", reason)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }
}
