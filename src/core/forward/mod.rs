pub mod error;
pub mod headers;
pub mod http;
pub mod websocket;

pub use error::{DefaultErrorHandler, ErrorHandler, ForwardError, ProxyError};
pub use headers::is_websocket_upgrade;
pub use http::HttpForwarder;
pub use websocket::WebsocketForwarder;

use bytes::Bytes;
use ::http::{Request, Response, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use std::net::SocketAddr;
use std::time::Duration;

/// Body type every relayed or synthesized response uses.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Transport knobs shared by both forwarders.
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Outbound dial budget.
    pub connect_timeout: Duration,
    /// Budget for the backend to produce response headers (or the
    /// websocket handshake reply). `None` disables the limit.
    pub response_timeout: Option<Duration>,
    /// Keep inbound X-Forwarded-* values instead of overwriting them.
    pub trust_forwarded: bool,
    /// Value written into X-Forwarded-Server.
    pub server_name: String,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            response_timeout: Some(Duration::from_secs(30)),
            trust_forwarded: false,
            server_name: "ferryman".to_string(),
        }
    }
}

/// How a request should be relayed, resolved once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    Http,
    Websocket,
}

pub fn classify<B>(request: &Request<B>) -> ForwardKind {
    if is_websocket_upgrade(request.headers()) {
        ForwardKind::Websocket
    } else {
        ForwardKind::Http
    }
}

/// Inspects each request and routes it to the HTTP or WebSocket relay.
pub struct Forwarder {
    http: HttpForwarder,
    websocket: WebsocketForwarder,
}

impl Forwarder {
    pub fn new(options: ForwardOptions) -> Self {
        Self {
            http: HttpForwarder::new(options.clone()),
            websocket: WebsocketForwarder::new(options),
        }
    }

    /// Relay one exchange to `target`.
    pub async fn serve(
        &self,
        target: &Uri,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        match classify(&request) {
            ForwardKind::Http => self.http.serve(target, request, peer).await,
            ForwardKind::Websocket => self.websocket.serve(target, request, peer).await,
        }
    }
}

/// Rebase the request path and query onto the backend URL.
pub(crate) fn join_target(target: &Uri, request_uri: &Uri) -> Result<Uri, ForwardError> {
    let scheme = target
        .scheme()
        .cloned()
        .ok_or_else(|| ForwardError::BadTarget(target.to_string()))?;
    let authority = target
        .authority()
        .cloned()
        .ok_or_else(|| ForwardError::BadTarget(target.to_string()))?;

    let base = target.path().trim_end_matches('/');
    let path = request_uri.path();
    let path_and_query = match request_uri.query() {
        Some(query) => format!("{}{}?{}", base, path, query),
        None => format!("{}{}", base, path),
    };

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|error| ForwardError::BadTarget(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONNECTION, UPGRADE};

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_upgrade_request_goes_to_websocket() {
        let request = Request::builder()
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert_eq!(classify(&request), ForwardKind::Websocket);
    }

    #[test]
    fn test_plain_request_goes_to_http() {
        let request = Request::builder().body(()).unwrap();
        assert_eq!(classify(&request), ForwardKind::Http);

        // Connection: Upgrade alone is not enough.
        let request = Request::builder()
            .header(CONNECTION, "Upgrade")
            .body(())
            .unwrap();
        assert_eq!(classify(&request), ForwardKind::Http);
    }

    #[test]
    fn test_join_keeps_request_path_and_query() {
        let joined = join_target(&uri("http://backend:8080"), &uri("/api/v1?x=1")).unwrap();
        assert_eq!(joined.to_string(), "http://backend:8080/api/v1?x=1");
    }

    #[test]
    fn test_join_prefixes_backend_path() {
        let joined = join_target(&uri("http://backend:8080/mount/"), &uri("/thing")).unwrap();
        assert_eq!(joined.to_string(), "http://backend:8080/mount/thing");
    }

    #[test]
    fn test_join_rejects_relative_target() {
        assert!(matches!(
            join_target(&uri("/not-absolute"), &uri("/x")),
            Err(ForwardError::BadTarget(_))
        ));
    }
}
