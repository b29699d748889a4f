use super::error::ForwardError;
use super::headers::{set_forwarded_headers, strip_hop_by_hop};
use super::{join_target, ForwardOptions, ProxyBody};
use http::header::HOST;
use http::{Request, Response, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use tokio::time::timeout;

/// Stateless request/response relay to one backend URL.
///
/// The outbound request carries an independent header map, so mutations on
/// one leg never leak into the other. Bodies stream through frame by
/// frame in both directions, which keeps long-lived responses
/// (`text/event-stream` included) flowing and relays trailer frames after
/// the body, announced or not.
pub struct HttpForwarder {
    client: Client<HttpConnector, ProxyBody>,
    options: ForwardOptions,
}

impl HttpForwarder {
    pub fn new(options: ForwardOptions) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(options.connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build::<_, ProxyBody>(connector);
        Self { client, options }
    }

    pub async fn serve(
        &self,
        target: &Uri,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let (mut parts, body) = request.into_parts();

        parts.uri = join_target(target, &parts.uri)?;
        parts.version = Version::HTTP_11;
        parts.extensions.clear();

        let original_host = parts.headers.remove(HOST);
        strip_hop_by_hop(&mut parts.headers);
        set_forwarded_headers(
            &mut parts.headers,
            peer,
            original_host.as_ref(),
            &self.options.server_name,
            self.options.trust_forwarded,
        );

        let outbound = Request::from_parts(parts, body.boxed());
        let response = match self.options.response_timeout {
            Some(limit) => match timeout(limit, self.client.request(outbound)).await {
                Ok(result) => result,
                Err(_) => return Err(ForwardError::ResponseTimeout),
            },
            None => self.client.request(outbound).await,
        }
        .map_err(classify_client_error)?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn classify_client_error(error: hyper_util::client::legacy::Error) -> ForwardError {
    if source_is_timeout(&error) {
        return ForwardError::ResponseTimeout;
    }
    if error.is_connect() {
        return ForwardError::Connect(error.to_string());
    }
    ForwardError::Upstream(error.to_string())
}

fn source_is_timeout(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

