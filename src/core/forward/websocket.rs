use super::error::ForwardError;
use super::headers::{set_forwarded_headers, strip_hop_by_hop};
use super::{empty_body, join_target, ForwardOptions, ProxyBody};
use http::header::{
    CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use http::{Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::upgrade;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::debug;

/// Stateful bidirectional relay for protocol-upgrade requests.
///
/// Performs its own handshake against the backend with a regenerated
/// `Sec-WebSocket-Key`, answers the caller with an accept key derived from
/// the caller's own key, then splices the two upgraded byte streams until
/// either side ends. Extensions are never offered to the backend: the
/// splice relays raw frames, so neither leg may negotiate framing the
/// other did not.
pub struct WebsocketForwarder {
    options: ForwardOptions,
}

impl WebsocketForwarder {
    pub fn new(options: ForwardOptions) -> Self {
        Self { options }
    }

    pub async fn serve(
        &self,
        target: &Uri,
        mut request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let client_key = request
            .headers()
            .get(SEC_WEBSOCKET_KEY)
            .cloned()
            .ok_or_else(|| ForwardError::Handshake("missing Sec-WebSocket-Key".to_string()))?;
        let client_upgrade = upgrade::on(&mut request);

        let authority = target
            .authority()
            .cloned()
            .ok_or_else(|| ForwardError::BadTarget(target.to_string()))?;
        let address = format!(
            "{}:{}",
            authority.host(),
            target.port_u16().unwrap_or(80)
        );
        let stream = match timeout(self.options.connect_timeout, TcpStream::connect(&address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return Err(ForwardError::Connect(error.to_string())),
            Err(_) => return Err(ForwardError::ResponseTimeout),
        };
        let _ = stream.set_nodelay(true);

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|error| ForwardError::Handshake(error.to_string()))?;
        tokio::spawn(async move {
            if let Err(error) = connection.with_upgrades().await {
                debug!(%error, "backend websocket connection ended");
            }
        });

        let (parts, _body) = request.into_parts();
        let origin_form = origin_form(&join_target(target, &parts.uri)?)?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(SEC_WEBSOCKET_KEY);
        headers.remove(SEC_WEBSOCKET_ACCEPT);
        headers.remove(SEC_WEBSOCKET_EXTENSIONS);
        let original_host = headers.remove(HOST);
        set_forwarded_headers(
            &mut headers,
            peer,
            original_host.as_ref(),
            &self.options.server_name,
            self.options.trust_forwarded,
        );

        let backend_key = generate_key();
        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(origin_form)
            .header(HOST, authority.as_str())
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_KEY, backend_key.clone())
            .body(empty_body())
            .map_err(|error| ForwardError::Handshake(error.to_string()))?;
        outbound.headers_mut().extend(headers);

        let response = match self.options.response_timeout {
            Some(limit) => match timeout(limit, sender.send_request(outbound)).await {
                Ok(result) => result,
                Err(_) => return Err(ForwardError::ResponseTimeout),
            },
            None => sender.send_request(outbound).await,
        }
        .map_err(|error| ForwardError::Handshake(error.to_string()))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(ForwardError::Handshake(format!(
                "backend answered {} instead of switching protocols",
                response.status()
            )));
        }
        let expected = derive_accept_key(backend_key.as_bytes());
        let accepted = response
            .headers()
            .get(SEC_WEBSOCKET_ACCEPT)
            .map(|value| value.as_bytes() == expected.as_bytes())
            .unwrap_or(false);
        if !accepted {
            return Err(ForwardError::Handshake(
                "backend accept key mismatch".to_string(),
            ));
        }

        let mut reply = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, derive_accept_key(client_key.as_bytes()));
        if let Some(protocol) = response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            reply = reply.header(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
        }
        let reply = reply
            .body(empty_body())
            .map_err(|error| ForwardError::Handshake(error.to_string()))?;

        // The caller leg upgrades once the 101 reply goes out; splice the
        // two streams until either direction ends, then drop both.
        let backend_upgrade = upgrade::on(response);
        tokio::spawn(async move {
            let backend = match backend_upgrade.await {
                Ok(io) => io,
                Err(error) => {
                    debug!(%error, "backend websocket upgrade failed");
                    return;
                }
            };
            let caller = match client_upgrade.await {
                Ok(io) => io,
                Err(error) => {
                    debug!(%error, "caller websocket upgrade failed");
                    return;
                }
            };
            let mut backend = TokioIo::new(backend);
            let mut caller = TokioIo::new(caller);
            match copy_bidirectional(&mut caller, &mut backend).await {
                Ok((to_backend, to_caller)) => {
                    debug!(to_backend, to_caller, "websocket splice finished");
                }
                Err(error) => debug!(%error, "websocket splice ended with error"),
            }
        });

        Ok(reply)
    }
}

fn origin_form(joined: &Uri) -> Result<Uri, ForwardError> {
    joined
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .map_err(|_| ForwardError::BadTarget(joined.to_string()))
}
