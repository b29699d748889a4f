use crate::config::Config;
use crate::core::balance::{Rebalancer, StickySession};
use crate::core::forward::{
    DefaultErrorHandler, ErrorHandler, Forwarder, ProxyBody, ProxyError,
};
use crate::core::logger::{RequestLogger, RequestRecord, TracingLogger};
use http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Optimize client socket for low latency
fn optimize_client_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    if let Ok(socket_ref) = socket2::SockRef::try_from(stream) {
        let _ = socket_ref.set_reuse_address(true);
        let _ = socket_ref.set_send_buffer_size(32768);
        let _ = socket_ref.set_recv_buffer_size(32768);
    }
}

pub struct FerrymanServer {
    config: Arc<Config>,
    balancer: Arc<Rebalancer>,
    sticky: Option<StickySession>,
    error_handler: Arc<dyn ErrorHandler>,
    logger: Arc<dyn RequestLogger>,
}

impl FerrymanServer {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        if config.backends.is_empty() {
            return Err(ServerError::NoBackends);
        }

        let mut backends = Vec::with_capacity(config.backends.len());
        for backend in &config.backends {
            let url: Uri = backend.url.parse().map_err(|_| ServerError::InvalidBackend {
                url: backend.url.clone(),
                reason: "not a valid url".to_string(),
            })?;
            backends.push((url, backend.weight));
        }
        let balancer = Rebalancer::from_backends(backends, config.rebalance.options()).map_err(
            |e| ServerError::InvalidBackend {
                url: String::new(),
                reason: e.to_string(),
            },
        )?;

        let sticky = config
            .sticky
            .as_ref()
            .map(|sticky| StickySession::new(sticky.cookie.clone()));

        info!("balancing across {} backends", config.backends.len());
        for backend in &config.backends {
            info!(url = backend.url.as_str(), weight = backend.weight, "backend");
        }

        Ok(Self {
            config: Arc::new(config),
            balancer: Arc::new(balancer),
            sticky,
            error_handler: Arc::new(DefaultErrorHandler),
            logger: Arc::new(TracingLogger),
        })
    }

    /// Replace the default error handler (502/504 with generic bodies).
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// Replace the default request log sink.
    pub fn with_logger(mut self, logger: Arc<dyn RequestLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// The backend-set management API, usable concurrently with serving.
    pub fn balancer(&self) -> &Rebalancer {
        &self.balancer
    }

    /// Bind the configured listener and serve until the task is dropped.
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.listener.bind)
            .await
            .map_err(|e| ServerError::BindFailed(e.to_string()))?;

        info!("Server listening on {}", self.config.listener.bind);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let handler = Arc::new(RequestHandler {
            balancer: Arc::clone(&self.balancer),
            sticky: self.sticky.clone(),
            forwarder: Forwarder::new(self.config.forward.options()),
            error_handler: Arc::clone(&self.error_handler),
            logger: Arc::clone(&self.logger),
        });

        loop {
            match listener.accept().await {
                Ok((client_socket, peer)) => {
                    debug!("New connection from: {}", peer);
                    optimize_client_socket(&client_socket);

                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let io = TokioIo::new(client_socket);
                        let service = service_fn(move |request| {
                            let handler = Arc::clone(&handler);
                            async move { Ok::<_, Infallible>(handler.handle(request, peer).await) }
                        });
                        if let Err(error) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            debug!(%error, "connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Per-request pipeline: sticky resolve, selection, forwarding, outcome
/// recording, cookie affixing, opportunistic rebalance.
struct RequestHandler {
    balancer: Arc<Rebalancer>,
    sticky: Option<StickySession>,
    forwarder: Forwarder,
    error_handler: Arc<dyn ErrorHandler>,
    logger: Arc<dyn RequestLogger>,
}

impl RequestHandler {
    async fn handle(&self, request: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let started = Instant::now();
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let (response, target) = match self.dispatch(request, peer).await {
            Ok((response, target)) => {
                // 5xx answers count against the backend; everything else,
                // redirects and client errors included, counts for it.
                let favorable = !response.status().is_server_error();
                self.balancer.record_outcome(&target, favorable);
                (response, Some(target))
            }
            Err((error, target)) => {
                if let Some(target) = &target {
                    self.balancer.record_outcome(target, false);
                }
                debug!(%error, "request failed");
                (self.error_handler.handle(&error).await, target)
            }
        };

        self.logger.log(&RequestRecord {
            method: &method,
            path: &path,
            target: target.as_ref(),
            status: response.status(),
            latency: started.elapsed(),
        });
        self.balancer.maybe_rebalance();

        response
    }

    async fn dispatch(
        &self,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<(Response<ProxyBody>, Uri), (ProxyError, Option<Uri>)> {
        let pinned = match &self.sticky {
            Some(sticky) => {
                let live = self.balancer.servers();
                sticky
                    .resolve(request.headers(), &live)
                    .map_err(|e| (ProxyError::from(e), None))?
            }
            None => None,
        };

        let (target, was_pinned) = match pinned {
            Some(url) => (url, true),
            None => {
                let url = self
                    .balancer
                    .next()
                    .map_err(|e| (ProxyError::from(e), None))?;
                (url, false)
            }
        };

        let mut response = self
            .forwarder
            .serve(&target, request, peer)
            .await
            .map_err(|e| (ProxyError::from(e), Some(target.clone())))?;

        if !was_pinned {
            if let Some(sticky) = &self.sticky {
                sticky.affix(&target, &mut response);
            }
        }

        Ok((response, target))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("No backends configured")]
    NoBackends,
    #[error("Invalid backend '{url}': {reason}")]
    InvalidBackend { url: String, reason: String },
    #[error("Bind failed: {0}")]
    BindFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        Config::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn test_server_builds_balancer_from_config() {
        let server = FerrymanServer::new(config(
            r#"
listener:
  bind: "127.0.0.1:0"
backends:
  - url: "http://127.0.0.1:9001"
    weight: 2
  - url: "http://127.0.0.1:9002"
"#,
        ))
        .unwrap();

        assert_eq!(server.balancer().servers().len(), 2);
        assert_eq!(
            server
                .balancer()
                .server_weight(&"http://127.0.0.1:9001".parse().unwrap()),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_start_fails_on_unbindable_address() {
        let server = FerrymanServer::new(config(
            r#"
listener:
  bind: "256.256.256.256:12345"
backends:
  - url: "http://127.0.0.1:9001"
"#,
        ))
        .unwrap();

        let result = server.start().await;
        assert!(matches!(result, Err(ServerError::BindFailed(_))));
    }
}
