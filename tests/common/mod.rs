#![allow(dead_code)]

use bytes::Bytes;
use http::header::HeaderValue;
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub type TestBody = BoxBody<Bytes, hyper::Error>;

pub fn full(data: impl Into<Bytes>) -> TestBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> TestBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn test_client() -> Client<hyper_util::client::legacy::connect::HttpConnector, TestBody> {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Spawn a backend that answers every request with its label in the body
/// and an `x-backend` header.
pub async fn spawn_backend(label: &'static str) -> SocketAddr {
    spawn_backend_with(move |_req| {
        let mut response = Response::new(full(label));
        response
            .headers_mut()
            .insert("x-backend", HeaderValue::from_static(label));
        response
    })
    .await
}

/// Spawn a backend with a custom (synchronous) request handler.
pub async fn spawn_backend_with<F>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Response<TestBody> + Clone + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req)) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

/// Boot a proxy for the given config and return its bound address.
pub async fn spawn_proxy(yaml: &str) -> SocketAddr {
    let config = ferryman::Config::from_yaml_str(yaml).unwrap();
    let server = ferryman::FerrymanServer::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

/// Minimal config for a proxy in front of the given backends, weight 1
/// each.
pub fn proxy_config(backends: &[SocketAddr]) -> String {
    let mut yaml = String::from("listener: { bind: \"127.0.0.1:0\" }\nbackends:\n");
    for addr in backends {
        yaml.push_str(&format!("  - {{ url: \"http://{}\" }}\n", addr));
    }
    yaml
}
