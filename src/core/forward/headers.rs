use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};
use std::net::SocketAddr;

/// Headers meaningful for a single transport leg only; stripped from both
/// the outbound request and the relayed response.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_SERVER: &str = "x-forwarded-server";

/// Remove the standard hop-by-hop set plus any header the Connection
/// header names for this leg.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| token.trim().parse::<HeaderName>().ok())
        .collect();
    for name in connection_named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Case-insensitive token match against a comma-separated header, across
/// every instance of that header.
pub fn header_contains_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// A request asks for a protocol upgrade to WebSocket when Connection
/// carries the `upgrade` token and Upgrade carries `websocket`.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_contains_token(headers, &CONNECTION, "upgrade")
        && header_contains_token(headers, &UPGRADE, "websocket")
}

/// Rewrite the X-Forwarded-* set on the outbound request. With
/// `trust_forwarded` the inbound values are kept (For is appended to);
/// otherwise they are overwritten with ground truth from the live
/// connection.
pub fn set_forwarded_headers(
    headers: &mut HeaderMap,
    peer: SocketAddr,
    original_host: Option<&HeaderValue>,
    server_name: &str,
    trust_forwarded: bool,
) {
    let client_ip = peer.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR) {
        Some(existing) if trust_forwarded => match existing.to_str() {
            Ok(prior) => format!("{}, {}", prior, client_ip),
            Err(_) => client_ip,
        },
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !(trust_forwarded && headers.contains_key(X_FORWARDED_PROTO)) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if !(trust_forwarded && headers.contains_key(X_FORWARDED_HOST)) {
        match original_host {
            Some(host) => {
                headers.insert(X_FORWARDED_HOST, host.clone());
            }
            None => {
                headers.remove(X_FORWARDED_HOST);
            }
        }
    }

    if !(trust_forwarded && headers.contains_key(X_FORWARDED_SERVER)) {
        if let Ok(value) = HeaderValue::from_str(server_name) {
            headers.insert(X_FORWARDED_SERVER, value);
        }
    }
}
