use super::backend::backend_key;
use http::header::{HeaderMap, COOKIE, SET_COOKIE};
use http::{HeaderValue, Response, Uri};

/// Cookie-based override that pins a client to a previously chosen
/// backend. The cookie value is the backend URL in string form; a value
/// naming a backend that has left the live set is treated as no cookie at
/// all, so the client is silently re-pinned on the next response.
#[derive(Debug, Clone)]
pub struct StickySession {
    cookie_name: String,
}

impl StickySession {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Look up the pinned backend for this request. Absence of the cookie
    /// and a stale pin both resolve to `None`; only a cookie value that
    /// fails URL parsing is an error, which the caller decides how to
    /// handle.
    pub fn resolve(
        &self,
        headers: &HeaderMap,
        live: &[Uri],
    ) -> Result<Option<Uri>, StickyError> {
        let value = match self.cookie_value(headers) {
            Some(value) => value,
            None => return Ok(None),
        };
        let url: Uri = value
            .parse()
            .map_err(|_| StickyError::MalformedCookie(value.clone()))?;
        let key = backend_key(&url).map_err(|_| StickyError::MalformedCookie(value))?;
        for candidate in live {
            if let Ok(candidate_key) = backend_key(candidate) {
                if candidate_key == key {
                    return Ok(Some(candidate.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Pin the client to `backend` on the outgoing response.
    pub fn affix<B>(&self, backend: &Uri, response: &mut Response<B>) {
        let cookie = format!("{}={}; Path=/", self.cookie_name, backend);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }

    fn cookie_value(&self, headers: &HeaderMap) -> Option<String> {
        for header in headers.get_all(COOKIE) {
            let raw = match header.to_str() {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.split_once('=') {
                    if name.trim() == self.cookie_name {
                        return Some(value.trim().to_string());
                    }
                }
            }
        }
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StickyError {
    #[error("malformed sticky cookie value: {0}")]
    MalformedCookie(String),
}
