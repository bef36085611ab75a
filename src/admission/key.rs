//! Request key extraction.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ConnectInfo;
use http::request::Parts;

/// Error returned by a key function.
pub type KeyError = tower::BoxError;

/// Maps a request to the key it is limited under.
///
/// Key functions run on every request. If one fails, the middleware answers
/// `500 Internal Server Error` and does not touch the store.
pub type KeyFn = Arc<dyn Fn(&Parts) -> Result<String, KeyError> + Send + Sync>;

/// Limit by client IP.
///
/// The first listed header with a non-empty value wins (for example
/// `X-Forwarded-For` behind a proxy). Otherwise the peer address recorded by
/// axum's `ConnectInfo` is used.
pub fn ip_key_fn<I, H>(headers: I) -> KeyFn
where
    I: IntoIterator<Item = H>,
    H: Into<String>,
{
    let headers: Vec<String> = headers.into_iter().map(Into::into).collect();

    Arc::new(move |parts: &Parts| -> Result<String, KeyError> {
        for header in &headers {
            let value = parts
                .headers
                .get(header.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .unwrap_or_default();
            if !value.is_empty() {
                return Ok(value.to_string());
            }
        }

        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .ok_or_else(|| "no client address on request".into())
    })
}

/// Limit by the value of one header, failing when it is absent.
pub fn header_key_fn(header: impl Into<String>) -> KeyFn {
    let header = header.into();
    Arc::new(move |parts: &Parts| -> Result<String, KeyError> {
        parts
            .headers
            .get(header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| format!("missing {} header", header).into())
    })
}
