//! Tower middleware that admits or rejects requests using a [`Store`].

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::format::{Item, StrftimeItems};
use chrono::{TimeZone, Utc};
use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::request::Parts;
use http::{HeaderMap, Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::{debug, error, trace, warn};

use super::key::KeyFn;
use crate::error::{RatekeeperError, Result};
use crate::ratelimit::{Decision, ExclFn, Store};

/// Maximum number of calls per window.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Calls left before requests are rejected.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// When the window resets, rendered with the configured date format.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// IMF-fixdate, the preferred HTTP date format.
pub const DEFAULT_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Decides per call whether to bypass limiting entirely.
pub type Skipper = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
struct Settings {
    key_fn: Option<KeyFn>,
    skipper: Option<Skipper>,
    exceptions: Option<Arc<ExclFn>>,
    date_format: String,
}

impl Settings {
    /// Render the rate limit headers for a decision.
    fn headers(&self, decision: &Decision) -> Result<HeaderMap> {
        let reset = decision.reset_at().format(&self.date_format).to_string();
        let reset = HeaderValue::try_from(reset)
            .map_err(|e| RatekeeperError::Config(format!("unrenderable reset time: {}", e)))?;

        let mut headers = HeaderMap::with_capacity(4);
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
        if !decision.admitted {
            headers.insert(RETRY_AFTER, reset.clone());
        }
        headers.insert(X_RATELIMIT_RESET, reset);
        Ok(headers)
    }
}

/// Check that `format` is a strftime pattern chrono renders into a valid
/// header value.
fn validate_date_format(format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(RatekeeperError::Config(format!(
            "invalid date format {:?}",
            format
        )));
    }
    let sample = Utc.timestamp_nanos(0).format(format).to_string();
    HeaderValue::try_from(sample).map_err(|_| {
        RatekeeperError::Config(format!(
            "date format {:?} does not render a valid header value",
            format
        ))
    })?;
    Ok(())
}

/// A layer that enforces rate limits using a [`Store`].
///
/// Every request is keyed with the configured key function and charged one
/// permit. Admitted responses carry `X-RateLimit-Limit`,
/// `X-RateLimit-Remaining` and `X-RateLimit-Reset`; rejected ones are
/// answered `429 Too Many Requests` with `Retry-After` and never reach the
/// inner service. A missing key function, a failing key function or a failing
/// store produce a bare `500 Internal Server Error`.
pub struct RateLimitLayer<St> {
    store: Arc<St>,
    settings: Settings,
}

impl<St> Clone for RateLimitLayer<St> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<St> fmt::Debug for RateLimitLayer<St> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("has_key_fn", &self.settings.key_fn.is_some())
            .field("has_skipper", &self.settings.skipper.is_some())
            .field("has_exceptions", &self.settings.exceptions.is_some())
            .field("date_format", &self.settings.date_format)
            .finish()
    }
}

impl<St: Store> RateLimitLayer<St> {
    /// Create a new rate limit layer.
    pub fn new(store: St) -> Self {
        Self::from_shared(Arc::new(store))
    }

    /// Create a layer over a store that is also used elsewhere.
    pub fn from_shared(store: Arc<St>) -> Self {
        Self {
            store,
            settings: Settings {
                key_fn: None,
                skipper: None,
                exceptions: None,
                date_format: DEFAULT_DATE_FORMAT.to_string(),
            },
        }
    }

    /// Set the function deriving the limiter key from a request.
    pub fn key_fn(mut self, key_fn: KeyFn) -> Self {
        self.settings.key_fn = Some(key_fn);
        self
    }

    /// Bypass limiting whenever `skipper` returns `true`.
    pub fn skipper<F>(mut self, skipper: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.settings.skipper = Some(Arc::new(skipper));
        self
    }

    /// Take permits with per-key quota exceptions.
    pub fn exceptions(mut self, excl: Arc<ExclFn>) -> Self {
        self.settings.exceptions = Some(excl);
        self
    }

    /// Set the strftime format used for `X-RateLimit-Reset` and
    /// `Retry-After`.
    pub fn date_format(mut self, format: impl Into<String>) -> Result<Self> {
        let format = format.into();
        validate_date_format(&format)?;
        self.settings.date_format = format;
        Ok(self)
    }

    pub fn store(&self) -> &Arc<St> {
        &self.store
    }
}

impl<S, St> Layer<S> for RateLimitLayer<St> {
    type Service = RateLimitService<S, St>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            store: self.store.clone(),
            settings: Arc::new(self.settings.clone()),
        }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<S, St> {
    inner: S,
    store: Arc<St>,
    settings: Arc<Settings>,
}

impl<S: Clone, St> Clone for RateLimitService<S, St> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            store: self.store.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S: fmt::Debug, St> fmt::Debug for RateLimitService<S, St> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

/// Derive the key and take a permit for it.
async fn admit<St: Store + ?Sized>(
    store: &St,
    settings: &Settings,
    parts: &Parts,
) -> Result<Decision> {
    let key_fn = settings
        .key_fn
        .as_ref()
        .ok_or_else(|| RatekeeperError::Config("no key function configured".to_string()))?;
    let key = key_fn(parts).map_err(|e| RatekeeperError::KeyExtraction(e.to_string()))?;

    match &settings.exceptions {
        Some(excl) => store.take_excl(&key, excl.as_ref()).await,
        None => store.take(&key).await,
    }
}

fn status_only<B: Default>(status: StatusCode) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = status;
    response
}

impl<S, St, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, St>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    St: Store + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Keep the service that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let store = self.store.clone();
        let settings = self.settings.clone();

        Box::pin(async move {
            if settings.skipper.as_ref().map_or(false, |skip| skip()) {
                trace!(uri = %req.uri(), "Rate limiting skipped");
                return inner.call(req).await;
            }

            let (parts, body) = req.into_parts();

            let decision = match admit(store.as_ref(), &settings, &parts).await {
                Ok(decision) => decision,
                Err(err @ RatekeeperError::KeyExtraction(_)) => {
                    warn!(uri = %parts.uri, error = %err, "Rejecting request without a limiter key");
                    return Ok(status_only(StatusCode::INTERNAL_SERVER_ERROR));
                }
                Err(err) => {
                    error!(uri = %parts.uri, error = %err, "Rate limit check failed");
                    return Ok(status_only(StatusCode::INTERNAL_SERVER_ERROR));
                }
            };

            let headers = match settings.headers(&decision) {
                Ok(headers) => headers,
                Err(err) => {
                    error!(error = %err, "Failed to render rate limit headers");
                    return Ok(status_only(StatusCode::INTERNAL_SERVER_ERROR));
                }
            };

            if !decision.admitted {
                debug!(
                    uri = %parts.uri,
                    limit = decision.limit,
                    reset_time = decision.reset_time,
                    "Request rejected"
                );
                let mut response = status_only(StatusCode::TOO_MANY_REQUESTS);
                response.headers_mut().extend(headers);
                return Ok(response);
            }

            let mut response = inner.call(Request::from_parts(parts, body)).await?;
            response.headers_mut().extend(headers);
            Ok(response)
        })
    }
}
