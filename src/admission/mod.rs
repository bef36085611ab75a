//! HTTP admission control: key extraction, the rate limit middleware and the
//! server that hosts it.

pub mod key;
mod layer;
mod server;

pub use key::{header_key_fn, ip_key_fn, KeyError, KeyFn};
pub use layer::{
    RateLimitLayer, RateLimitService, Skipper, DEFAULT_DATE_FORMAT, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::HttpServer;
