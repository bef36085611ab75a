//! Ratekeeper - Fixed-Window Request Admission Control
//!
//! This crate limits how often a key (typically a client IP) may be admitted
//! within a fixed time window. Bucket state lives in a shared key-value store
//! (Redis, or an in-process map for a single instance) and is updated with
//! atomic server-side operations, so every instance sharing the store
//! enforces one global limit. A tower middleware applies the limiter to HTTP
//! requests and reports the outcome through `X-RateLimit-*` headers.

pub mod admission;
pub mod backend;
pub mod config;
pub mod error;
pub mod ratelimit;
