//! Rate limiting logic and state management.

pub mod bucket;
mod noop;
pub mod rules;
mod shared;
mod store;
pub mod tags;

pub use bucket::{Bucket, CodecError};
pub use noop::NoopStore;
pub use rules::{ExceptionRule, ExceptionRules, TimeUnit};
pub use shared::{SharedStore, StoreConfig, DEFAULT_OP_TIMEOUT, DEFAULT_PREFIX};
pub use store::{Decision, ExclFn, Quota, Store};
pub use tags::TagIndex;
