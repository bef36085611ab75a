//! Bucket encoding in the backing store.
//!
//! A bucket is one hash with three decimal fields. The field names match the
//! layout other limiter deployments already write, so several services can
//! share one keyspace.

use thiserror::Error;

/// Maximum points per window.
pub const LIMIT_FIELD: &str = "max_points";
/// Points left in the current window.
pub const REMAINING_FIELD: &str = "actual_points";
/// Window end, in nanoseconds since the Unix epoch.
pub const RESET_TIME_FIELD: &str = "reset_time";

/// Field order used for every read and write.
pub const FIELDS: [&str; 3] = [LIMIT_FIELD, REMAINING_FIELD, RESET_TIME_FIELD];

/// Reasons a stored bucket cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },
    #[error("field {0} is missing")]
    MissingField(&'static str),
    #[error("field {field} is not an unsigned integer: {value:?}")]
    Unparsable { field: &'static str, value: String },
    #[error("remaining {remaining} exceeds limit {limit}")]
    RemainingExceedsLimit { remaining: u64, limit: u64 },
}

/// Rate limit state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: u64,
}

impl Bucket {
    /// A full bucket for a new window.
    pub fn fresh(limit: u64, reset_time: u64) -> Self {
        Self {
            limit,
            remaining: limit,
            reset_time,
        }
    }

    /// Field/value pairs in [`FIELDS`] order.
    pub fn encode(&self) -> Vec<(String, String)> {
        vec![
            (LIMIT_FIELD.to_string(), self.limit.to_string()),
            (REMAINING_FIELD.to_string(), self.remaining.to_string()),
            (RESET_TIME_FIELD.to_string(), self.reset_time.to_string()),
        ]
    }

    /// Decode values read in [`FIELDS`] order.
    ///
    /// Returns `Ok(None)` when every field is absent.
    pub fn decode(values: &[Option<String>]) -> Result<Option<Self>, CodecError> {
        if values.len() != FIELDS.len() {
            return Err(CodecError::FieldCount {
                expected: FIELDS.len(),
                got: values.len(),
            });
        }
        if values.iter().all(Option::is_none) {
            return Ok(None);
        }

        let limit = parse(LIMIT_FIELD, &values[0])?;
        let remaining = parse(REMAINING_FIELD, &values[1])?;
        let reset_time = parse(RESET_TIME_FIELD, &values[2])?;

        if remaining > limit {
            return Err(CodecError::RemainingExceedsLimit { remaining, limit });
        }

        Ok(Some(Self {
            limit,
            remaining,
            reset_time,
        }))
    }
}

fn parse(field: &'static str, value: &Option<String>) -> Result<u64, CodecError> {
    let raw = value.as_deref().ok_or(CodecError::MissingField(field))?;
    raw.parse().map_err(|_| CodecError::Unparsable {
        field,
        value: raw.to_string(),
    })
}
