//! Error types for trace context parsing.

use thiserror::Error;

/// Errors produced while parsing a `traceparent` header value.
///
/// [`extract`](crate::extract) never surfaces these: a malformed header is
/// treated the same as a missing one. They are public for callers that parse
/// headers directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceParentError {
    /// Wrong number of `-` separated fields for the declared version.
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    /// A field had the wrong length or contained non lowercase-hex characters.
    #[error("invalid {field} field: {value:?}")]
    InvalidField { field: &'static str, value: String },

    /// Version `ff` is reserved as invalid.
    #[error("version ff is forbidden")]
    ForbiddenVersion,

    /// The trace id was all zeros.
    #[error("trace id is all zeros")]
    ZeroTraceId,

    /// The parent span id was all zeros.
    #[error("span id is all zeros")]
    ZeroSpanId,
}

impl TraceParentError {
    pub(crate) fn invalid(field: &'static str, value: &str) -> Self {
        Self::InvalidField {
            field,
            value: value.to_string(),
        }
    }
}
