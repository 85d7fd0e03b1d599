//! Debug assertion macros for the batching invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so release
//! builds pay nothing for them.

// =============================================================================
// Payload / link pairing
// =============================================================================

/// Assert that the open batch holds exactly one trace context per payload.
///
/// **Invariant**: `payloads.len() == links.len()`
///
/// Used in: `OpenBatch::push()` and `OpenBatch::freeze()`
macro_rules! debug_assert_links_paired {
    ($payloads:expr, $links:expr) => {
        debug_assert!(
            $payloads == $links,
            "pairing violated: {} payloads but {} trace links",
            $payloads,
            $links
        )
    };
}

// =============================================================================
// Bounded batch size
// =============================================================================

/// Assert that a flushed batch never exceeds the size limit.
///
/// **Invariant**: `batch.len() <= batch_size_limit`
///
/// Size is checked on every append, so even timer and drain flushes stay
/// within the limit.
macro_rules! debug_assert_within_limit {
    ($len:expr, $limit:expr) => {
        debug_assert!(
            $len <= $limit,
            "batch of {} messages exceeds limit {}",
            $len,
            $limit
        )
    };
}

// =============================================================================
// No empty flushes
// =============================================================================

/// Assert that a flush never dispatches an empty batch.
///
/// **Invariant**: `flush(reason) → batch.len() > 0`
macro_rules! debug_assert_nonempty_flush {
    ($len:expr, $reason:expr) => {
        debug_assert!($len > 0, "empty batch flushed ({})", $reason)
    };
}

pub(crate) use debug_assert_links_paired;
pub(crate) use debug_assert_nonempty_flush;
pub(crate) use debug_assert_within_limit;
