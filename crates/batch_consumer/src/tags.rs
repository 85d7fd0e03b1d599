//! Attribute keys the consumer puts on its spans.
//!
//! Messaging keys follow the OpenTelemetry messaging semantic conventions.

pub const MESSAGING_SYSTEM: &str = "messaging.system";
pub const MESSAGING_DESTINATION_NAME: &str = "messaging.destination.name";
pub const MESSAGING_DESTINATION_KIND: &str = "messaging.destination_kind";
pub const MESSAGING_OPERATION: &str = "messaging.operation";
pub const MESSAGING_BATCH_MESSAGE_COUNT: &str = "messaging.batch.message_count";

/// Why the batch was flushed (`size_threshold`, `timer_elapsed`, `shutdown_drain`)
pub const BATCH_FLUSH_REASON: &str = "batch.flush_reason";
/// Messages whose publisher sent no usable trace context, so no link exists
pub const BATCH_UNLINKED_MESSAGES: &str = "batch.unlinked_messages";
/// Milliseconds from the batch's first message to the start of processing
pub const BATCH_AGE_MS: &str = "batch.age_ms";

/// Baggage key copied onto consumer spans when present
pub const CLIENT_ID: &str = "client.id";

pub const OPERATION_PROCESS: &str = "process";
