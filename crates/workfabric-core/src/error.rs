//! Error types for the core value layer.
//!
//! Decode failures are split by payload kind so the mapper can apply the
//! right drop policy: malformed envelopes on a manual-ack queue are acked
//! before dropping, while malformed membership events are simply ignored.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Payload could not be decoded as an envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Payload could not be decoded as a cluster membership event.
    #[error("malformed cluster event: {0}")]
    MalformedEvent(String),

    /// Envelope or event could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Selector name not one of `least_loaded`, `random`, `round_robin`, `all`.
    #[error("unknown selector: {0}")]
    UnknownSelector(String),

    /// Serialization format tag not recognized by this build.
    #[error("unknown serialization format: {0}")]
    UnknownFormat(String),
}

pub type Result<T> = std::result::Result<T, Error>;
