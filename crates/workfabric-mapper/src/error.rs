//! Error types for mapper operations.
//!
//! Only failures the caller can act on surface here. Transient broker
//! faults on the dispatch paths are logged and swallowed (the adaptor is
//! expected to reconnect), and "no eligible target" is not an error at
//! all - it comes back as a [`crate::Dispatch`] sentinel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MapperError>;

#[derive(Debug, Error)]
pub enum MapperError {
    /// A job is already registered under this correlation token.
    ///
    /// Tokens are uuid v4; a collision points at a broken identity
    /// generator. The call is not retried.
    #[error("duplicate correlation token: {0}")]
    DuplicateToken(String),

    /// Operation requires `start()` first.
    #[error("mapper not started")]
    NotStarted,

    /// `start()` called on a running mapper.
    #[error("mapper already started")]
    AlreadyStarted,

    /// Builder or config rejected at construction time.
    #[error("invalid mapper configuration: {0}")]
    InvalidConfig(String),

    /// The warden dropped this job's completion slot without resolving
    /// it, which only happens when the mapper itself is torn down.
    #[error("job abandoned before completion")]
    JobAbandoned,

    /// Envelope or event could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] workfabric_core::Error),

    /// Broker operation failed outside the log-and-continue paths.
    #[error(transparent)]
    Broker(#[from] workfabric_broker::BrokerError),
}
