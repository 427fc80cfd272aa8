//! Error types for broker operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Operation named a queue that has not been declared.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// Operation named an exchange that has not been declared.
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    /// The queue already has a consumer; one subscriber per queue.
    #[error("queue already has a subscriber: {0}")]
    AlreadySubscribed(String),

    /// Queue redeclared with conflicting options.
    #[error("queue {queue} redeclared with conflicting options")]
    DeclareMismatch { queue: String },
}
