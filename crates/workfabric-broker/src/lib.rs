//! Workfabric Broker - The Transport Seam
//!
//! The mapper never talks to a concrete message broker; it consumes the
//! capability set defined by the [`Broker`] trait and holds it as
//! `Arc<dyn Broker>`. Any transport that can offer named queues, fanout
//! exchanges, per-delivery acknowledgement, and `recover` (re-offer of
//! delivered-but-unacked messages) can sit behind it.
//!
//! ## Destinations the fabric uses
//!
//! - a direct queue per agent, named by the agent's identity
//! - an exclusive inbox queue per mapper, bound to a fanout exchange of
//!   the same name, where agents publish replies
//! - the shared `membership` fanout for register/heartbeat/unregister
//! - the durable `mapper-offline` queue for deferred requests
//!
//! ## Delivery model
//!
//! Each queue has at most one subscriber. Deliveries are handed to the
//! subscriber's [`DeliveryHandler`] strictly in publish order for that
//! queue; a handler runs to completion before the next delivery is
//! dispatched. Manual-ack subscriptions keep every delivery in an
//! unacked set until [`Broker::ack`]; [`Broker::recover`] re-offers the
//! whole unacked set with `redelivered` set.
//!
//! [`MemoryBroker`] is the in-process implementation used by the test
//! suite and by single-process deployments.

pub mod error;
pub mod memory;

pub use error::{BrokerError, Result};
pub use futures::future::BoxFuture;
pub use memory::MemoryBroker;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Options for queue declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Queue (and its buffered messages) survive broker restarts.
    pub durable: bool,
    /// Queue is private to the declaring connection.
    pub exclusive: bool,
}

/// One message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Broker-assigned delivery tag, unique per delivery attempt.
    pub tag: u64,
    /// The published payload.
    pub payload: Bytes,
    /// True when this delivery is a re-offer of an unacked message.
    pub redelivered: bool,
}

/// Async callback invoked once per delivery, in delivery order per queue.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// The broker capability set the mapper consumes.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue. Redeclaring with identical options is a no-op.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Declare a fanout exchange. Idempotent.
    async fn declare_fanout(&self, name: &str) -> Result<()>;

    /// Bind a queue to a fanout exchange.
    async fn bind(&self, queue: &str, exchange: &str) -> Result<()>;

    /// Publish a payload. With an empty `exchange` the message goes
    /// directly to `queue`; otherwise it fans out to every queue bound
    /// to the exchange and `queue` is ignored.
    async fn publish(
        &self,
        exchange: &str,
        queue: &str,
        payload: Bytes,
        persistent: bool,
    ) -> Result<()>;

    /// Attach the queue's single consumer. With `manual_ack`, deliveries
    /// stay outstanding until [`Broker::ack`].
    async fn subscribe(&self, queue: &str, manual_ack: bool, handler: DeliveryHandler)
        -> Result<()>;

    /// Acknowledge one delivery, removing it from the unacked set.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Re-offer every delivered-but-unacked message on the queue.
    async fn recover(&self, queue: &str) -> Result<()>;
}
