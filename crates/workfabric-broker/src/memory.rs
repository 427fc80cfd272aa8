//! In-Memory Broker
//!
//! In-process implementation of the [`Broker`] trait used by the test
//! suite and by single-process deployments. Queues, fanout exchanges,
//! bindings, and unacked bookkeeping all live in one mutex-guarded map;
//! each subscription gets a dedicated dispatch task fed by an unbounded
//! channel, which is what guarantees per-queue delivery order: the task
//! awaits the handler for one delivery before pulling the next.
//!
//! Durability flags are accepted and ignored - nothing here survives the
//! process. `recover` re-offers every delivered-but-unacked message with
//! a fresh delivery tag and `redelivered` set, which is exactly the
//! mechanism the mapper's offline sweep leans on.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::{Broker, Delivery, DeliveryHandler, QueueOptions};

/// In-process broker backing a single fabric.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    fanouts: HashMap<String, BTreeSet<String>>,
    next_tag: u64,
}

struct Queue {
    options: QueueOptions,
    /// Messages published before any subscriber attached.
    buffered: VecDeque<Bytes>,
    /// Delivered but not yet acknowledged, keyed by delivery tag.
    unacked: BTreeMap<u64, Bytes>,
    feed: Option<Feed>,
}

struct Feed {
    tx: mpsc::UnboundedSender<Delivery>,
    manual_ack: bool,
}

impl Queue {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            buffered: VecDeque::new(),
            unacked: BTreeMap::new(),
            feed: None,
        }
    }
}

impl BrokerState {
    /// Hand one payload to the queue's feed, or buffer it when the queue
    /// has no subscriber.
    fn deliver(&mut self, queue_name: &str, payload: Bytes, redelivered: bool) {
        let tag = self.next_tag;
        let Some(queue) = self.queues.get_mut(queue_name) else {
            debug!(queue = queue_name, "dropping unroutable publish");
            return;
        };
        match &queue.feed {
            Some(feed) => {
                self.next_tag += 1;
                if feed.manual_ack {
                    queue.unacked.insert(tag, payload.clone());
                }
                let delivery = Delivery {
                    queue: queue_name.to_string(),
                    tag,
                    payload,
                    redelivered,
                };
                // The dispatch task lives as long as the feed sender does.
                let _ = feed.tx.send(delivery);
            }
            None => queue.buffered.push_back(payload),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages parked on the queue with no subscriber attached.
    pub fn buffered_len(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.queues.get(queue).map_or(0, |q| q.buffered.len())
    }

    /// Deliveries outstanding on a manual-ack subscription.
    pub fn unacked_len(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.queues.get(queue).map_or(0, |q| q.unacked.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.queues.get(name) {
            Some(existing) if existing.options != options => Err(BrokerError::DeclareMismatch {
                queue: name.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(name.to_string(), Queue::new(options));
                Ok(())
            }
        }
    }

    async fn declare_fanout(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.fanouts.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        match state.fanouts.get_mut(exchange) {
            Some(bound) => {
                bound.insert(queue.to_string());
                Ok(())
            }
            None => Err(BrokerError::UnknownExchange(exchange.to_string())),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        queue: &str,
        payload: Bytes,
        _persistent: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if exchange.is_empty() {
            // Direct publish; unroutable messages are dropped, as a real
            // broker's default exchange would.
            state.deliver(queue, payload, false);
            return Ok(());
        }

        let bound = match state.fanouts.get(exchange) {
            Some(bound) => bound.clone(),
            None => return Err(BrokerError::UnknownExchange(exchange.to_string())),
        };
        for name in bound {
            state.deliver(&name, payload.clone(), false);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        manual_ack: bool,
        handler: DeliveryHandler,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        if q.feed.is_some() {
            return Err(BrokerError::AlreadySubscribed(queue.to_string()));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        tokio::spawn(async move {
            // One delivery at a time: the await here is the ordering
            // guarantee for the queue.
            while let Some(delivery) = rx.recv().await {
                handler(delivery).await;
            }
        });

        // Everything published before the subscriber attached flows
        // through the new feed in its original order.
        let parked: Vec<Bytes> = q.buffered.drain(..).collect();
        q.feed = Some(Feed { tx, manual_ack });
        for payload in parked {
            state.deliver(queue, payload, false);
        }
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let q = state
            .queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| BrokerError::UnknownQueue(delivery.queue.clone()))?;
        // Acking a tag that recover already re-keyed is a no-op.
        q.unacked.remove(&delivery.tag);
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

        let outstanding: Vec<Bytes> = std::mem::take(&mut q.unacked).into_values().collect();
        if outstanding.is_empty() {
            return Ok(());
        }
        debug!(queue, count = outstanding.len(), "recovering unacked deliveries");
        if q.feed.is_some() {
            for payload in outstanding {
                state.deliver(queue, payload, true);
            }
        } else {
            // Subscriber went away; park the messages ahead of anything
            // published since.
            for payload in outstanding.into_iter().rev() {
                q.buffered.push_front(payload);
            }
        }
        Ok(())
    }
}
