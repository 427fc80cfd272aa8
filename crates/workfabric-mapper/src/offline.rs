//! Offline Redeliverer
//!
//! Consumer of the durable `mapper-offline` queue, in manual-ack mode.
//! A delivery is acknowledged only once it has been re-dispatched to a
//! live target; a request that still has no target stays unacked, and
//! the periodic `recover` sweep re-offers it on a later pass. The broker
//! owns all retry bookkeeping.
//!
//! Any mapper may drain the queue, including one that did not park the
//! message, so `from`/`reply_to` are rewritten to the draining mapper's
//! identity before selection. The original caller is unreachable by
//! then: re-dispatched jobs are allocated without a completion handle
//! and the path is at-least-once, fire-and-forget.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use workfabric_broker::{BoxFuture, Broker, Delivery, DeliveryHandler};
use workfabric_core::Codec;

use crate::cluster::ClusterRegistry;
use crate::warden::JobWarden;

pub(crate) struct OfflineRedeliverer {
    identity: String,
    broker: Arc<dyn Broker>,
    codec: Arc<dyn Codec>,
    cluster: Arc<ClusterRegistry>,
    warden: Arc<JobWarden>,
}

impl OfflineRedeliverer {
    pub(crate) fn new(
        identity: String,
        broker: Arc<dyn Broker>,
        codec: Arc<dyn Codec>,
        cluster: Arc<ClusterRegistry>,
        warden: Arc<JobWarden>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            broker,
            codec,
            cluster,
            warden,
        })
    }

    pub(crate) fn handler(self: &Arc<Self>) -> DeliveryHandler {
        let redeliverer = Arc::clone(self);
        Arc::new(move |delivery| -> BoxFuture<'static, ()> {
            let redeliverer = Arc::clone(&redeliverer);
            Box::pin(async move { redeliverer.redeliver(delivery).await })
        })
    }

    async fn redeliver(&self, delivery: Delivery) {
        let mut envelope = match self.codec.decode_envelope(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Ack it anyway: a payload that cannot decode now never
                // will, and leaving it unacked makes a poison pill.
                warn!(error = %e, "acking malformed offline message");
                self.ack(&delivery).await;
                return;
            }
        };

        // A different mapper may have parked this request; replies must
        // come back to whoever is re-dispatching it.
        envelope.from = self.identity.clone();
        envelope.reply_to = Some(self.identity.clone());

        let targets = self.cluster.targets_for(&envelope);
        if targets.is_empty() {
            // Leave it unacked; the next recover sweep re-offers it.
            debug!(
                route = %envelope.route,
                token = %envelope.token,
                "offline request still has no targets"
            );
            return;
        }

        self.ack(&delivery).await;
        match self.warden.new_detached_job(&envelope, &targets) {
            Ok(()) => {
                info!(
                    route = %envelope.route,
                    token = %envelope.token,
                    targets = targets.len(),
                    redelivered = delivery.redelivered,
                    "redelivering offline request"
                );
                if let Err(e) = self.cluster.route(&envelope, &targets).await {
                    error!(token = %envelope.token, error = %e, "offline re-dispatch failed");
                }
            }
            // A redelivered copy raced a still-live job for the same
            // token (an ack lost mid-flight). The live job stands.
            Err(e) => error!(token = %envelope.token, error = %e, "dropping offline duplicate"),
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            error!(queue = %delivery.queue, tag = delivery.tag, error = %e, "ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use workfabric_broker::{MemoryBroker, QueueOptions};
    use workfabric_core::{codec_for, Envelope, Format};

    async fn fixture() -> (Arc<MemoryBroker>, Arc<OfflineRedeliverer>, Arc<ClusterRegistry>, Arc<JobWarden>) {
        let broker = Arc::new(MemoryBroker::new());
        let codec = codec_for(Format::Json);
        let cluster = Arc::new(ClusterRegistry::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&codec),
            Duration::from_secs(15),
        ));
        let warden = Arc::new(JobWarden::new());
        let redeliverer = OfflineRedeliverer::new(
            "mapper-test".to_string(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            codec,
            Arc::clone(&cluster),
            Arc::clone(&warden),
        );
        broker
            .declare_queue("mapper-offline", QueueOptions { durable: true, exclusive: false })
            .await
            .unwrap();
        broker
            .subscribe("mapper-offline", true, redeliverer.handler())
            .await
            .unwrap();
        (broker, redeliverer, cluster, warden)
    }

    fn offline_request(route: &str) -> Envelope {
        let mut env = Envelope::new(route, Bytes::from("p"), "mapper-elsewhere");
        env.reply_to = Some("mapper-elsewhere".to_string());
        env.offline_failsafe = true;
        env
    }

    #[tokio::test]
    async fn test_no_targets_leaves_message_unacked() {
        let (broker, _redeliverer, _cluster, warden) = fixture().await;
        let codec = codec_for(Format::Json);
        let env = offline_request("work");
        broker
            .publish("", "mapper-offline", codec.encode_envelope(&env).unwrap(), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(broker.unacked_len("mapper-offline"), 1);
        assert_eq!(warden.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_target_found_acks_and_dispatches() {
        let (broker, _redeliverer, cluster, warden) = fixture().await;
        let codec = codec_for(Format::Json);
        broker
            .declare_queue("C", QueueOptions { durable: true, exclusive: false })
            .await
            .unwrap();
        cluster.observe_register("C", ["work".to_string()].into(), 0.1);

        let env = offline_request("work");
        broker
            .publish("", "mapper-offline", codec.encode_envelope(&env).unwrap(), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(broker.unacked_len("mapper-offline"), 0);
        assert_eq!(warden.active_jobs(), 1);
        assert_eq!(broker.buffered_len("C"), 1);
    }

    #[tokio::test]
    async fn test_redispatched_envelope_replies_to_draining_mapper() {
        let (broker, _redeliverer, cluster, _warden) = fixture().await;
        let codec = codec_for(Format::Json);
        broker
            .declare_queue("C", QueueOptions { durable: true, exclusive: false })
            .await
            .unwrap();
        cluster.observe_register("C", ["work".to_string()].into(), 0.1);

        let env = offline_request("work");
        broker
            .publish("", "mapper-offline", codec.encode_envelope(&env).unwrap(), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Inspect what landed on C's queue.
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: DeliveryHandler = Arc::new(move |delivery| -> BoxFuture<'static, ()> {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(delivery);
            })
        });
        broker.subscribe("C", false, handler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let deliveries = seen.lock().unwrap();
        assert_eq!(deliveries.len(), 1);
        let dispatched = codec.decode_envelope(&deliveries[0].payload).unwrap();
        assert_eq!(dispatched.from, "mapper-test");
        assert_eq!(dispatched.reply_to.as_deref(), Some("mapper-test"));
        assert_eq!(dispatched.token, env.token);
    }

    #[tokio::test]
    async fn test_malformed_offline_message_is_acked_away() {
        let (broker, _redeliverer, _cluster, warden) = fixture().await;
        broker
            .publish("", "mapper-offline", Bytes::from("not an envelope"), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(broker.unacked_len("mapper-offline"), 0);
        assert_eq!(warden.active_jobs(), 0);
    }
}
