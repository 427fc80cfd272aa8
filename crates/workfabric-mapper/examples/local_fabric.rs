//! Local Fabric Example
//!
//! Runs a complete fabric in one process: an in-memory broker, a mapper,
//! and two workers that register over the membership fanout and answer
//! requests on their direct queues.
//!
//! Run with: cargo run --example local_fabric

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use workfabric_broker::{BoxFuture, Broker, DeliveryHandler, MemoryBroker, QueueOptions};
use workfabric_core::{codec_for, ClusterEvent, Codec, Envelope, Format, Selector};
use workfabric_mapper::{Dispatch, Mapper, RequestOptions, MEMBERSHIP_EXCHANGE};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// A worker that uppercases request payloads addressed to "shout".
async fn start_worker(
    broker: Arc<MemoryBroker>,
    codec: Arc<dyn Codec>,
    identity: &str,
    status: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    broker
        .declare_queue(identity, QueueOptions { durable: true, exclusive: false })
        .await?;

    let handler_broker: Arc<dyn Broker> = Arc::clone(&broker) as Arc<dyn Broker>;
    let handler_codec = Arc::clone(&codec);
    let worker = identity.to_string();
    let handler: DeliveryHandler = Arc::new(move |delivery| -> BoxFuture<'static, ()> {
        let broker = Arc::clone(&handler_broker);
        let codec = Arc::clone(&handler_codec);
        let worker = worker.clone();
        Box::pin(async move {
            let Ok(request) = codec.decode_envelope(&delivery.payload) else {
                return;
            };
            info!(worker = %worker, route = %request.route, "handling request");
            if let Some(reply_to) = request.reply_to.clone() {
                let answer = String::from_utf8_lossy(&request.payload).to_uppercase();
                let reply = Envelope::reply(&request, &worker, Bytes::from(answer));
                if let Ok(bytes) = codec.encode_envelope(&reply) {
                    let _ = broker.publish(&reply_to, "", bytes, false).await;
                }
            }
        })
    });
    broker.subscribe(identity, false, handler).await?;

    // Announce the worker to every listening mapper.
    let event = ClusterEvent::Register {
        identity: identity.to_string(),
        services: BTreeSet::from(["shout".to_string()]),
        status,
    };
    broker
        .publish(MEMBERSHIP_EXCHANGE, "", codec.encode_event(&event)?, false)
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let broker = Arc::new(MemoryBroker::new());
    let codec = codec_for(Format::Json);

    let mapper = Mapper::builder()
        .identity("example")
        .offline_redelivery_frequency(Duration::from_secs(1))
        .broker(Arc::clone(&broker) as Arc<dyn Broker>)
        .build()?;
    mapper.start().await?;
    info!("mapper running as {}", mapper.identity());

    // A request parked before any worker exists...
    let parked = mapper
        .request("shout", "deferred", RequestOptions::offline_failsafe())
        .await?;
    assert!(matches!(parked, Dispatch::Offline));
    info!("request parked on the offline queue");

    // ...then two workers come up.
    start_worker(Arc::clone(&broker), Arc::clone(&codec), "worker-1", 0.2).await?;
    start_worker(Arc::clone(&broker), Arc::clone(&codec), "worker-2", 0.7).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("live agents: {}", mapper.agent_count());

    // Request with a reply: least-loaded picks worker-1.
    match mapper.request("shout", "hello fabric", RequestOptions::default()).await? {
        Dispatch::Accepted(job) => {
            let outcome = job.outcome().await?;
            for (worker, payload) in &outcome.results {
                info!(worker = %worker, reply = %String::from_utf8_lossy(payload), "reply");
            }
        }
        other => info!(?other, "request was not dispatched"),
    }

    // Fan-out push: both workers see it, nobody replies.
    mapper
        .push("shout", "broadcast", RequestOptions::selector(Selector::All))
        .await?;

    // Give the redelivery sweep a chance to drain the parked request.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    info!(active_jobs = mapper.active_jobs(), "offline request re-dispatched");

    mapper.stop().await?;
    info!("mapper stopped");
    Ok(())
}
