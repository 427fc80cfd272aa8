//! End-to-end dispatch scenarios over the in-memory broker: one mapper,
//! in-process workers subscribed to their direct queues, membership
//! driven through the shared fanout exactly as real agents drive it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use workfabric_broker::{BoxFuture, Broker, DeliveryHandler, MemoryBroker, QueueOptions};
use workfabric_core::{codec_for, ClusterEvent, Codec, Envelope, Format, Selector};
use workfabric_mapper::{Dispatch, JobState, Mapper, RequestOptions, MEMBERSHIP_EXCHANGE};

async fn fabric(identity: &str) -> (Arc<MemoryBroker>, Arc<dyn Codec>, Mapper) {
    let broker = Arc::new(MemoryBroker::new());
    let codec = codec_for(Format::Json);
    let mapper = Mapper::builder()
        .identity(identity)
        .broker(Arc::clone(&broker) as Arc<dyn Broker>)
        .build()
        .unwrap();
    mapper.start().await.unwrap();
    (broker, codec, mapper)
}

async fn register(broker: &Arc<MemoryBroker>, codec: &Arc<dyn Codec>, identity: &str, routes: &[&str], status: f64) {
    let event = ClusterEvent::Register {
        identity: identity.to_string(),
        services: routes.iter().map(|r| r.to_string()).collect::<BTreeSet<String>>(),
        status,
    };
    broker
        .publish(MEMBERSHIP_EXCHANGE, "", codec.encode_event(&event).unwrap(), false)
        .await
        .unwrap();
    settle().await;
}

/// Subscribe a worker to its direct queue. Every request it sees is
/// recorded; requests carrying a reply address get `reply_payload` back.
async fn spawn_worker(
    broker: &Arc<MemoryBroker>,
    codec: &Arc<dyn Codec>,
    identity: &str,
    reply_payload: Option<&'static str>,
) -> Arc<Mutex<Vec<Envelope>>> {
    broker
        .declare_queue(identity, QueueOptions { durable: true, exclusive: false })
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler_broker: Arc<dyn Broker> = Arc::clone(broker) as Arc<dyn Broker>;
    let handler_codec = Arc::clone(codec);
    let worker = identity.to_string();
    let handler: DeliveryHandler = Arc::new(move |delivery| -> BoxFuture<'static, ()> {
        let broker = Arc::clone(&handler_broker);
        let codec = Arc::clone(&handler_codec);
        let sink = Arc::clone(&sink);
        let worker = worker.clone();
        Box::pin(async move {
            let Ok(request) = codec.decode_envelope(&delivery.payload) else {
                return;
            };
            sink.lock().unwrap().push(request.clone());
            if let (Some(reply_to), Some(payload)) = (request.reply_to.clone(), reply_payload) {
                let reply = Envelope::reply(&request, &worker, Bytes::from(payload));
                let bytes = codec.encode_envelope(&reply).unwrap();
                let _ = broker.publish(&reply_to, "", bytes, false).await;
            }
        })
    });
    broker.subscribe(identity, false, handler).await.unwrap();
    seen
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_single_target_request_reply() {
    let (broker, codec, mapper) = fabric("s1").await;
    let seen = spawn_worker(&broker, &codec, "A", Some("3")).await;
    register(&broker, &codec, "A", &["hash"], 0.1).await;

    let dispatch = mapper
        .request("hash", "abc", RequestOptions::default())
        .await
        .unwrap();
    let job = dispatch.into_job().expect("agent A was live");
    assert_eq!(job.targets().len(), 1);
    assert!(job.targets().contains("A"));

    let outcome = job.outcome().await.unwrap();
    assert_eq!(outcome.state, JobState::Completed);
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results["A"], Bytes::from("3"));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].route, "hash");
    assert_eq!(seen[0].payload, Bytes::from("abc"));
    assert_eq!(seen[0].from, "mapper-s1");
    assert_eq!(seen[0].reply_to.as_deref(), Some("mapper-s1"));
    assert_eq!(mapper.active_jobs(), 0);
}

#[tokio::test]
async fn test_push_fans_out_to_every_holder() {
    let (broker, codec, mapper) = fabric("s2").await;
    let seen_a = spawn_worker(&broker, &codec, "A", None).await;
    let seen_b = spawn_worker(&broker, &codec, "B", None).await;
    register(&broker, &codec, "A", &["log"], 0.3).await;
    register(&broker, &codec, "B", &["log"], 0.1).await;

    let delivered = mapper
        .push("log", "evt", RequestOptions::selector(Selector::All))
        .await
        .unwrap();
    assert!(delivered);
    settle().await;

    assert_eq!(seen_a.lock().unwrap().len(), 1);
    assert_eq!(seen_b.lock().unwrap().len(), 1);
    // Pushes carry no reply address and allocate no job.
    assert!(seen_a.lock().unwrap()[0].reply_to.is_none());
    assert_eq!(mapper.active_jobs(), 0);
}

#[tokio::test]
async fn test_push_with_no_holders_silently_drops() {
    let (_broker, _codec, mapper) = fabric("push-empty").await;
    let delivered = mapper
        .push("nowhere", "evt", RequestOptions::default())
        .await
        .unwrap();
    assert!(delivered);
    assert_eq!(mapper.active_jobs(), 0);
}

#[tokio::test]
async fn test_unknown_token_reply_leaves_warden_untouched() {
    let (broker, codec, mapper) = fabric("s6").await;

    let mut stray = Envelope::new("hash", Bytes::from("3"), "A");
    stray.token = "xyz".to_string();
    broker
        .publish("mapper-s6", "", codec.encode_envelope(&stray).unwrap(), false)
        .await
        .unwrap();
    settle().await;

    assert_eq!(mapper.active_jobs(), 0);
}

#[tokio::test]
async fn test_malformed_reply_is_dropped() {
    let (broker, _codec, mapper) = fabric("garbled").await;
    broker
        .publish("mapper-garbled", "", Bytes::from("not an envelope"), false)
        .await
        .unwrap();
    settle().await;
    assert_eq!(mapper.active_jobs(), 0);
}

#[tokio::test]
async fn test_cancel_resolves_with_partial_results() {
    let (broker, codec, mapper) = fabric("cancel").await;
    // A worker that never replies.
    let _seen = spawn_worker(&broker, &codec, "A", None).await;
    register(&broker, &codec, "A", &["slow"], 0.1).await;

    let job = mapper
        .request("slow", "p", RequestOptions::default())
        .await
        .unwrap()
        .into_job()
        .unwrap();
    assert_eq!(mapper.active_jobs(), 1);

    let token = job.token().to_string();
    assert!(mapper.cancel(&token));
    let outcome = job.outcome().await.unwrap();
    assert_eq!(outcome.state, JobState::Cancelled);
    assert!(outcome.results.is_empty());
    assert_eq!(mapper.active_jobs(), 0);
}

#[tokio::test]
async fn test_explicit_target_overrides_selector() {
    let (broker, codec, mapper) = fabric("target").await;
    let seen_a = spawn_worker(&broker, &codec, "A", Some("ra")).await;
    let seen_b = spawn_worker(&broker, &codec, "B", Some("rb")).await;
    // A reports far less load; the explicit target must still win.
    register(&broker, &codec, "A", &["s"], 0.0).await;
    register(&broker, &codec, "B", &["s"], 9.9).await;

    let job = mapper
        .request("s", "p", RequestOptions::target("B"))
        .await
        .unwrap()
        .into_job()
        .unwrap();
    let outcome = job.outcome().await.unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results["B"], Bytes::from("rb"));
    assert!(seen_a.lock().unwrap().is_empty());
    assert_eq!(seen_b.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_explicit_target_without_route_goes_nowhere() {
    let (broker, codec, mapper) = fabric("target-miss").await;
    let _seen = spawn_worker(&broker, &codec, "A", Some("r")).await;
    register(&broker, &codec, "A", &["hash"], 0.1).await;

    let dispatch = mapper
        .request("log", "p", RequestOptions::target("A"))
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::NoTargets));
}

#[tokio::test]
async fn test_round_robin_cycles_through_workers() {
    let (broker, codec, mapper) = fabric("rr").await;
    for id in ["A", "B", "C"] {
        spawn_worker(&broker, &codec, id, Some("ok")).await;
        register(&broker, &codec, id, &["s"], 0.1).await;
    }

    let mut picks = Vec::new();
    for _ in 0..4 {
        let job = mapper
            .request("s", "x", RequestOptions::selector(Selector::RoundRobin))
            .await
            .unwrap()
            .into_job()
            .unwrap();
        picks.push(job.targets().iter().next().unwrap().clone());
        job.outcome().await.unwrap();
    }
    assert_eq!(picks, vec!["A", "B", "C", "A"]);
}

#[tokio::test]
async fn test_request_fanout_collates_all_replies() {
    let (broker, codec, mapper) = fabric("collate").await;
    let _a = spawn_worker(&broker, &codec, "A", Some("ra")).await;
    let _b = spawn_worker(&broker, &codec, "B", Some("rb")).await;
    register(&broker, &codec, "A", &["scan"], 0.1).await;
    register(&broker, &codec, "B", &["scan"], 0.2).await;

    let job = mapper
        .request("scan", "p", RequestOptions::selector(Selector::All))
        .await
        .unwrap()
        .into_job()
        .unwrap();
    let outcome = job.outcome().await.unwrap();
    assert_eq!(outcome.state, JobState::Completed);
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(outcome.results["A"], Bytes::from("ra"));
    assert_eq!(outcome.results["B"], Bytes::from("rb"));
}
