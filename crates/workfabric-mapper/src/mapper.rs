//! Mapper Façade - Lifecycle and Dispatch
//!
//! The [`Mapper`] is the control node callers talk to. Built via
//! [`Mapper::builder`], it owns the cluster registry and the job warden
//! and wires them to the broker on [`Mapper::start`]:
//!
//! 1. an exclusive inbox queue named after the mapper, bound to a fanout
//!    exchange of the same name, feeding replies into the warden
//! 2. an exclusive queue on the shared `membership` fanout, feeding
//!    register/heartbeat/unregister events into the registry
//! 3. a manual-ack subscription on the durable `mapper-offline` queue
//!    for the redeliverer
//! 4. two periodic tickers: the heartbeat reaper and the offline
//!    `recover` sweep
//!
//! ## Dispatch
//!
//! ```text
//! request(route, payload) ──► targets_for ──► non-empty? ──► job + publish per target
//!                                   │                              │
//!                                   │ empty                        ▼
//!                                   ├── offline_failsafe ──► mapper-offline queue
//!                                   └── otherwise        ──► Dispatch::NoTargets
//! ```
//!
//! Replies land on the inbox, the warden matches tokens, and the job
//! handle resolves once every selected target has answered. Completion
//! consumers may call straight back into `request`/`push`; no internal
//! lock is held while user code runs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, warn};
use workfabric_broker::{BoxFuture, Broker, DeliveryHandler, QueueOptions};
use workfabric_core::{codec_for, ClusterEvent, Codec, Envelope, Format, Selector};

use crate::cluster::{AgentRecord, ClusterRegistry};
use crate::config::MapperConfig;
use crate::error::{MapperError, Result};
use crate::offline::OfflineRedeliverer;
use crate::ticker::Ticker;
use crate::warden::{JobHandle, JobWarden};

/// Durable queue holding requests that found no live target.
pub const OFFLINE_QUEUE: &str = "mapper-offline";

/// Fanout exchange agents publish membership events to.
pub const MEMBERSHIP_EXCHANGE: &str = "membership";

/// Per-call dispatch options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Selection policy; ignored when `target` is set.
    pub selector: Selector,
    /// Explicit target identity.
    pub target: Option<String>,
    /// Broker durability for this envelope; defaults to the mapper's
    /// configured flag.
    pub persistent: Option<bool>,
    /// Park the request on the offline queue when no target is live.
    pub offline_failsafe: bool,
}

impl RequestOptions {
    pub fn selector(selector: Selector) -> Self {
        Self {
            selector,
            ..Self::default()
        }
    }

    pub fn target(identity: impl Into<String>) -> Self {
        Self {
            target: Some(identity.into()),
            ..Self::default()
        }
    }

    pub fn offline_failsafe() -> Self {
        Self {
            offline_failsafe: true,
            ..Self::default()
        }
    }
}

/// What became of a `request`.
#[derive(Debug)]
pub enum Dispatch {
    /// Targets were selected; await the handle for collated replies.
    Accepted(JobHandle),
    /// No live target; the request was parked on the offline queue.
    Offline,
    /// No live target and no failsafe; the request went nowhere.
    NoTargets,
}

impl Dispatch {
    /// The job handle, when targets were selected.
    pub fn into_job(self) -> Option<JobHandle> {
        match self {
            Dispatch::Accepted(handle) => Some(handle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapperState {
    Created,
    Started,
    Stopped,
}

/// Control node of the fabric. See the module docs for the wiring.
pub struct Mapper {
    identity: String,
    default_persistent: bool,
    agent_timeout: Duration,
    offline_redelivery_frequency: Duration,
    broker: Arc<dyn Broker>,
    codec: Arc<dyn Codec>,
    cluster: Arc<ClusterRegistry>,
    warden: Arc<JobWarden>,
    state: Mutex<MapperState>,
    tickers: Mutex<Vec<Ticker>>,
}

impl Mapper {
    pub fn builder() -> MapperBuilder {
        MapperBuilder::default()
    }

    /// Build a mapper from a loaded configuration.
    pub fn with_config(config: &MapperConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        Self::builder()
            .identity(&config.identity)
            .format(config.format)
            .agent_timeout(config.agent_timeout)
            .offline_redelivery_frequency(config.offline_redelivery_frequency)
            .persistent(config.persistent)
            .broker(broker)
            .build()
    }

    /// The identity this mapper runs under (`mapper-<prefix>`), which is
    /// also the name of its inbox queue and reply exchange.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Attach to the broker: inbox, membership feed, offline consumer,
    /// and the periodic sweeps.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == MapperState::Started {
                return Err(MapperError::AlreadyStarted);
            }
            *state = MapperState::Started;
        }
        if let Err(e) = self.attach().await {
            *self.state.lock().unwrap() = MapperState::Created;
            return Err(e);
        }

        let reaper = {
            let cluster = Arc::clone(&self.cluster);
            Ticker::every("reaper", self.agent_timeout, move || {
                let cluster = Arc::clone(&cluster);
                async move {
                    cluster.reap_now();
                }
            })
        };
        let recover_sweep = {
            let broker = Arc::clone(&self.broker);
            Ticker::every(
                "offline-recover",
                self.offline_redelivery_frequency,
                move || {
                    let broker = Arc::clone(&broker);
                    async move {
                        if let Err(e) = broker.recover(OFFLINE_QUEUE).await {
                            error!(error = %e, "offline recover sweep failed");
                        }
                    }
                },
            )
        };
        *self.tickers.lock().unwrap() = vec![reaper, recover_sweep];

        info!(
            identity = %self.identity,
            agent_timeout_secs = self.agent_timeout.as_secs(),
            redelivery_secs = self.offline_redelivery_frequency.as_secs(),
            "mapper started"
        );
        Ok(())
    }

    async fn attach(&self) -> Result<()> {
        let exclusive = QueueOptions {
            durable: false,
            exclusive: true,
        };

        // Private inbox: replies fan in through an exchange named after
        // the mapper, so agents only ever publish to an exchange.
        self.broker.declare_fanout(&self.identity).await?;
        self.broker.declare_queue(&self.identity, exclusive).await?;
        self.broker.bind(&self.identity, &self.identity).await?;
        self.broker
            .subscribe(&self.identity, false, self.reply_pump())
            .await?;

        // Membership events from every agent on the fabric.
        let membership_queue = format!("{}-membership", self.identity);
        self.broker.declare_fanout(MEMBERSHIP_EXCHANGE).await?;
        self.broker.declare_queue(&membership_queue, exclusive).await?;
        self.broker.bind(&membership_queue, MEMBERSHIP_EXCHANGE).await?;
        self.broker
            .subscribe(&membership_queue, false, self.membership_pump())
            .await?;

        // Deferred requests, drained cooperatively by every mapper.
        self.broker
            .declare_queue(
                OFFLINE_QUEUE,
                QueueOptions {
                    durable: true,
                    exclusive: false,
                },
            )
            .await?;
        let redeliverer = OfflineRedeliverer::new(
            self.identity.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.codec),
            Arc::clone(&self.cluster),
            Arc::clone(&self.warden),
        );
        self.broker
            .subscribe(OFFLINE_QUEUE, true, redeliverer.handler())
            .await?;
        Ok(())
    }

    fn reply_pump(&self) -> DeliveryHandler {
        let codec = Arc::clone(&self.codec);
        let warden = Arc::clone(&self.warden);
        Arc::new(move |delivery| -> BoxFuture<'static, ()> {
            let codec = Arc::clone(&codec);
            let warden = Arc::clone(&warden);
            Box::pin(async move {
                match codec.decode_envelope(&delivery.payload) {
                    Ok(envelope) => warden.process(&envelope),
                    Err(e) => warn!(error = %e, "dropping malformed reply"),
                }
            })
        })
    }

    fn membership_pump(&self) -> DeliveryHandler {
        let codec = Arc::clone(&self.codec);
        let cluster = Arc::clone(&self.cluster);
        Arc::new(move |delivery| -> BoxFuture<'static, ()> {
            let codec = Arc::clone(&codec);
            let cluster = Arc::clone(&cluster);
            Box::pin(async move {
                match codec.decode_event(&delivery.payload) {
                    Ok(ClusterEvent::Register {
                        identity,
                        services,
                        status,
                    }) => cluster.observe_register(&identity, services, status),
                    Ok(ClusterEvent::Heartbeat { identity, status }) => {
                        cluster.observe_heartbeat(&identity, status)
                    }
                    Ok(ClusterEvent::Unregister { identity }) => {
                        cluster.observe_unregister(&identity)
                    }
                    Err(e) => warn!(error = %e, "dropping malformed membership event"),
                }
            })
        })
    }

    /// Cancel the periodic sweeps. Broker subscriptions stay attached;
    /// pending jobs are deliberately left alone.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != MapperState::Started {
                return Err(MapperError::NotStarted);
            }
            *state = MapperState::Stopped;
        }
        for ticker in self.tickers.lock().unwrap().drain(..) {
            ticker.cancel();
        }
        info!(identity = %self.identity, "mapper stopped");
        Ok(())
    }

    /// Dispatch a request expecting replies.
    ///
    /// Builds an envelope with a fresh token and this mapper as the
    /// reply destination, selects targets, and either hands back a job
    /// handle, parks the request offline, or reports that it went
    /// nowhere. See the module docs for the full flow.
    pub async fn request(
        &self,
        route: &str,
        payload: impl Into<Bytes>,
        options: RequestOptions,
    ) -> Result<Dispatch> {
        self.ensure_started()?;
        let mut envelope = Envelope::new(route, payload.into(), self.identity.clone());
        envelope.reply_to = Some(self.identity.clone());
        envelope.selector = options.selector;
        envelope.target = options.target;
        envelope.persistent = options.persistent.unwrap_or(self.default_persistent);
        envelope.offline_failsafe = options.offline_failsafe;

        let targets = self.cluster.targets_for(&envelope);
        if !targets.is_empty() {
            let handle = match self.warden.new_job(&envelope, &targets) {
                Ok(handle) => handle,
                Err(e) => {
                    error!(token = %envelope.token, error = %e, "job registration failed");
                    return Err(e);
                }
            };
            if let Err(e) = self.cluster.route(&envelope, &targets).await {
                // Nothing was published that could ever complete this job.
                self.warden.cancel(&envelope.token);
                return Err(e);
            }
            debug!(
                route,
                token = %envelope.token,
                targets = targets.len(),
                "request dispatched"
            );
            return Ok(Dispatch::Accepted(handle));
        }

        if envelope.offline_failsafe {
            self.cluster.publish(&envelope, OFFLINE_QUEUE).await?;
            info!(route, token = %envelope.token, "no targets; parked on offline queue");
            return Ok(Dispatch::Offline);
        }
        debug!(route, "no targets for request");
        Ok(Dispatch::NoTargets)
    }

    /// Dispatch a request expecting no reply. Honors the selector
    /// (including `all` fan-out); an empty target set silently drops.
    pub async fn push(
        &self,
        route: &str,
        payload: impl Into<Bytes>,
        options: RequestOptions,
    ) -> Result<bool> {
        self.ensure_started()?;
        let mut envelope = Envelope::new(route, payload.into(), self.identity.clone());
        envelope.selector = options.selector;
        envelope.target = options.target;
        envelope.persistent = options.persistent.unwrap_or(self.default_persistent);

        let targets = self.cluster.targets_for(&envelope);
        if targets.is_empty() {
            debug!(route, "push dropped; no targets");
            return Ok(true);
        }
        self.cluster.route(&envelope, &targets).await?;
        debug!(route, targets = targets.len(), "push dispatched");
        Ok(true)
    }

    /// Cancel an in-flight job; its handle resolves with whatever
    /// partial results exist. Per-job deadlines are the caller's
    /// responsibility, built from exactly this.
    pub fn cancel(&self, token: &str) -> bool {
        self.warden.cancel(token)
    }

    /// Jobs still awaiting replies.
    pub fn active_jobs(&self) -> usize {
        self.warden.active_jobs()
    }

    /// Snapshot of the agent directory.
    pub fn live_agents(&self) -> Vec<AgentRecord> {
        self.cluster.live_agents()
    }

    pub fn agent_count(&self) -> usize {
        self.cluster.agent_count()
    }

    fn ensure_started(&self) -> Result<()> {
        match *self.state.lock().unwrap() {
            MapperState::Started => Ok(()),
            _ => Err(MapperError::NotStarted),
        }
    }
}

/// Fluent construction with defaults for everything but the broker.
pub struct MapperBuilder {
    identity: Option<String>,
    format: Format,
    agent_timeout: Duration,
    offline_redelivery_frequency: Duration,
    persistent: bool,
    broker: Option<Arc<dyn Broker>>,
}

impl Default for MapperBuilder {
    fn default() -> Self {
        let defaults = MapperConfig::default();
        Self {
            identity: None,
            format: defaults.format,
            agent_timeout: defaults.agent_timeout,
            offline_redelivery_frequency: defaults.offline_redelivery_frequency,
            persistent: defaults.persistent,
            broker: None,
        }
    }
}

impl MapperBuilder {
    /// Identity prefix; the mapper runs as `mapper-<identity>`.
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn offline_redelivery_frequency(mut self, frequency: Duration) -> Self {
        self.offline_redelivery_frequency = frequency;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn build(self) -> Result<Mapper> {
        let broker = self
            .broker
            .ok_or_else(|| MapperError::InvalidConfig("broker is required".to_string()))?;
        let prefix = self
            .identity
            .unwrap_or_else(|| MapperConfig::default().identity);
        let identity = format!("mapper-{prefix}");
        let codec = codec_for(self.format);
        let cluster = Arc::new(ClusterRegistry::new(
            Arc::clone(&broker),
            Arc::clone(&codec),
            self.agent_timeout,
        ));
        Ok(Mapper {
            identity,
            default_persistent: self.persistent,
            agent_timeout: self.agent_timeout,
            offline_redelivery_frequency: self.offline_redelivery_frequency,
            broker,
            codec,
            cluster,
            warden: Arc::new(JobWarden::new()),
            state: Mutex::new(MapperState::Created),
            tickers: Mutex::new(Vec::new()),
        })
    }
}
