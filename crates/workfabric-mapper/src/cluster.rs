//! Cluster Registry - Agent Directory and Target Selection
//!
//! The registry owns the live view of the cluster: one record per agent
//! (service set, self-reported load, last-seen timestamp), a derived
//! service index from route to the identities advertising it, and the
//! per-route cursors backing round-robin selection.
//!
//! ## Coherence
//!
//! The service index is updated inside the same critical section as the
//! agent table on every mutation, so `i ∈ index[s]` exactly when agent
//! `i` exists and advertises `s`. All reads and writes go through one
//! mutex that is never held across an await: an incoming heartbeat
//! cannot interleave with target selection.
//!
//! ## Liveness
//!
//! Agents are admitted by `register`, refreshed by `heartbeat`, and
//! removed by `unregister` or by the periodic [`ClusterRegistry::reap`]
//! sweep once their last heartbeat ages past the agent timeout.
//! Heartbeats for unknown identities are dropped - a record synthesized
//! from a heartbeat would have no service set and could never be
//! selected, so agents are expected to re-register on startup.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info};
use workfabric_broker::Broker;
use workfabric_core::{Codec, Envelope, Selector};

use crate::error::Result;

/// One live agent as the mapper sees it.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub identity: String,
    /// Service routes the agent advertises.
    pub services: BTreeSet<String>,
    /// Self-reported load; lower is less loaded.
    pub status: f64,
    /// Milliseconds since epoch of the last register or heartbeat.
    pub last_seen: i64,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentRecord>,
    /// route -> identities advertising it.
    index: HashMap<String, BTreeSet<String>>,
    /// Per-route round-robin cursors.
    cursors: HashMap<String, usize>,
}

/// Agent directory, service index, and route/publish glue.
pub struct ClusterRegistry {
    broker: Arc<dyn Broker>,
    codec: Arc<dyn Codec>,
    agent_timeout: Duration,
    state: Mutex<RegistryState>,
}

impl ClusterRegistry {
    pub fn new(broker: Arc<dyn Broker>, codec: Arc<dyn Codec>, agent_timeout: Duration) -> Self {
        Self {
            broker,
            codec,
            agent_timeout,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Admit an agent, replacing any existing record for the identity.
    /// Index entries for services dropped since the previous
    /// registration are scrubbed. Idempotent.
    pub fn observe_register(&self, identity: &str, services: BTreeSet<String>, status: f64) {
        let mut state = self.state.lock().unwrap();
        if let Some(previous) = state.agents.remove(identity) {
            scrub_index(&mut state.index, identity, &previous.services);
        }
        for service in &services {
            state
                .index
                .entry(service.clone())
                .or_default()
                .insert(identity.to_string());
        }
        debug!(identity, services = services.len(), status, "agent registered");
        state.agents.insert(
            identity.to_string(),
            AgentRecord {
                identity: identity.to_string(),
                services,
                status,
                last_seen: now_ms(),
            },
        );
    }

    /// Refresh load and liveness. Unknown identities are ignored.
    pub fn observe_heartbeat(&self, identity: &str, status: f64) {
        let mut state = self.state.lock().unwrap();
        match state.agents.get_mut(identity) {
            Some(record) => {
                record.status = status;
                record.last_seen = now_ms();
            }
            None => debug!(identity, "dropping heartbeat from unregistered agent"),
        }
    }

    /// Remove an agent and all its service-index entries.
    pub fn observe_unregister(&self, identity: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.agents.remove(identity) {
            scrub_index(&mut state.index, identity, &record.services);
            debug!(identity, "agent unregistered");
        }
    }

    /// Evict every agent unseen for longer than the agent timeout.
    /// Returns the evicted identities.
    pub fn reap(&self, now: i64) -> Vec<String> {
        let cutoff = now - self.agent_timeout.as_millis() as i64;
        let mut state = self.state.lock().unwrap();
        let expired: Vec<String> = state
            .agents
            .values()
            .filter(|record| record.last_seen < cutoff)
            .map(|record| record.identity.clone())
            .collect();
        for identity in &expired {
            if let Some(record) = state.agents.remove(identity) {
                scrub_index(&mut state.index, identity, &record.services);
                info!(
                    identity = %identity,
                    last_seen = record.last_seen,
                    "reaped agent after heartbeat timeout"
                );
            }
        }
        expired
    }

    /// Reap against the current clock; the periodic sweep entry point.
    pub fn reap_now(&self) -> Vec<String> {
        self.reap(now_ms())
    }

    /// Resolve an envelope to the identities it should be delivered to.
    ///
    /// An explicit target wins when it is live *and* advertises the
    /// route; otherwise the selector runs over the route's candidate
    /// set. Only the round-robin cursor advances; everything else is a
    /// pure read of the registry snapshot.
    pub fn targets_for(&self, envelope: &Envelope) -> Vec<String> {
        let mut state = self.state.lock().unwrap();

        if let Some(target) = &envelope.target {
            let eligible = state
                .agents
                .get(target)
                .is_some_and(|record| record.services.contains(&envelope.route));
            return if eligible { vec![target.clone()] } else { Vec::new() };
        }

        let candidates: Vec<String> = match state.index.get(&envelope.route) {
            Some(holders) if !holders.is_empty() => holders.iter().cloned().collect(),
            _ => return Vec::new(),
        };

        match envelope.selector {
            Selector::All => candidates,
            Selector::Random => {
                let pick = (rand::random::<f64>() * candidates.len() as f64) as usize;
                vec![candidates[pick.min(candidates.len() - 1)].clone()]
            }
            Selector::LeastLoaded => {
                // Candidates iterate in identity order, and min_by keeps
                // the first of equals: ties break to the smaller identity.
                let status_of = |id: &String| {
                    state.agents.get(id).map_or(f64::INFINITY, |record| record.status)
                };
                candidates
                    .iter()
                    .min_by(|a, b| status_of(a).total_cmp(&status_of(b)))
                    .map(|id| vec![id.clone()])
                    .unwrap_or_default()
            }
            Selector::RoundRobin => {
                let cursor = state.cursors.entry(envelope.route.clone()).or_insert(0);
                let pick = *cursor % candidates.len();
                *cursor = pick + 1;
                vec![candidates[pick].clone()]
            }
        }
    }

    /// Publish the envelope once per target, to each target's direct
    /// queue. Broker faults are logged and do not abort the fan-out.
    pub async fn route(&self, envelope: &Envelope, targets: &[String]) -> Result<()> {
        let bytes = self.codec.encode_envelope(envelope)?;
        for target in targets {
            match self
                .broker
                .publish("", target, bytes.clone(), envelope.persistent)
                .await
            {
                Ok(()) => debug!(
                    target = %target,
                    route = %envelope.route,
                    token = %envelope.token,
                    "routed envelope"
                ),
                Err(e) => error!(target = %target, error = %e, "publish to agent queue failed"),
            }
        }
        Ok(())
    }

    /// Publish the envelope to a named queue (the offline-failsafe path).
    pub async fn publish(&self, envelope: &Envelope, queue: &str) -> Result<()> {
        let bytes = self.codec.encode_envelope(envelope)?;
        if let Err(e) = self
            .broker
            .publish("", queue, bytes, envelope.persistent)
            .await
        {
            error!(queue, error = %e, "publish to queue failed");
        }
        Ok(())
    }

    /// Snapshot of every live agent.
    pub fn live_agents(&self) -> Vec<AgentRecord> {
        let state = self.state.lock().unwrap();
        let mut agents: Vec<AgentRecord> = state.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.identity.cmp(&b.identity));
        agents
    }

    pub fn agent_count(&self) -> usize {
        self.state.lock().unwrap().agents.len()
    }

    /// Identities currently advertising a route.
    pub fn route_holders(&self, route: &str) -> BTreeSet<String> {
        let state = self.state.lock().unwrap();
        state.index.get(route).cloned().unwrap_or_default()
    }
}

fn scrub_index(index: &mut HashMap<String, BTreeSet<String>>, identity: &str, services: &BTreeSet<String>) {
    for service in services {
        if let Some(holders) = index.get_mut(service) {
            holders.remove(identity);
            if holders.is_empty() {
                index.remove(service);
            }
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as i64
}
