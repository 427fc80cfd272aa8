//! Cluster Membership Events
//!
//! Agents announce themselves to every listening mapper by publishing
//! these events on the shared `membership` fanout exchange. A register
//! carries the full service set and replaces any previous record for the
//! identity; heartbeats refresh liveness and load only; unregister
//! removes the agent immediately.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Membership notification pushed at the mapper by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// Agent joined (or re-announced) with its advertised service routes
    /// and current load.
    Register {
        identity: String,
        services: BTreeSet<String>,
        status: f64,
    },
    /// Periodic liveness refresh with the current load metric.
    Heartbeat { identity: String, status: f64 },
    /// Agent is leaving the cluster.
    Unregister { identity: String },
}

impl ClusterEvent {
    /// Identity of the agent this event concerns.
    pub fn identity(&self) -> &str {
        match self {
            ClusterEvent::Register { identity, .. } => identity,
            ClusterEvent::Heartbeat { identity, .. } => identity,
            ClusterEvent::Unregister { identity } => identity,
        }
    }
}
