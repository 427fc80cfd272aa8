//! Request Envelopes and Selection Policy
//!
//! An [`Envelope`] is the unit of dispatch in the fabric - one typed
//! request (or one agent reply) carried end-to-end as opaque bytes plus
//! routing metadata.
//!
//! ## Structure
//!
//! - **route**: service-route string the request is addressed to
//! - **payload**: the application data, untouched by the fabric
//! - **from**: identity of the sender; for requests this doubles as the
//!   reply destination advertised in `reply_to`
//! - **token**: fresh correlation id, unique per envelope
//! - **selector / target**: how eligible agents are chosen; an explicit
//!   `target` overrides the selector
//! - **persistent**: broker durability flag for the publish
//! - **offline_failsafe**: park the request on the durable offline queue
//!   when no target is live
//!
//! Envelopes are immutable once built; replies reuse the request's token
//! so the mapper can correlate them back to the issuing job.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Policy for choosing among the agents advertising a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Single agent with the lowest self-reported load; ties break to the
    /// lexicographically smallest identity.
    #[default]
    LeastLoaded,
    /// Single agent chosen uniformly at random.
    Random,
    /// Single agent by per-route cursor over the identity-sorted
    /// candidate set.
    RoundRobin,
    /// Every agent advertising the route, in identity order.
    All,
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "least_loaded" => Ok(Selector::LeastLoaded),
            "random" => Ok(Selector::Random),
            "round_robin" => Ok(Selector::RoundRobin),
            "all" => Ok(Selector::All),
            other => Err(Error::UnknownSelector(other.to_string())),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Selector::LeastLoaded => "least_loaded",
            Selector::Random => "random",
            Selector::RoundRobin => "round_robin",
            Selector::All => "all",
        };
        f.write_str(name)
    }
}

/// A single dispatchable request or reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Service route this envelope is addressed to.
    pub route: String,

    /// Opaque application payload.
    pub payload: Bytes,

    /// Identity of the sender.
    pub from: String,

    /// Correlation token, unique per request envelope.
    pub token: String,

    /// Where the handling agent should send its reply; unset for pushes.
    pub reply_to: Option<String>,

    /// Selection policy when no explicit target is named.
    pub selector: Selector,

    /// Explicit target identity, overriding the selector.
    pub target: Option<String>,

    /// Broker durability flag for the publish.
    pub persistent: bool,

    /// Park on the offline queue when no target is live.
    pub offline_failsafe: bool,
}

impl Envelope {
    /// Build a request envelope with a fresh token and default policy.
    pub fn new(route: impl Into<String>, payload: Bytes, from: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            payload,
            from: from.into(),
            token: fresh_token(),
            reply_to: None,
            selector: Selector::default(),
            target: None,
            persistent: false,
            offline_failsafe: false,
        }
    }

    /// Build the reply to a request: same route and token, the replying
    /// agent as sender, and no further reply expected.
    pub fn reply(request: &Envelope, from: impl Into<String>, payload: Bytes) -> Self {
        Self {
            route: request.route.clone(),
            payload,
            from: from.into(),
            token: request.token.clone(),
            reply_to: None,
            selector: request.selector,
            target: None,
            persistent: request.persistent,
            offline_failsafe: false,
        }
    }
}

/// Generate a correlation token (uuid v4, simple form).
pub fn fresh_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let env = Envelope::new("hash", Bytes::from("abc"), "mapper-core");
        assert_eq!(env.route, "hash");
        assert_eq!(env.payload, Bytes::from("abc"));
        assert_eq!(env.from, "mapper-core");
        assert_eq!(env.selector, Selector::LeastLoaded);
        assert!(env.reply_to.is_none());
        assert!(env.target.is_none());
        assert!(!env.persistent);
        assert!(!env.offline_failsafe);
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = Envelope::new("s", Bytes::new(), "m");
        let b = Envelope::new("s", Bytes::new(), "m");
        assert_ne!(a.token, b.token);
        assert_eq!(a.token.len(), 32);
    }

    #[test]
    fn test_reply_carries_token_and_route() {
        let mut req = Envelope::new("hash", Bytes::from("abc"), "mapper-core");
        req.reply_to = Some("mapper-core".to_string());

        let reply = Envelope::reply(&req, "agent-a", Bytes::from("3"));
        assert_eq!(reply.token, req.token);
        assert_eq!(reply.route, "hash");
        assert_eq!(reply.from, "agent-a");
        assert_eq!(reply.payload, Bytes::from("3"));
        assert!(reply.reply_to.is_none());
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!("least_loaded".parse::<Selector>().unwrap(), Selector::LeastLoaded);
        assert_eq!("random".parse::<Selector>().unwrap(), Selector::Random);
        assert_eq!("round_robin".parse::<Selector>().unwrap(), Selector::RoundRobin);
        assert_eq!("all".parse::<Selector>().unwrap(), Selector::All);
        assert!("fastest".parse::<Selector>().is_err());
    }

    #[test]
    fn test_selector_display_roundtrip() {
        for sel in [
            Selector::LeastLoaded,
            Selector::Random,
            Selector::RoundRobin,
            Selector::All,
        ] {
            assert_eq!(sel.to_string().parse::<Selector>().unwrap(), sel);
        }
    }

    #[test]
    fn test_selector_default_is_least_loaded() {
        assert_eq!(Selector::default(), Selector::LeastLoaded);
    }

    #[test]
    fn test_selector_serde_snake_case() {
        let json = serde_json::to_string(&Selector::RoundRobin).unwrap();
        assert_eq!(json, r#""round_robin""#);
    }
}
