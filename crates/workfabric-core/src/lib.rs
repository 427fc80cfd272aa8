//! Workfabric Core - Envelopes, Events, and the Wire Codec
//!
//! This crate holds the value types every node of the fabric agrees on:
//!
//! - **Envelope**: a single dispatchable request (or reply) with its
//!   correlation token, selection policy, and payload
//! - **ClusterEvent**: membership notifications agents publish when they
//!   register, heartbeat, or unregister
//! - **Codec**: the opaque encode/decode seam between those types and
//!   broker payloads, negotiated once per cluster via [`Format`]
//!
//! Nothing in this crate touches the network; it is pure data shared by
//! the mapper, the agents, and the tests.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod event;

pub use codec::{codec_for, Codec, Format, JsonCodec};
pub use envelope::{Envelope, Selector};
pub use error::{Error, Result};
pub use event::ClusterEvent;
