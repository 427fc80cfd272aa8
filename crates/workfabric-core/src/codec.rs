//! Wire Codec - Opaque Envelope Encoding
//!
//! The serialization scheme is negotiated once at mapper construction
//! time and shared cluster-wide; everything that crosses the broker goes
//! through a [`Codec`]. The trait is object-safe so components hold an
//! `Arc<dyn Codec>` the same way they hold the broker.
//!
//! Only JSON is built in today. A new scheme means a new [`Format`]
//! variant and an implementation; callers never look inside the bytes.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::event::ClusterEvent;

/// Serialization scheme tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Json,
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Format::Json),
            other => Err(Error::UnknownFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Json => f.write_str("json"),
        }
    }
}

/// Encode/decode seam between fabric types and broker payloads.
pub trait Codec: Send + Sync {
    fn format(&self) -> Format;

    fn encode_envelope(&self, envelope: &Envelope) -> Result<Bytes>;

    fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope>;

    fn encode_event(&self, event: &ClusterEvent) -> Result<Bytes>;

    fn decode_event(&self, bytes: &[u8]) -> Result<ClusterEvent>;
}

/// JSON implementation of the wire codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn format(&self) -> Format {
        Format::Json
    }

    fn encode_envelope(&self, envelope: &Envelope) -> Result<Bytes> {
        serde_json::to_vec(envelope)
            .map(Bytes::from)
            .map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedEnvelope(e.to_string()))
    }

    fn encode_event(&self, event: &ClusterEvent) -> Result<Bytes> {
        serde_json::to_vec(event)
            .map(Bytes::from)
            .map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode_event(&self, bytes: &[u8]) -> Result<ClusterEvent> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedEvent(e.to_string()))
    }
}

/// Codec instance for a negotiated format.
pub fn codec_for(format: Format) -> Arc<dyn Codec> {
    match format {
        Format::Json => Arc::new(JsonCodec),
    }
}
