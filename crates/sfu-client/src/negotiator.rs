//! Seam over the external capability-negotiation library.
//!
//! The library owns codec, SRTP and ICE internals. The core only loads the
//! router capabilities, creates the two pipes from server-issued connection
//! parameters, and produces or consumes through them.
//!
//! # Intent signals
//!
//! A pipe raises two kinds of intent while it negotiates:
//!
//! - **connect**: the pipe has local DTLS parameters and needs the server to
//!   complete its handshake. Raised once, lazily, before the first produce or
//!   consume on that pipe.
//! - **produce** (send pipe only): the pipe has RTP parameters for a new
//!   track and needs a server-issued producer id.
//!
//! Both are delivered to a [`PipeListener`]. The pipe awaits the listener's
//! future; its result is the single resolution point of the intent.

use crate::errors::NegotiatorError;
use crate::media::{LocalTrack, RemoteTrack};
use async_trait::async_trait;
use common::types::{ConsumerId, Direction, MediaKind, ProducerId, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

macro_rules! opaque_blob {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Value);

        impl From<Value> for $name {
            fn from(value: Value) -> Self {
                Self(value)
            }
        }
    };
}

opaque_blob!(
    /// RTP capabilities (router's or the local device's). Opaque to the core.
    RtpCapabilities
);

opaque_blob!(
    /// RTP parameters of one producer or consumer. Opaque to the core.
    RtpParameters
);

opaque_blob!(
    /// DTLS parameters exchanged during a pipe's connect handshake.
    DtlsParameters
);

/// Server-issued connection parameters for one pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: TransportId,
    #[serde(default)]
    pub ice_parameters: Value,
    #[serde(default)]
    pub ice_candidates: Vec<Value>,
    #[serde(default)]
    pub dtls_parameters: DtlsParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

/// Server-issued description of a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    #[serde(default)]
    pub rtp_parameters: RtpParameters,
}

/// Connection state of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeState {
    New,
    Connecting,
    Connected,
    Closed,
}

/// Receives a pipe's intent signals.
#[async_trait]
pub trait PipeListener: Send + Sync {
    /// Complete the pipe's connect handshake. An `Ok` acknowledgement alone
    /// satisfies the intent.
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<(), NegotiatorError>;

    /// Obtain a producer id for a new track. The id is relayed verbatim.
    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, NegotiatorError>;
}

/// Operations common to both pipe directions.
pub trait Pipe: Send + Sync {
    fn id(&self) -> &TransportId;

    fn direction(&self) -> Direction;

    fn connection_state(&self) -> PipeState;

    /// Close the pipe. Invalidates every producer or consumer created on it.
    /// Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool {
        self.connection_state() == PipeState::Closed
    }
}

/// Outbound pipe.
#[async_trait]
pub trait SendPipe: Pipe {
    /// Publish a local track. Raises the connect intent first if the pipe is
    /// still `New`, then the produce intent.
    async fn produce(&self, track: Arc<dyn LocalTrack>)
        -> Result<Box<dyn Producer>, NegotiatorError>;
}

/// Inbound pipe.
#[async_trait]
pub trait RecvPipe: Pipe {
    /// Build a consumer from a server-issued description. Raises the connect
    /// intent first if the pipe is still `New`.
    async fn consume(&self, options: ConsumerOptions)
        -> Result<Box<dyn Consumer>, NegotiatorError>;
}

/// Client-side handle of one published track.
pub trait Producer: Send + Sync {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    /// Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Client-side handle of one subscribed remote track.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    /// The remote track this consumer receives.
    fn track(&self) -> RemoteTrack;

    /// Start RTP flow on a consumer the server created paused.
    async fn resume(&self) -> Result<(), NegotiatorError>;

    /// Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// The capability-negotiation library, one instance per session.
#[async_trait]
pub trait CapabilityNegotiator: Send + Sync {
    /// Load the router's RTP capabilities.
    async fn load(&self, router_capabilities: RtpCapabilities) -> Result<(), NegotiatorError>;

    fn is_loaded(&self) -> bool;

    /// Local RTP capabilities, sent with every consume request.
    fn rtp_capabilities(&self) -> Result<RtpCapabilities, NegotiatorError>;

    /// Whether the loaded capabilities allow sending this kind.
    fn can_produce(&self, kind: MediaKind) -> bool;

    async fn create_send_pipe(
        &self,
        options: TransportOptions,
        listener: Arc<dyn PipeListener>,
    ) -> Result<Arc<dyn SendPipe>, NegotiatorError>;

    async fn create_recv_pipe(
        &self,
        options: TransportOptions,
        listener: Arc<dyn PipeListener>,
    ) -> Result<Arc<dyn RecvPipe>, NegotiatorError>;
}

/// Builds a fresh negotiator for each session.
pub trait NegotiatorFactory: Send + Sync {
    fn create(&self) -> Arc<dyn CapabilityNegotiator>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transport_options_from_server_params() {
        let params = json!({
            "id": "send-1",
            "iceParameters": { "usernameFragment": "u", "password": "p" },
            "iceCandidates": [{ "ip": "127.0.0.1", "port": 40000 }],
            "dtlsParameters": { "role": "auto", "fingerprints": [] }
        });

        let options: TransportOptions = serde_json::from_value(params).unwrap();
        assert_eq!(options.id.as_str(), "send-1");
        assert_eq!(options.ice_candidates.len(), 1);
        assert_eq!(options.dtls_parameters.0["role"], "auto");
        assert!(options.sctp_parameters.is_none());
    }

    #[test]
    fn test_consumer_options_wire_shape() {
        let reply = json!({
            "id": "c1",
            "producerId": "p1",
            "kind": "video",
            "rtpParameters": { "codecs": [] }
        });

        let options: ConsumerOptions = serde_json::from_value(reply).unwrap();
        assert_eq!(options.id.as_str(), "c1");
        assert_eq!(options.producer_id.as_str(), "p1");
        assert_eq!(options.kind, MediaKind::Video);
    }
}
