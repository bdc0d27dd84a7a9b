//! Signaling wire messages.
//!
//! Every request is a named JSON payload answered by exactly one JSON reply.
//! Field names are camelCase on the wire.

use crate::negotiator::{DtlsParameters, RtpCapabilities, RtpParameters};
use common::types::{Direction, MediaKind, PeerId, ProducerId, RoomId};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

/// Request names.
pub mod requests {
    pub const JOIN_ROOM: &str = "joinRoom";
    pub const CREATE_SEND_TRANSPORT: &str = "createSendTransport";
    pub const CREATE_RECV_TRANSPORT: &str = "createRecvTransport";
    pub const CONNECT_TRANSPORT: &str = "connectTransport";
    pub const PRODUCE: &str = "produce";
    pub const CONSUME: &str = "consume";
    pub const LEAVE_ROOM: &str = "leaveRoom";
}

/// Push event names.
pub mod events {
    pub const NEW_PRODUCER: &str = "newProducer";
    pub const PRODUCER_CLOSED: &str = "producerClosed";

    /// Every event the client registers a handler for.
    pub const ALL: [&str; 2] = [NEW_PRODUCER, PRODUCER_CLOSED];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomReply {
    #[serde(alias = "routerRtpCapabilities")]
    pub router_capabilities: RtpCapabilities,
    /// Entries that do not decode are skipped, not fatal to the join.
    #[serde(default, deserialize_with = "skip_malformed_producers")]
    pub existing_producers: Vec<RemoteProducer>,
}

fn skip_malformed_producers<'de, D>(deserializer: D) -> Result<Vec<RemoteProducer>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<Value>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value(entry) {
            Ok(producer) => Some(producer),
            Err(e) => {
                warn!(target: "sfu.signaling", error = %e, "Skipping malformed existing producer");
                None
            }
        })
        .collect())
}

/// A producer owned by another participant.
///
/// Learned from the join snapshot or a `newProducer` push event; exists only
/// to drive one consume request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProducer {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    /// Older servers name the origin peer by its socket id.
    #[serde(alias = "socketId")]
    pub peer_id: PeerId,
}

impl RemoteProducer {
    pub fn new(
        producer_id: impl Into<ProducerId>,
        kind: MediaKind,
        peer_id: impl Into<PeerId>,
    ) -> Self {
        Self {
            producer_id: producer_id.into(),
            kind,
            peer_id: peer_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub direction: Direction,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceReply {
    pub id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosedEvent {
    pub producer_id: ProducerId,
}

/// A decoded server push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    NewProducer(RemoteProducer),
    ProducerClosed { producer_id: ProducerId },
}

impl PushEvent {
    /// Event name, bounded for metric labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::NewProducer(_) => events::NEW_PRODUCER,
            PushEvent::ProducerClosed { .. } => events::PRODUCER_CLOSED,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_reply_skips_malformed_producer() {
        let reply: JoinRoomReply = serde_json::from_value(json!({
            "routerCapabilities": { "codecs": [] },
            "existingProducers": [
                { "producerId": "p1", "kind": "screen", "peerId": "peerA" },
                { "producerId": "p2", "kind": "audio", "peerId": "peerA" },
                { "kind": "video", "peerId": "peerB" }
            ]
        }))
        .unwrap();

        assert_eq!(
            reply.existing_producers,
            vec![RemoteProducer::new("p2", MediaKind::Audio, "peerA")]
        );
    }

    #[test]
    fn test_join_reply_decodes_snapshot() {
        let reply = json!({
            "routerCapabilities": { "codecs": [] },
            "existingProducers": [
                { "producerId": "p1", "kind": "video", "peerId": "peerA" }
            ]
        });

        let reply: JoinRoomReply = serde_json::from_value(reply).unwrap();
        assert_eq!(
            reply.existing_producers,
            vec![RemoteProducer::new("p1", MediaKind::Video, "peerA")]
        );
    }

    #[test]
    fn test_join_reply_without_snapshot() {
        let reply: JoinRoomReply =
            serde_json::from_value(json!({ "routerRtpCapabilities": {} })).unwrap();
        assert!(reply.existing_producers.is_empty());
    }

    #[test]
    fn test_remote_producer_accepts_socket_id() {
        let producer: RemoteProducer = serde_json::from_value(json!({
            "producerId": "p9",
            "kind": "audio",
            "socketId": "sock-1"
        }))
        .unwrap();
        assert_eq!(producer.peer_id.as_str(), "sock-1");
    }

    #[test]
    fn test_connect_request_wire_shape() {
        let request = ConnectTransportRequest {
            direction: Direction::Recv,
            dtls_parameters: DtlsParameters(json!({ "role": "client" })),
        };

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "direction": "recv", "dtlsParameters": { "role": "client" } })
        );
    }

    #[test]
    fn test_consume_request_wire_shape() {
        let request = ConsumeRequest {
            producer_id: ProducerId::new("p1"),
            rtp_capabilities: RtpCapabilities(json!({ "codecs": [] })),
        };

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "producerId": "p1", "rtpCapabilities": { "codecs": [] } })
        );
    }
}
