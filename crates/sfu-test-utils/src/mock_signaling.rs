//! Mock SFU signaling channel.
//!
//! Answers every request the client issues with a canned reply, records what
//! it saw, and lets tests push server events into registered handlers.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockSignaling;
//!
//! let signaling = Arc::new(
//!     MockSignaling::builder()
//!         .with_existing_producer("p1", MediaKind::Video, "peerA")
//!         .reject_consume_for("p9")
//!         .build(),
//! );
//!
//! // ... join through the orchestrator ...
//! signaling.emit_new_producer("p2", MediaKind::Audio, "peerA");
//! ```

use async_trait::async_trait;
use common::types::MediaKind;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sfu_client::errors::SignalingError;
use sfu_client::signaling::{events, requests, EventHandler, RemoteProducer, SignalingPort};
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;

#[derive(Default)]
struct MockState {
    requests: Vec<(String, Value)>,
    handlers: HashMap<String, EventHandler>,
    kinds: HashMap<String, MediaKind>,
    produced: usize,
    disconnected: bool,
}

/// Mock signaling port.
pub struct MockSignaling {
    router_capabilities: Value,
    existing_producers: Vec<RemoteProducer>,
    raw_producers: Vec<Value>,
    rejections: HashMap<String, String>,
    consume_rejections: HashSet<String>,
    gates: HashMap<String, watch::Sender<bool>>,
    state: Mutex<MockState>,
}

impl Default for MockSignaling {
    fn default() -> Self {
        MockSignaling::builder().build()
    }
}

impl MockSignaling {
    /// Create a new MockSignaling builder.
    #[must_use]
    pub fn builder() -> MockSignalingBuilder {
        MockSignalingBuilder::default()
    }

    /// Invoke the handler registered for `event`, if any.
    pub fn emit(&self, event: &str, payload: Value) {
        let handler = self.state.lock().handlers.get(event).cloned();
        if let Some(handler) = handler {
            handler(payload);
        }
    }

    /// Push a `newProducer` event.
    pub fn emit_new_producer(&self, producer_id: &str, kind: MediaKind, peer_id: &str) {
        self.state
            .lock()
            .kinds
            .insert(producer_id.to_string(), kind);
        self.emit(
            events::NEW_PRODUCER,
            json!({ "producerId": producer_id, "kind": kind, "peerId": peer_id }),
        );
    }

    /// Push a `producerClosed` event.
    pub fn emit_producer_closed(&self, producer_id: &str) {
        self.emit(
            events::PRODUCER_CLOSED,
            json!({ "producerId": producer_id }),
        );
    }

    /// Let a paused request through, now and for every later request.
    pub fn release(&self, request: &str) {
        if let Some(gate) = self.gates.get(request) {
            gate.send_replace(true);
        }
    }

    /// Wait until `count` requests named `request` have been issued.
    pub async fn wait_for_requests(&self, request: &str, count: usize) {
        while self.request_count(request) < count {
            tokio::task::yield_now().await;
        }
    }

    /// Number of requests named `request` seen so far.
    #[must_use]
    pub fn request_count(&self, request: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(name, _)| name == request)
            .count()
    }

    /// Payloads of every request named `request`, in order.
    #[must_use]
    pub fn requests_named(&self, request: &str) -> Vec<Value> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(name, _)| name == request)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Names of every request seen so far, in order.
    #[must_use]
    pub fn request_log(&self) -> Vec<String> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    #[must_use]
    pub fn has_handler(&self, event: &str) -> bool {
        self.state.lock().handlers.contains_key(event)
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.state.lock().handlers.len()
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }

    fn reply(&self, name: &str, payload: &Value) -> Result<Value, SignalingError> {
        let mut state = self.state.lock();
        match name {
            requests::JOIN_ROOM => {
                for producer in &self.existing_producers {
                    state
                        .kinds
                        .insert(producer.producer_id.to_string(), producer.kind);
                }
                let mut snapshot: Vec<Value> = self
                    .existing_producers
                    .iter()
                    .map(|producer| json!(producer))
                    .collect();
                snapshot.extend(self.raw_producers.iter().cloned());
                Ok(json!({
                    "routerCapabilities": self.router_capabilities,
                    "existingProducers": snapshot,
                }))
            }
            requests::CREATE_SEND_TRANSPORT => Ok(transport_options("send-transport-1")),
            requests::CREATE_RECV_TRANSPORT => Ok(transport_options("recv-transport-1")),
            requests::CONNECT_TRANSPORT | requests::LEAVE_ROOM => Ok(json!({})),
            requests::PRODUCE => {
                state.produced += 1;
                Ok(json!({ "id": format!("producer-{}", state.produced) }))
            }
            requests::CONSUME => {
                let producer_id = payload["producerId"].as_str().unwrap_or_default();
                if self.consume_rejections.contains(producer_id) {
                    return Err(SignalingError::Rejected {
                        request: name.to_string(),
                        reason: format!("cannot consume {producer_id}"),
                    });
                }
                let kind = state
                    .kinds
                    .get(producer_id)
                    .copied()
                    .unwrap_or(MediaKind::Video);
                Ok(json!({
                    "id": format!("consumer-{producer_id}"),
                    "producerId": producer_id,
                    "kind": kind,
                    "rtpParameters": { "codecs": [] },
                }))
            }
            other => Err(SignalingError::Rejected {
                request: other.to_string(),
                reason: "unknown request".to_string(),
            }),
        }
    }
}

#[async_trait]
impl SignalingPort for MockSignaling {
    async fn request(&self, name: &str, payload: Value) -> Result<Value, SignalingError> {
        {
            let mut state = self.state.lock();
            if state.disconnected {
                return Err(SignalingError::ChannelClosed);
            }
            state.requests.push((name.to_string(), payload.clone()));
        }

        if let Some(gate) = self.gates.get(name) {
            let mut released = gate.subscribe();
            // A dropped sender cannot happen while `self` is alive.
            let _ = released.wait_for(|open| *open).await;
        }

        if let Some(reason) = self.rejections.get(name) {
            return Err(SignalingError::Rejected {
                request: name.to_string(),
                reason: reason.clone(),
            });
        }

        self.reply(name, &payload)
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.state
            .lock()
            .handlers
            .insert(event.to_string(), handler);
    }

    fn off(&self, event: &str) {
        self.state.lock().handlers.remove(event);
    }

    fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }
}

fn transport_options(id: &str) -> Value {
    json!({
        "id": id,
        "iceParameters": { "usernameFragment": "ufrag", "password": "pwd" },
        "iceCandidates": [{ "ip": "127.0.0.1", "port": 40000, "protocol": "udp" }],
        "dtlsParameters": { "role": "auto", "fingerprints": [] },
    })
}

/// Builder for MockSignaling configuration.
#[derive(Default)]
pub struct MockSignalingBuilder {
    router_capabilities: Option<Value>,
    existing_producers: Vec<RemoteProducer>,
    raw_producers: Vec<Value>,
    rejections: HashMap<String, String>,
    consume_rejections: HashSet<String>,
    paused: HashSet<String>,
}

impl MockSignalingBuilder {
    /// Router capabilities returned by `joinRoom`.
    #[must_use]
    pub fn with_router_capabilities(mut self, capabilities: Value) -> Self {
        self.router_capabilities = Some(capabilities);
        self
    }

    /// Add a producer to the `joinRoom` snapshot.
    #[must_use]
    pub fn with_existing_producer(
        mut self,
        producer_id: &str,
        kind: MediaKind,
        peer_id: &str,
    ) -> Self {
        self.existing_producers
            .push(RemoteProducer::new(producer_id, kind, peer_id));
        self
    }

    /// Append an arbitrary JSON entry to the `joinRoom` snapshot, after the
    /// typed ones.
    #[must_use]
    pub fn with_raw_existing_producer(mut self, entry: Value) -> Self {
        self.raw_producers.push(entry);
        self
    }

    /// Reject every request named `request` with `reason`.
    #[must_use]
    pub fn reject_request(mut self, request: &str, reason: &str) -> Self {
        self.rejections
            .insert(request.to_string(), reason.to_string());
        self
    }

    /// Reject `consume` for one producer only.
    #[must_use]
    pub fn reject_consume_for(mut self, producer_id: &str) -> Self {
        self.consume_rejections.insert(producer_id.to_string());
        self
    }

    /// Hold replies to `request` until [`MockSignaling::release`] is called.
    #[must_use]
    pub fn pause_request(mut self, request: &str) -> Self {
        self.paused.insert(request.to_string());
        self
    }

    #[must_use]
    pub fn build(self) -> MockSignaling {
        MockSignaling {
            router_capabilities: self
                .router_capabilities
                .unwrap_or_else(crate::fixtures::router_capabilities),
            existing_producers: self.existing_producers,
            raw_producers: self.raw_producers,
            rejections: self.rejections,
            consume_rejections: self.consume_rejections,
            gates: self
                .paused
                .into_iter()
                .map(|name| (name, watch::channel(false).0))
                .collect(),
            state: Mutex::new(MockState::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_join_reply_carries_snapshot() {
        let signaling = MockSignaling::builder()
            .with_existing_producer("p1", MediaKind::Video, "peerA")
            .build();

        let reply = signaling
            .request("joinRoom", json!({ "roomId": "abc123" }))
            .await
            .unwrap();

        assert_eq!(reply["existingProducers"][0]["producerId"], "p1");
        assert_eq!(signaling.request_count("joinRoom"), 1);
    }

    #[tokio::test]
    async fn test_consume_reply_uses_announced_kind() {
        let signaling = MockSignaling::default();
        signaling.emit_new_producer("p2", MediaKind::Audio, "peerA");

        let reply = signaling
            .request("consume", json!({ "producerId": "p2" }))
            .await
            .unwrap();

        assert_eq!(reply["kind"], "audio");
        assert_eq!(reply["id"], "consumer-p2");
    }

    #[tokio::test]
    async fn test_rejections() {
        let signaling = MockSignaling::builder()
            .reject_request("joinRoom", "room full")
            .reject_consume_for("p9")
            .build();

        assert!(signaling.request("joinRoom", json!({})).await.is_err());
        assert!(signaling
            .request("consume", json!({ "producerId": "p9" }))
            .await
            .is_err());
        assert!(signaling
            .request("consume", json!({ "producerId": "p1" }))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_paused_request_waits_for_release() {
        let signaling = Arc::new(MockSignaling::builder().pause_request("joinRoom").build());

        let pending = {
            let signaling = Arc::clone(&signaling);
            tokio::spawn(async move { signaling.request("joinRoom", json!({})).await })
        };

        signaling.wait_for_requests("joinRoom", 1).await;
        assert!(!pending.is_finished());

        signaling.release("joinRoom");
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_fails_later_requests() {
        let signaling = MockSignaling::default();
        signaling.disconnect();

        let err = signaling.request("leaveRoom", json!({})).await.unwrap_err();
        assert_eq!(err, SignalingError::ChannelClosed);
        assert!(signaling.is_disconnected());
    }
}
