//! Signaling channel to the SFU.
//!
//! [`SignalingPort`] is the raw contract with the external channel: named
//! request with a single asynchronous reply, plus push-event registration.
//! [`SignalingClient`] layers the typed protocol on top of it.
//!
//! Retry and timeout policy belong to the port implementation (or a wrapper
//! around it), never to the client.

pub mod channel;
pub mod messages;

pub use channel::{ChannelSignaling, SignalingFrame};
pub use messages::{
    events, requests, ConnectTransportRequest, ConsumeRequest, JoinRoomReply, JoinRoomRequest,
    ProduceReply, ProduceRequest, ProducerClosedEvent, PushEvent, RemoteProducer,
};

use crate::errors::SignalingError;
use crate::negotiator::{
    ConsumerOptions, DtlsParameters, RtpCapabilities, RtpParameters, TransportOptions,
};
use async_trait::async_trait;
use common::types::{Direction, MediaKind, ProducerId, RoomId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Callback invoked with the payload of a push event.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Duplex channel to the SFU.
#[async_trait]
pub trait SignalingPort: Send + Sync {
    /// Send a named request and wait for its single reply.
    async fn request(&self, name: &str, payload: Value) -> Result<Value, SignalingError>;

    /// Register the handler for a push event, replacing any previous one.
    fn on(&self, event: &str, handler: EventHandler);

    /// Remove the handler for a push event. No-op if none is registered.
    fn off(&self, event: &str);

    /// Close the channel. Outstanding and later requests fail with
    /// `ChannelClosed`.
    fn disconnect(&self);
}

/// Typed signaling protocol over a [`SignalingPort`].
#[derive(Clone)]
pub struct SignalingClient {
    port: Arc<dyn SignalingPort>,
}

/// Every request method fails with the port's [`SignalingError`], or with
/// `MalformedReply` when the reply does not decode.
impl SignalingClient {
    #[must_use]
    pub fn new(port: Arc<dyn SignalingPort>) -> Self {
        Self { port }
    }

    /// Join a room. The reply carries the router capabilities and the
    /// producers that already exist in the room.
    ///
    /// # Errors
    ///
    /// See [`SignalingClient`].
    pub async fn join_room(&self, room_id: &RoomId) -> Result<JoinRoomReply, SignalingError> {
        self.call(
            requests::JOIN_ROOM,
            &JoinRoomRequest {
                room_id: room_id.clone(),
            },
        )
        .await
    }

    /// # Errors
    ///
    /// See [`SignalingClient`].
    pub async fn create_send_transport(&self) -> Result<TransportOptions, SignalingError> {
        self.call(requests::CREATE_SEND_TRANSPORT, &serde_json::json!({}))
            .await
    }

    /// # Errors
    ///
    /// See [`SignalingClient`].
    pub async fn create_recv_transport(&self) -> Result<TransportOptions, SignalingError> {
        self.call(requests::CREATE_RECV_TRANSPORT, &serde_json::json!({}))
            .await
    }

    /// Complete a pipe's connect handshake. Only the acknowledgement matters.
    ///
    /// # Errors
    ///
    /// See [`SignalingClient`].
    pub async fn connect_transport(
        &self,
        direction: Direction,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SignalingError> {
        let payload = encode(
            requests::CONNECT_TRANSPORT,
            &ConnectTransportRequest {
                direction,
                dtls_parameters,
            },
        )?;
        self.port
            .request(requests::CONNECT_TRANSPORT, payload)
            .await
            .map(|_| ())
    }

    /// Ask the server for a producer id for a new local track.
    ///
    /// # Errors
    ///
    /// See [`SignalingClient`].
    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SignalingError> {
        let reply: ProduceReply = self
            .call(
                requests::PRODUCE,
                &ProduceRequest {
                    kind,
                    rtp_parameters,
                },
            )
            .await?;
        Ok(reply.id)
    }

    /// Ask the server for a consumer of a remote producer.
    ///
    /// # Errors
    ///
    /// See [`SignalingClient`].
    pub async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerOptions, SignalingError> {
        self.call(
            requests::CONSUME,
            &ConsumeRequest {
                producer_id: producer_id.clone(),
                rtp_capabilities,
            },
        )
        .await
    }

    /// Tell the server this participant is leaving. The reply carries nothing.
    ///
    /// # Errors
    ///
    /// See [`SignalingClient`].
    pub async fn leave_room(&self) -> Result<(), SignalingError> {
        self.port
            .request(requests::LEAVE_ROOM, serde_json::json!({}))
            .await
            .map(|_| ())
    }

    /// Route every push event the client understands into `sink`.
    ///
    /// Payloads that fail to decode are logged and dropped.
    pub fn register_push_events(&self, sink: &mpsc::UnboundedSender<PushEvent>) {
        let tx = sink.clone();
        self.port.on(
            events::NEW_PRODUCER,
            Arc::new(move |payload| match serde_json::from_value::<RemoteProducer>(payload) {
                Ok(descriptor) => {
                    let _ = tx.send(PushEvent::NewProducer(descriptor));
                }
                Err(e) => warn!(
                    target: "sfu.signaling",
                    error = %e,
                    "Dropping malformed newProducer event"
                ),
            }),
        );

        let tx = sink.clone();
        self.port.on(
            events::PRODUCER_CLOSED,
            Arc::new(
                move |payload| match serde_json::from_value::<ProducerClosedEvent>(payload) {
                    Ok(event) => {
                        let _ = tx.send(PushEvent::ProducerClosed {
                            producer_id: event.producer_id,
                        });
                    }
                    Err(e) => warn!(
                        target: "sfu.signaling",
                        error = %e,
                        "Dropping malformed producerClosed event"
                    ),
                },
            ),
        );
    }

    /// Remove every handler registered by [`Self::register_push_events`].
    pub fn unregister_push_events(&self) {
        for event in events::ALL {
            self.port.off(event);
        }
    }

    pub fn disconnect(&self) {
        self.port.disconnect();
    }

    async fn call<Req, Rep>(&self, name: &'static str, payload: &Req) -> Result<Rep, SignalingError>
    where
        Req: Serialize + Sync,
        Rep: DeserializeOwned,
    {
        let payload = encode(name, payload)?;
        debug!(target: "sfu.signaling", request = name, "Sending request");
        let reply = self.port.request(name, payload).await?;
        serde_json::from_value(reply).map_err(|e| SignalingError::MalformedReply {
            request: name.to_string(),
            reason: e.to_string(),
        })
    }
}

fn encode<T: Serialize>(name: &str, payload: &T) -> Result<Value, SignalingError> {
    serde_json::to_value(payload).map_err(|e| SignalingError::Encode {
        request: name.to_string(),
        reason: e.to_string(),
    })
}
