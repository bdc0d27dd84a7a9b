//! Transport pipe lifecycle and intent wiring.
//!
//! `TransportManager` owns at most one send pipe and one recv pipe for a
//! session. Each pipe gets its own [`PipeIntentHandler`], which binds the
//! pipe's two intent signals to exactly two signaling requests:
//!
//! | Intent | Request | Resolution |
//! |--------|---------|------------|
//! | connect | `connectTransport` | acknowledgement only |
//! | produce (send only) | `produce` | server producer id, relayed verbatim |
//!
//! Pipes created after the session's liveness token was cancelled are
//! closed on the spot, so a teardown racing pipe creation never leaks one.

use crate::errors::{ClientError, NegotiatorError, TransportError};
use crate::negotiator::{
    CapabilityNegotiator, DtlsParameters, PipeListener, RecvPipe, RtpParameters, SendPipe,
};
use crate::signaling::SignalingClient;
use async_trait::async_trait;
use common::types::{Direction, MediaKind, ProducerId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectState {
    Idle,
    Pending,
    Connected,
}

/// Clears an in-flight flag when the intent future completes or is dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Satisfies one pipe's intents through the signaling channel.
pub struct PipeIntentHandler {
    direction: Direction,
    signaling: SignalingClient,
    liveness: CancellationToken,
    connect_state: Mutex<ConnectState>,
    produce_in_flight: AtomicBool,
}

impl PipeIntentHandler {
    #[must_use]
    pub fn new(direction: Direction, signaling: SignalingClient, liveness: CancellationToken) -> Self {
        Self {
            direction,
            signaling,
            liveness,
            connect_state: Mutex::new(ConnectState::Idle),
            produce_in_flight: AtomicBool::new(false),
        }
    }

    /// True once the pipe's connect handshake has been acknowledged.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connect_state.lock() == ConnectState::Connected
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), TransportError> {
        if self.liveness.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }

        {
            let mut state = self.connect_state.lock();
            match *state {
                ConnectState::Pending => {
                    return Err(TransportError::IntentAlreadyPending {
                        direction: self.direction,
                        intent: "connect",
                    })
                }
                ConnectState::Connected => {
                    return Err(TransportError::AlreadyConnected(self.direction))
                }
                ConnectState::Idle => *state = ConnectState::Pending,
            }
        }

        debug!(target: "sfu.transport", direction = %self.direction, "Connect intent");
        let result = self
            .signaling
            .connect_transport(self.direction, dtls_parameters)
            .await;

        let mut state = self.connect_state.lock();
        match result {
            Ok(()) => {
                *state = ConnectState::Connected;
                info!(target: "sfu.transport", direction = %self.direction, "Pipe connected");
                Ok(())
            }
            Err(e) => {
                *state = ConnectState::Idle;
                Err(e.into())
            }
        }
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, TransportError> {
        if self.direction == Direction::Recv {
            return Err(TransportError::ProduceOnRecvPipe);
        }
        if self.liveness.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        if self.produce_in_flight.swap(true, Ordering::SeqCst) {
            return Err(TransportError::IntentAlreadyPending {
                direction: self.direction,
                intent: "produce",
            });
        }
        let _in_flight = InFlight(&self.produce_in_flight);

        debug!(target: "sfu.transport", kind = %kind, "Produce intent");
        let producer_id = self.signaling.produce(kind, rtp_parameters).await?;
        Ok(producer_id)
    }
}

#[async_trait]
impl PipeListener for PipeIntentHandler {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<(), NegotiatorError> {
        self.connect(dtls_parameters)
            .await
            .map_err(|e| NegotiatorError::IntentRejected(e.to_string()))
    }

    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, NegotiatorError> {
        self.produce(kind, rtp_parameters)
            .await
            .map_err(|e| NegotiatorError::IntentRejected(e.to_string()))
    }
}

/// Owns the send and recv pipes of one session.
pub struct TransportManager {
    signaling: SignalingClient,
    liveness: CancellationToken,
    send: Mutex<Option<Arc<dyn SendPipe>>>,
    recv: Mutex<Option<Arc<dyn RecvPipe>>>,
}

impl TransportManager {
    #[must_use]
    pub fn new(signaling: SignalingClient, liveness: CancellationToken) -> Self {
        Self {
            signaling,
            liveness,
            send: Mutex::new(None),
            recv: Mutex::new(None),
        }
    }

    /// Request send-pipe parameters, build the pipe and wire its intents.
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if teardown began meanwhile, otherwise the
    /// signaling or pipe-creation failure.
    #[instrument(skip_all, name = "sfu.transport.create_send_pipe")]
    pub async fn create_send_pipe(
        &self,
        negotiator: &dyn CapabilityNegotiator,
    ) -> Result<Arc<dyn SendPipe>, ClientError> {
        if self.send.lock().is_some() {
            return Err(TransportError::PipeExists(Direction::Send).into());
        }

        let options = self.signaling.create_send_transport().await?;
        self.ensure_live()?;

        let listener = Arc::new(PipeIntentHandler::new(
            Direction::Send,
            self.signaling.clone(),
            self.liveness.clone(),
        ));
        let pipe = negotiator
            .create_send_pipe(options, listener)
            .await
            .map_err(TransportError::Create)?;

        let mut slot = self.send.lock();
        if self.liveness.is_cancelled() || slot.is_some() {
            drop(slot);
            pipe.close();
            debug!(target: "sfu.transport", "Closed send pipe created after teardown");
            return Err(ClientError::SessionClosed);
        }
        *slot = Some(Arc::clone(&pipe));

        info!(target: "sfu.transport", transport_id = %pipe.id(), "Send pipe created");
        Ok(pipe)
    }

    /// Request recv-pipe parameters, build the pipe and wire its connect intent.
    ///
    /// # Errors
    ///
    /// Same as [`Self::create_send_pipe`].
    #[instrument(skip_all, name = "sfu.transport.create_recv_pipe")]
    pub async fn create_recv_pipe(
        &self,
        negotiator: &dyn CapabilityNegotiator,
    ) -> Result<Arc<dyn RecvPipe>, ClientError> {
        if self.recv.lock().is_some() {
            return Err(TransportError::PipeExists(Direction::Recv).into());
        }

        let options = self.signaling.create_recv_transport().await?;
        self.ensure_live()?;

        let listener = Arc::new(PipeIntentHandler::new(
            Direction::Recv,
            self.signaling.clone(),
            self.liveness.clone(),
        ));
        let pipe = negotiator
            .create_recv_pipe(options, listener)
            .await
            .map_err(TransportError::Create)?;

        let mut slot = self.recv.lock();
        if self.liveness.is_cancelled() || slot.is_some() {
            drop(slot);
            pipe.close();
            debug!(target: "sfu.transport", "Closed recv pipe created after teardown");
            return Err(ClientError::SessionClosed);
        }
        *slot = Some(Arc::clone(&pipe));

        info!(target: "sfu.transport", transport_id = %pipe.id(), "Recv pipe created");
        Ok(pipe)
    }

    /// Close the send pipe, then the recv pipe. Idempotent.
    pub fn close_all(&self) {
        if let Some(pipe) = self.send.lock().take() {
            pipe.close();
            info!(target: "sfu.transport", transport_id = %pipe.id(), "Send pipe closed");
        }
        if let Some(pipe) = self.recv.lock().take() {
            pipe.close();
            info!(target: "sfu.transport", transport_id = %pipe.id(), "Recv pipe closed");
        }
    }

    fn ensure_live(&self) -> Result<(), ClientError> {
        if self.liveness.is_cancelled() {
            warn!(target: "sfu.transport", "Session closed while transport request was in flight");
            return Err(ClientError::SessionClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::errors::SignalingError;
    use crate::signaling::{EventHandler, SignalingPort};
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    /// Port that answers connect/produce and can hold replies until released.
    #[derive(Default)]
    struct IntentPort {
        gate: Option<Arc<Notify>>,
        reject: bool,
        seen: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl SignalingPort for IntentPort {
        async fn request(&self, name: &str, payload: Value) -> Result<Value, SignalingError> {
            self.seen.lock().push((name.to_string(), payload));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.reject {
                return Err(SignalingError::Rejected {
                    request: name.to_string(),
                    reason: "nope".to_string(),
                });
            }
            match name {
                "produce" => Ok(json!({ "id": "server-producer-7" })),
                _ => Ok(json!({})),
            }
        }

        fn on(&self, _event: &str, _handler: EventHandler) {}

        fn off(&self, _event: &str) {}

        fn disconnect(&self) {}
    }

    fn handler(port: Arc<IntentPort>, direction: Direction) -> PipeIntentHandler {
        PipeIntentHandler::new(
            direction,
            SignalingClient::new(port),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_connect_issues_connect_transport() {
        let port = Arc::new(IntentPort::default());
        let handler = handler(port.clone(), Direction::Recv);

        handler
            .on_connect(DtlsParameters(json!({ "role": "client" })))
            .await
            .unwrap();

        assert!(handler.is_connected());
        let seen = port.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "connectTransport");
        assert_eq!(
            seen[0].1,
            json!({ "direction": "recv", "dtlsParameters": { "role": "client" } })
        );
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let port = Arc::new(IntentPort::default());
        let handler = handler(port.clone(), Direction::Send);

        handler.on_connect(DtlsParameters::default()).await.unwrap();
        let err = handler
            .on_connect(DtlsParameters::default())
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiatorError::IntentRejected(_)));
        assert_eq!(port.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_can_be_retried_by_pipe() {
        let port = Arc::new(IntentPort {
            reject: true,
            ..IntentPort::default()
        });
        let handler = handler(port, Direction::Send);

        assert!(handler.on_connect(DtlsParameters::default()).await.is_err());
        assert!(!handler.is_connected());
        assert_eq!(*handler.connect_state.lock(), ConnectState::Idle);
    }

    #[tokio::test]
    async fn test_produce_relays_server_id_verbatim() {
        let port = Arc::new(IntentPort::default());
        let handler = handler(port.clone(), Direction::Send);

        let id = handler
            .on_produce(MediaKind::Video, RtpParameters(json!({ "codecs": [] })))
            .await
            .unwrap();

        assert_eq!(id, ProducerId::new("server-producer-7"));
        assert_eq!(port.seen.lock()[0].1["kind"], "video");
    }

    #[tokio::test]
    async fn test_produce_on_recv_pipe_rejected() {
        let port = Arc::new(IntentPort::default());
        let handler = handler(port.clone(), Direction::Recv);

        let err = handler
            .on_produce(MediaKind::Audio, RtpParameters::default())
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiatorError::IntentRejected(msg) if msg.contains("recv")));
        assert!(port.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_produce_intent_rejected() {
        let gate = Arc::new(Notify::new());
        let port = Arc::new(IntentPort {
            gate: Some(Arc::clone(&gate)),
            ..IntentPort::default()
        });
        let handler = Arc::new(handler(port.clone(), Direction::Send));

        let first = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                handler
                    .on_produce(MediaKind::Audio, RtpParameters::default())
                    .await
            })
        };

        // Let the first intent reach the gated request.
        while port.seen.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        let second = handler
            .on_produce(MediaKind::Video, RtpParameters::default())
            .await;
        assert!(second.is_err());

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());

        // The in-flight flag is cleared once the first intent resolves.
        assert!(!handler.produce_in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_intent_after_teardown_rejected() {
        let port = Arc::new(IntentPort::default());
        let liveness = CancellationToken::new();
        let handler = PipeIntentHandler::new(
            Direction::Send,
            SignalingClient::new(port.clone()),
            liveness.clone(),
        );

        liveness.cancel();
        assert!(handler.on_connect(DtlsParameters::default()).await.is_err());
        assert!(handler
            .on_produce(MediaKind::Audio, RtpParameters::default())
            .await
            .is_err());
        assert!(port.seen.lock().is_empty());
    }
}
