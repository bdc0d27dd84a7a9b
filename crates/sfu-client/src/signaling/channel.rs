//! Frame-channel [`SignalingPort`].
//!
//! `ChannelSignaling` speaks the signaling protocol over a pair of frame
//! channels. Whatever moves frames to and from the server (a WebSocket
//! task, an in-process loopback) sits on the other end of those channels.
//!
//! A background actor owns the pending-request table:
//!
//! - each request gets a fresh id and a oneshot, its single resolution point
//! - request frames wait in a local queue until the outbound channel has
//!   room, so a slow writer never stalls inbound processing
//! - a `Response` frame resolves the matching oneshot and removes it
//! - an `Event` frame is dispatched to the registered handler, if any
//! - when the inbound side ends or `disconnect` is called, every pending
//!   request fails with `ChannelClosed`

use super::{EventHandler, SignalingPort};
use crate::errors::SignalingError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default buffer size for the command mailbox.
const COMMAND_CHANNEL_BUFFER: usize = 64;

/// One frame on the signaling wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalingFrame {
    /// Client to server.
    Request {
        id: u64,
        name: String,
        payload: Value,
    },
    /// Server to client, answering the request with the same id.
    Response {
        id: u64,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Server to client, unsolicited.
    Event { name: String, payload: Value },
}

enum Command {
    Request {
        name: String,
        payload: Value,
        respond_to: oneshot::Sender<Result<Value, SignalingError>>,
    },
}

type HandlerMap = Arc<RwLock<HashMap<String, EventHandler>>>;

struct PendingRequest {
    name: String,
    respond_to: oneshot::Sender<Result<Value, SignalingError>>,
}

/// [`SignalingPort`] over a pair of frame channels.
#[derive(Clone)]
pub struct ChannelSignaling {
    commands: mpsc::Sender<Command>,
    handlers: HandlerMap,
    cancel_token: CancellationToken,
}

impl ChannelSignaling {
    /// Spawn the channel actor.
    ///
    /// `outbound` receives request frames; `inbound` delivers response and
    /// event frames. Returns the port and the actor's join handle.
    #[must_use]
    pub fn spawn(
        outbound: mpsc::Sender<SignalingFrame>,
        inbound: mpsc::Receiver<SignalingFrame>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let cancel_token = CancellationToken::new();

        let actor = ChannelActor {
            commands: command_rx,
            outbound,
            inbound,
            pending: HashMap::new(),
            outgoing: VecDeque::new(),
            next_id: 1,
            handlers: Arc::clone(&handlers),
            cancel_token: cancel_token.clone(),
        };
        let task_handle = tokio::spawn(actor.run());

        (
            Self {
                commands,
                handlers,
                cancel_token,
            },
            task_handle,
        )
    }

    /// True until the channel is disconnected or the inbound side ends.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }
}

#[async_trait]
impl SignalingPort for ChannelSignaling {
    async fn request(&self, name: &str, payload: Value) -> Result<Value, SignalingError> {
        if self.cancel_token.is_cancelled() {
            return Err(SignalingError::ChannelClosed);
        }

        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                name: name.to_string(),
                payload,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalingError::ChannelClosed)?;

        rx.await.map_err(|_| SignalingError::ChannelClosed)?
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.handlers.write().insert(event.to_string(), handler);
    }

    fn off(&self, event: &str) {
        self.handlers.write().remove(event);
    }

    fn disconnect(&self) {
        self.cancel_token.cancel();
    }
}

struct ChannelActor {
    commands: mpsc::Receiver<Command>,
    outbound: mpsc::Sender<SignalingFrame>,
    inbound: mpsc::Receiver<SignalingFrame>,
    pending: HashMap<u64, PendingRequest>,
    /// Request frames not yet accepted by the outbound channel.
    outgoing: VecDeque<(u64, SignalingFrame)>,
    next_id: u64,
    handlers: HandlerMap,
    cancel_token: CancellationToken,
}

impl ChannelActor {
    async fn run(mut self) {
        debug!(target: "sfu.signaling", "Signaling channel actor started");

        let outbound = self.outbound.clone();
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "sfu.signaling", "Signaling channel disconnected");
                    break;
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                permit = outbound.reserve(), if !self.outgoing.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some((id, frame)) = self.outgoing.pop_front() {
                            permit.send(frame);
                            debug!(target: "sfu.signaling", request_id = id, "Request sent");
                        }
                    }
                    // `permit` still borrows `outbound`; touch disjoint fields only.
                    Err(_) => fail_outgoing(&mut self.outgoing, &mut self.pending),
                },

                frame = self.inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => {
                        debug!(target: "sfu.signaling", "Inbound frame channel closed");
                        break;
                    }
                },
            }
        }

        self.cancel_token.cancel();
        let abandoned = self.pending.len();
        for (_, request) in self.pending.drain() {
            let _ = request.respond_to.send(Err(SignalingError::ChannelClosed));
        }

        info!(
            target: "sfu.signaling",
            abandoned_requests = abandoned,
            "Signaling channel actor stopped"
        );
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Request {
                name,
                payload,
                respond_to,
            } => {
                let id = self.next_id;
                self.next_id += 1;

                let frame = SignalingFrame::Request {
                    id,
                    name: name.clone(),
                    payload,
                };
                debug!(target: "sfu.signaling", request = %name, request_id = id, "Request queued");
                self.pending.insert(id, PendingRequest { name, respond_to });
                self.outgoing.push_back((id, frame));
            }
        }
    }


    fn handle_frame(&mut self, frame: SignalingFrame) {
        match frame {
            SignalingFrame::Response { id, payload, error } => {
                let Some(request) = self.pending.remove(&id) else {
                    warn!(target: "sfu.signaling", request_id = id, "Response for unknown request");
                    return;
                };
                let result = match error {
                    Some(reason) => Err(SignalingError::Rejected {
                        request: request.name,
                        reason,
                    }),
                    None => Ok(payload),
                };
                let _ = request.respond_to.send(result);
            }

            SignalingFrame::Event { name, payload } => {
                let handler = self.handlers.read().get(&name).cloned();
                match handler {
                    Some(handler) => handler(payload),
                    None => {
                        debug!(target: "sfu.signaling", event = %name, "No handler for event");
                    }
                }
            }

            SignalingFrame::Request { name, .. } => {
                warn!(target: "sfu.signaling", request = %name, "Ignoring request frame from server");
            }
        }
    }
}

/// The outbound side is gone: fail every request that never left.
fn fail_outgoing(
    outgoing: &mut VecDeque<(u64, SignalingFrame)>,
    pending: &mut HashMap<u64, PendingRequest>,
) {
    warn!(
        target: "sfu.signaling",
        requests = outgoing.len(),
        "Outbound channel closed"
    );
    for (id, _) in outgoing.drain(..) {
        if let Some(request) = pending.remove(&id) {
            let _ = request.respond_to.send(Err(SignalingError::ChannelClosed));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn harness() -> (
        ChannelSignaling,
        mpsc::Receiver<SignalingFrame>,
        mpsc::Sender<SignalingFrame>,
        JoinHandle<()>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (port, handle) = ChannelSignaling::spawn(out_tx, in_rx);
        (port, out_rx, in_tx, handle)
    }

    #[tokio::test]
    async fn test_request_resolved_by_matching_response() {
        let (port, mut server_rx, server_tx, _handle) = harness();

        let server = tokio::spawn(async move {
            let Some(SignalingFrame::Request { id, name, payload }) = server_rx.recv().await else {
                panic!("expected request frame");
            };
            assert_eq!(name, "produce");
            assert_eq!(payload["kind"], "audio");
            server_tx
                .send(SignalingFrame::Response {
                    id,
                    payload: json!({ "id": "producer-1" }),
                    error: None,
                })
                .await
                .unwrap();
        });

        let reply = port
            .request("produce", json!({ "kind": "audio" }))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "id": "producer-1" }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (port, mut server_rx, server_tx, _handle) = harness();

        let server = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..2 {
                if let Some(SignalingFrame::Request { id, name, .. }) = server_rx.recv().await {
                    ids.push((id, name));
                }
            }
            // Answer in reverse order.
            for (id, name) in ids.into_iter().rev() {
                server_tx
                    .send(SignalingFrame::Response {
                        id,
                        payload: json!({ "echo": name }),
                        error: None,
                    })
                    .await
                    .unwrap();
            }
        });

        let (a, b) = tokio::join!(
            port.request("first", json!({})),
            port.request("second", json!({}))
        );
        assert_eq!(a.unwrap()["echo"], "first");
        assert_eq!(b.unwrap()["echo"], "second");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_is_rejection() {
        let (port, mut server_rx, server_tx, _handle) = harness();

        tokio::spawn(async move {
            if let Some(SignalingFrame::Request { id, .. }) = server_rx.recv().await {
                server_tx
                    .send(SignalingFrame::Response {
                        id,
                        payload: Value::Null,
                        error: Some("room full".to_string()),
                    })
                    .await
                    .unwrap();
            }
        });

        let err = port.request("joinRoom", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            SignalingError::Rejected {
                request: "joinRoom".to_string(),
                reason: "room full".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_events_dispatched_to_handler() {
        let (port, _server_rx, server_tx, _handle) = harness();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        port.on(
            "newProducer",
            Arc::new(move |_payload| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        server_tx
            .send(SignalingFrame::Event {
                name: "newProducer".to_string(),
                payload: json!({}),
            })
            .await
            .unwrap();
        server_tx
            .send(SignalingFrame::Event {
                name: "unrelated".to_string(),
                payload: json!({}),
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        port.off("newProducer");
        server_tx
            .send(SignalingFrame::Event {
                name: "newProducer".to_string(),
                payload: json!({}),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let (port, mut server_rx, _server_tx, handle) = harness();

        let requester = port.clone();
        let pending = tokio::spawn(async move { requester.request("consume", json!({})).await });

        // Wait until the request is on the wire, then drop the channel.
        assert!(server_rx.recv().await.is_some());
        port.disconnect();

        assert_eq!(
            pending.await.unwrap(),
            Err(SignalingError::ChannelClosed)
        );
        handle.await.unwrap();

        assert!(!port.is_connected());
        assert_eq!(
            port.request("leaveRoom", json!({})).await,
            Err(SignalingError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_inbound_close_ends_actor() {
        let (port, _server_rx, server_tx, handle) = harness();

        drop(server_tx);
        handle.await.unwrap();

        assert!(!port.is_connected());
    }

    #[tokio::test]
    async fn test_full_outbound_does_not_stall_events() {
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (port, _handle) = ChannelSignaling::spawn(out_tx, in_rx);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        port.on(
            "producerClosed",
            Arc::new(move |_payload| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Nobody reads the outbound side yet: the second and third request
        // frames cannot be handed over.
        let mut requests = Vec::new();
        for name in ["produce", "consume", "leaveRoom"] {
            let requester = port.clone();
            requests.push(tokio::spawn(
                async move { requester.request(name, json!({})).await },
            ));
        }

        in_tx
            .send(SignalingFrame::Event {
                name: "producerClosed".to_string(),
                payload: json!({ "producerId": "p1" }),
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("event not dispatched while outbound was full");

        let mut names = Vec::new();
        for _ in 0..3 {
            let Some(SignalingFrame::Request { id, name, .. }) = out_rx.recv().await else {
                panic!("expected request frame");
            };
            names.push(name);
            in_tx
                .send(SignalingFrame::Response {
                    id,
                    payload: json!({}),
                    error: None,
                })
                .await
                .unwrap();
        }
        names.sort();
        assert_eq!(names, vec!["consume", "leaveRoom", "produce"]);

        for request in requests {
            assert!(request.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_closed_outbound_fails_request() {
        let (out_tx, out_rx) = mpsc::channel(1);
        let (_in_tx, in_rx) = mpsc::channel(16);
        let (port, _handle) = ChannelSignaling::spawn(out_tx, in_rx);
        drop(out_rx);

        assert_eq!(
            port.request("joinRoom", json!({})).await,
            Err(SignalingError::ChannelClosed)
        );
    }

    #[test]
    fn test_frame_wire_format() {
        let frame = SignalingFrame::Request {
            id: 7,
            name: "joinRoom".to_string(),
            payload: json!({ "roomId": "abc123" }),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "request", "id": 7, "name": "joinRoom", "payload": { "roomId": "abc123" } })
        );

        let response: SignalingFrame =
            serde_json::from_value(json!({ "type": "response", "id": 7 })).unwrap();
        assert_eq!(
            response,
            SignalingFrame::Response {
                id: 7,
                payload: Value::Null,
                error: None
            }
        );
    }
}
