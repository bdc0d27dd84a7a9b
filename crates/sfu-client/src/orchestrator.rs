//! Session orchestration.
//!
//! [`SessionOrchestrator`] drives the join protocol, owns the single live
//! [`Session`], and tears it down. At most one session is live at a time.
//!
//! # Join
//!
//! 1. `joinRoom`: router capabilities plus the existing-producer snapshot.
//! 2. Load the capabilities into a fresh negotiator.
//! 3. Create the send pipe, acquire local media, produce every track
//!    serially.
//! 4. Create the recv pipe, consume every snapshot producer.
//! 5. Register push-event handlers; the session is `Active`.
//!
//! Publication finishes before subscription starts. The liveness token is
//! checked after every suspension point; a join cancelled by
//! [`SessionOrchestrator::close_session`] returns `ClientError::SessionClosed`.
//!
//! # Teardown
//!
//! Send pipe, recv pipe, local tracks, push-event handlers, `leaveRoom` (and
//! disconnect if the channel is session-scoped), peer streams, `Idle`. In that
//! order, and idempotent.

use crate::config::Config;
use crate::errors::ClientError;
use crate::media::MediaSource;
use crate::negotiator::NegotiatorFactory;
use crate::observability::metrics;
use crate::publication::PublishFailure;
use crate::session::{Session, SessionState};
use crate::signaling::{PushEvent, SignalingClient, SignalingPort};
use crate::subscription::{ConsumeOutcome, PeerStreams, SubscriptionManager};
use common::types::{ProducerId, RoomId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What a successful join did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSummary {
    pub room_id: RoomId,
    /// Producer ids of the published local tracks.
    pub produced: Vec<ProducerId>,
    /// Local tracks that were skipped.
    pub publish_failures: Vec<PublishFailure>,
    /// Snapshot producers that were subscribed.
    pub subscribed: usize,
    /// Snapshot producers whose consume failed.
    pub subscribe_failures: usize,
}

/// Drives join and teardown for one participant.
pub struct SessionOrchestrator {
    config: Arc<Config>,
    signaling: SignalingClient,
    negotiators: Arc<dyn NegotiatorFactory>,
    media: Arc<dyn MediaSource>,
    session: Mutex<Option<Arc<Session>>>,
    /// Serializes session installation against teardown.
    lifecycle: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<SessionState>,
    streams_tx: Arc<watch::Sender<PeerStreams>>,
}

impl SessionOrchestrator {
    #[must_use]
    pub fn new(
        config: Config,
        signaling: Arc<dyn SignalingPort>,
        negotiators: Arc<dyn NegotiatorFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (streams_tx, _) = watch::channel(PeerStreams::new());
        Self {
            config: Arc::new(config),
            signaling: SignalingClient::new(signaling),
            negotiators,
            media,
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            state_tx,
            streams_tx: Arc::new(streams_tx),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Follow state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Current peer streams, keyed by origin peer.
    #[must_use]
    pub fn peer_streams(&self) -> PeerStreams {
        self.streams_tx.borrow().clone()
    }

    /// Follow peer stream changes. The rendering layer only reads.
    #[must_use]
    pub fn watch_peer_streams(&self) -> watch::Receiver<PeerStreams> {
        self.streams_tx.subscribe()
    }

    /// Room of the live session, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        self.session.lock().as_ref().map(|s| s.room_id().clone())
    }

    /// Join a room, publish local media and subscribe to existing producers.
    ///
    /// # Errors
    ///
    /// - `InvalidRoomId` for an empty room id.
    /// - `AlreadyJoined` while another session is live.
    /// - A fatal error from any join step; the session is torn down first.
    /// - `SessionClosed` if `close_session` ran while the join was in flight.
    #[instrument(skip_all, name = "sfu.session.join", fields(room_id = %room_id))]
    pub async fn join(&self, room_id: RoomId) -> Result<JoinSummary, ClientError> {
        if room_id.is_empty() {
            return Err(ClientError::InvalidRoomId);
        }

        let session = {
            let _lifecycle = self.lifecycle.lock().await;
            let mut slot = self.session.lock();
            if let Some(existing) = slot.as_ref() {
                return Err(ClientError::AlreadyJoined(existing.room_id().clone()));
            }
            let session = Arc::new(Session::new(
                room_id.clone(),
                self.signaling.clone(),
                self.negotiators.create(),
            ));
            *slot = Some(Arc::clone(&session));
            self.state_tx.send_replace(SessionState::Joining);
            session
        };

        info!(target: "sfu.session", "Joining room");
        let started = Instant::now();

        match self.run_join(&session).await {
            Ok(summary) => {
                info!(
                    target: "sfu.session",
                    produced = summary.produced.len(),
                    publish_failures = summary.publish_failures.len(),
                    subscribed = summary.subscribed,
                    subscribe_failures = summary.subscribe_failures,
                    "Session active"
                );
                metrics::record_join("success", started.elapsed());
                Ok(summary)
            }
            Err(e) if session.is_live() => {
                warn!(target: "sfu.session", error = %e, "Join failed, tearing session down");
                metrics::record_join(e.metric_label(), started.elapsed());
                self.abort_join(&session).await;
                Err(e)
            }
            Err(e) => {
                debug!(target: "sfu.session", error = %e, "Join cancelled by teardown");
                metrics::record_join(
                    ClientError::SessionClosed.metric_label(),
                    started.elapsed(),
                );
                Err(ClientError::SessionClosed)
            }
        }
    }

    async fn run_join(&self, session: &Arc<Session>) -> Result<JoinSummary, ClientError> {
        let reply = self.signaling.join_room(session.room_id()).await?;
        session.ensure_live()?;
        debug!(
            target: "sfu.session",
            existing_producers = reply.existing_producers.len(),
            "Join accepted"
        );

        session
            .negotiator()
            .load(reply.router_capabilities)
            .await
            .map_err(ClientError::CapabilityLoad)?;
        session.ensure_live()?;
        self.advance(session, SessionState::CapabilitiesLoaded);

        self.advance(session, SessionState::Publishing);
        let send_pipe = session
            .transports()
            .create_send_pipe(session.negotiator())
            .await?;
        let tracks = session
            .publication()
            .acquire(self.media.as_ref(), self.config.media_constraints())
            .await?;
        let report = session
            .publication()
            .publish(send_pipe.as_ref(), session.negotiator(), &tracks)
            .await?;
        session.ensure_live()?;

        self.advance(session, SessionState::Subscribing);
        let recv_pipe = session
            .transports()
            .create_recv_pipe(session.negotiator())
            .await?;
        let rtp_capabilities = session
            .negotiator()
            .rtp_capabilities()
            .map_err(ClientError::CapabilityLoad)?;
        let subscriptions = Arc::new(SubscriptionManager::new(
            self.signaling.clone(),
            recv_pipe,
            rtp_capabilities,
            self.config.subscription_policy(),
            session.liveness(),
            Arc::clone(&self.streams_tx),
        ));
        session.set_subscriptions(Arc::clone(&subscriptions));

        let mut subscribed = 0;
        let mut subscribe_failures = 0;
        for descriptor in &reply.existing_producers {
            match subscriptions.consume_or_log(descriptor).await {
                Some(ConsumeOutcome::Subscribed(_)) => subscribed += 1,
                Some(_) => {}
                None => subscribe_failures += 1,
            }
        }
        session.ensure_live()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.signaling.register_push_events(&events_tx);
        session.set_event_pump(tokio::spawn(run_event_pump(
            events_rx,
            subscriptions,
            session.liveness(),
        )));
        if !session.is_live() {
            // Teardown ran between the last check and registration.
            self.signaling.unregister_push_events();
            if let Some(pump) = session.take_event_pump() {
                pump.abort();
            }
            return Err(ClientError::SessionClosed);
        }
        self.advance(session, SessionState::Active);

        Ok(JoinSummary {
            room_id: session.room_id().clone(),
            produced: report.produced,
            publish_failures: report.failed,
            subscribed,
            subscribe_failures,
        })
    }

    /// Publish `state` if `session` is still the live session.
    fn advance(&self, session: &Arc<Session>, state: SessionState) {
        let slot = self.session.lock();
        let current = slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session));
        if current && session.is_live() {
            self.state_tx.send_replace(state);
            debug!(target: "sfu.session", state = %state, "State advanced");
        }
    }

    async fn abort_join(&self, session: &Arc<Session>) {
        let _lifecycle = self.lifecycle.lock().await;
        let owned = {
            let mut slot = self.session.lock();
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(session) = owned {
            self.teardown(&session).await;
        }
    }

    /// Tear down the live session. A no-op when none is live.
    #[instrument(skip_all, name = "sfu.session.close")]
    pub async fn close_session(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(session) = self.session.lock().take() else {
            debug!(target: "sfu.session", "No live session to close");
            return;
        };
        self.teardown(&session).await;
    }

    async fn teardown(&self, session: &Session) {
        let from = self.state_tx.send_replace(SessionState::Closing);
        info!(target: "sfu.session", room_id = %session.room_id(), from = %from, "Closing session");

        session.cancel();

        session.transports().close_all();
        session.publication().stop_all();

        self.signaling.unregister_push_events();
        if let Some(pump) = session.take_event_pump() {
            pump.abort();
            let _ = pump.await;
        }

        if let Err(e) = self.signaling.leave_room().await {
            debug!(target: "sfu.session", error = %e, "leaveRoom failed during teardown");
        }
        if self.config.disconnect_on_leave {
            self.signaling.disconnect();
        }

        if let Some(subscriptions) = session.take_subscriptions() {
            subscriptions.clear();
        }
        self.streams_tx.send_replace(PeerStreams::new());
        metrics::set_peer_streams_active(0);

        if self.session.lock().is_none() {
            self.state_tx.send_replace(SessionState::Idle);
        }
        metrics::record_teardown(from.as_str());
        info!(target: "sfu.session", "Session closed");
    }
}

/// Drains push events for one session.
///
/// Each announced producer is claimed in event order, then consumed on its
/// own task so distinct producers proceed concurrently. The pump ends when
/// the session closes.
async fn run_event_pump(
    mut events: mpsc::UnboundedReceiver<PushEvent>,
    subscriptions: Arc<SubscriptionManager>,
    liveness: CancellationToken,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            () = liveness.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                metrics::record_push_event(event.name());
                match event {
                    PushEvent::NewProducer(descriptor) => {
                        // Claimed here, before the next event is read.
                        if let Ok(claim) = subscriptions.claim(&descriptor) {
                            let subscriptions = Arc::clone(&subscriptions);
                            tasks.spawn(async move {
                                subscriptions.consume_claimed_or_log(claim).await;
                            });
                        }
                    }
                    PushEvent::ProducerClosed { producer_id } => {
                        subscriptions.remove_producer(&producer_id);
                    }
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    tasks.shutdown().await;
    debug!(target: "sfu.session", "Event pump stopped");
}
