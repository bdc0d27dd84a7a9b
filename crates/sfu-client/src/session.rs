//! One joined room.
//!
//! A `Session` is created when a join starts and dropped after teardown. It
//! owns everything scoped to the room: the negotiator instance, both pipes,
//! the local tracks and producers, the consumers, and the push-event pump.
//!
//! Its liveness token is the only cancellation mechanism. Every collaborator
//! gets a clone and checks it before acting on an asynchronous completion.

use crate::errors::ClientError;
use crate::negotiator::CapabilityNegotiator;
use crate::publication::PublicationManager;
use crate::signaling::SignalingClient;
use crate::subscription::SubscriptionManager;
use crate::transport::TransportManager;
use common::types::RoomId;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Join protocol state.
///
/// `Idle → Joining → CapabilitiesLoaded → Publishing → Subscribing → Active`,
/// then `Closing → Idle` on teardown. A failed join goes through `Closing`
/// back to `Idle` from whichever state it reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Joining,
    CapabilitiesLoaded,
    Publishing,
    Subscribing,
    Active,
    Closing,
}

impl SessionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Joining => "joining",
            SessionState::CapabilitiesLoaded => "capabilities_loaded",
            SessionState::Publishing => "publishing",
            SessionState::Subscribing => "subscribing",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) struct Session {
    room_id: RoomId,
    liveness: CancellationToken,
    negotiator: Arc<dyn CapabilityNegotiator>,
    transports: TransportManager,
    publication: PublicationManager,
    subscriptions: Mutex<Option<Arc<SubscriptionManager>>>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(
        room_id: RoomId,
        signaling: SignalingClient,
        negotiator: Arc<dyn CapabilityNegotiator>,
    ) -> Self {
        let liveness = CancellationToken::new();
        Self {
            room_id,
            transports: TransportManager::new(signaling, liveness.clone()),
            publication: PublicationManager::new(liveness.clone()),
            liveness,
            negotiator,
            subscriptions: Mutex::new(None),
            event_pump: Mutex::new(None),
        }
    }

    pub(crate) fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub(crate) fn liveness(&self) -> CancellationToken {
        self.liveness.clone()
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.liveness.is_cancelled()
    }

    /// Fail with `SessionClosed` once teardown has begun.
    pub(crate) fn ensure_live(&self) -> Result<(), ClientError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(ClientError::SessionClosed)
        }
    }

    /// Drop the liveness flag. Every later completion discards itself.
    pub(crate) fn cancel(&self) {
        self.liveness.cancel();
    }

    pub(crate) fn negotiator(&self) -> &dyn CapabilityNegotiator {
        self.negotiator.as_ref()
    }

    pub(crate) fn transports(&self) -> &TransportManager {
        &self.transports
    }

    pub(crate) fn publication(&self) -> &PublicationManager {
        &self.publication
    }

    pub(crate) fn set_subscriptions(&self, subscriptions: Arc<SubscriptionManager>) {
        *self.subscriptions.lock() = Some(subscriptions);
    }

    pub(crate) fn take_subscriptions(&self) -> Option<Arc<SubscriptionManager>> {
        self.subscriptions.lock().take()
    }

    pub(crate) fn set_event_pump(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.event_pump.lock().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn take_event_pump(&self) -> Option<JoinHandle<()>> {
        self.event_pump.lock().take()
    }
}
