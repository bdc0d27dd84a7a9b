//! SFU client error types.
//!
//! [`ClientError`] is what the orchestrator surfaces to its caller. Each
//! collaborator has its own narrower error enum that converts into it.
//!
//! Severity follows the session error taxonomy:
//! - `Fatal`: aborts the join attempt and tears the session down
//!   (capability load, local media acquisition, channel failures before
//!   the session is active).
//! - `Recoverable`: one track failed to produce or one remote track failed
//!   to subscribe. Logged, skipped, never retried.
//! - `Discarded`: a completion arrived after teardown began. Dropped silently.

use common::types::{Direction, MediaKind, ProducerId, RoomId};
use thiserror::Error;

/// Errors from the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    /// The server answered the request with an error.
    #[error("Request {request} rejected: {reason}")]
    Rejected { request: String, reason: String },

    /// The channel closed before a reply arrived.
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// The reply could not be decoded into the expected shape.
    #[error("Malformed reply to {request}: {reason}")]
    MalformedReply { request: String, reason: String },

    /// The request payload could not be encoded.
    #[error("Failed to encode {request}: {reason}")]
    Encode { request: String, reason: String },
}

/// Errors from the capability-negotiation library.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiatorError {
    /// An operation that requires loaded capabilities was called before `load`.
    #[error("Capabilities not loaded")]
    NotLoaded,

    /// Loading the router capabilities failed.
    #[error("Capability load failed: {0}")]
    Load(String),

    /// The loaded capabilities do not allow producing this kind.
    #[error("Cannot produce {0}")]
    CannotProduce(MediaKind),

    /// The pipe was closed before the operation completed.
    #[error("Pipe closed")]
    PipeClosed,

    /// The intent listener rejected a connect or produce intent.
    #[error("Intent rejected: {0}")]
    IntentRejected(String),

    /// Any other library failure.
    #[error("Negotiation failed: {0}")]
    Failed(String),
}

/// Errors acquiring local media.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    /// The user or platform refused access to the capture device.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No capture device of the requested kind exists.
    #[error("No capture device: {0}")]
    DeviceNotFound(String),

    /// Any other capture failure.
    #[error("Media acquisition failed: {0}")]
    Failed(String),
}

/// Errors from transport pipe management and intent handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The negotiator could not build the pipe.
    #[error("Pipe creation failed: {0}")]
    Create(NegotiatorError),

    /// A pipe of this direction already exists for the session.
    #[error("{0} pipe already exists")]
    PipeExists(Direction),

    /// The pipe of this direction has not been created.
    #[error("{0} pipe not created")]
    PipeMissing(Direction),

    /// A second intent of the same kind fired before the first was satisfied.
    #[error("{direction} pipe already has a {intent} intent pending")]
    IntentAlreadyPending {
        direction: Direction,
        intent: &'static str,
    },

    /// A connect intent fired on a pipe whose handshake already completed.
    #[error("{0} pipe already connected")]
    AlreadyConnected(Direction),

    /// A produce intent fired on the recv pipe.
    #[error("Produce intent on recv pipe")]
    ProduceOnRecvPipe,

    /// The intent arrived after the session was torn down.
    #[error("Intent arrived after session close")]
    SessionClosed,

    /// The signaling request backing the intent failed.
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

/// How an error affects the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Aborts the join and returns the session to `Idle`.
    Fatal,
    /// Logged and skipped; the join or session continues.
    Recoverable,
    /// Arrived after teardown; dropped without reporting.
    Discarded,
}

/// SFU client error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The room identifier is empty.
    #[error("Invalid room id")]
    InvalidRoomId,

    /// A session is already live; close it before joining again.
    #[error("Already joined room {0}")]
    AlreadyJoined(RoomId),

    /// A signaling request failed.
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Loading the server capabilities failed.
    #[error("Capability load failed: {0}")]
    CapabilityLoad(NegotiatorError),

    /// Local media acquisition failed.
    #[error("Local media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    /// Creating or driving a transport pipe failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// One local track failed to produce.
    #[error("Produce failed for {kind} track {track_id}: {reason}")]
    Produce {
        track_id: String,
        kind: MediaKind,
        reason: String,
    },

    /// One remote producer failed to subscribe.
    #[error("Consume failed for producer {producer_id}: {reason}")]
    Consume {
        producer_id: ProducerId,
        reason: String,
    },

    /// The session was torn down while the operation was in flight.
    #[error("Session closed")]
    SessionClosed,
}

impl ClientError {
    /// Severity of this error when it occurs during a join.
    ///
    /// Signaling failures are fatal here; once the session is active the
    /// subscription path treats a failed consume as recoverable regardless
    /// of its cause.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            ClientError::InvalidRoomId
            | ClientError::AlreadyJoined(_)
            | ClientError::Signaling(_)
            | ClientError::CapabilityLoad(_)
            | ClientError::MediaAcquisition(_)
            | ClientError::Transport(_) => Severity::Fatal,
            ClientError::Produce { .. } | ClientError::Consume { .. } => Severity::Recoverable,
            ClientError::SessionClosed => Severity::Discarded,
        }
    }

    /// Returns true if this error aborts a join attempt.
    #[must_use]
    pub fn is_fatal_to_join(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Bounded label for metrics.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            ClientError::InvalidRoomId => "invalid_room_id",
            ClientError::AlreadyJoined(_) => "already_joined",
            ClientError::Signaling(_) => "signaling",
            ClientError::CapabilityLoad(_) => "capability_load",
            ClientError::MediaAcquisition(_) => "media_acquisition",
            ClientError::Transport(_) => "transport",
            ClientError::Produce { .. } => "produce",
            ClientError::Consume { .. } => "consume",
            ClientError::SessionClosed => "session_closed",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            ClientError::CapabilityLoad(NegotiatorError::Load("bad caps".to_string())).severity(),
            Severity::Fatal
        );
        assert_eq!(
            ClientError::MediaAcquisition(MediaError::PermissionDenied("camera".to_string()))
                .severity(),
            Severity::Fatal
        );
        assert_eq!(
            ClientError::Signaling(SignalingError::ChannelClosed).severity(),
            Severity::Fatal
        );
        assert_eq!(
            ClientError::Produce {
                track_id: "t1".to_string(),
                kind: MediaKind::Audio,
                reason: "boom".to_string(),
            }
            .severity(),
            Severity::Recoverable
        );
        assert_eq!(
            ClientError::Consume {
                producer_id: ProducerId::new("p1"),
                reason: "boom".to_string(),
            }
            .severity(),
            Severity::Recoverable
        );
        assert_eq!(ClientError::SessionClosed.severity(), Severity::Discarded);
    }

    #[test]
    fn test_is_fatal_to_join() {
        assert!(ClientError::InvalidRoomId.is_fatal_to_join());
        assert!(!ClientError::SessionClosed.is_fatal_to_join());
    }

    #[test]
    fn test_transport_error_from_signaling() {
        let err: TransportError = SignalingError::ChannelClosed.into();
        assert_eq!(err, TransportError::Signaling(SignalingError::ChannelClosed));

        let client: ClientError = err.into();
        assert_eq!(client.metric_label(), "transport");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!(
                "{}",
                SignalingError::Rejected {
                    request: "joinRoom".to_string(),
                    reason: "room full".to_string(),
                }
            ),
            "Request joinRoom rejected: room full"
        );

        assert_eq!(
            format!(
                "{}",
                TransportError::IntentAlreadyPending {
                    direction: Direction::Send,
                    intent: "produce",
                }
            ),
            "send pipe already has a produce intent pending"
        );

        assert_eq!(
            format!("{}", ClientError::AlreadyJoined(RoomId::new("abc123"))),
            "Already joined room abc123"
        );
    }
}
