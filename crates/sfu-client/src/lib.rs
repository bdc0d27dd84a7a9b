//! SFU client core.
//!
//! Joins a room on a Selective Forwarding Unit, publishes the local
//! participant's media and subscribes to every other participant's media.
//!
//! # Architecture
//!
//! ```text
//! SessionOrchestrator
//!   └── Session (one live room)
//!         ├── TransportManager    send pipe + recv pipe, intent wiring
//!         ├── PublicationManager  local tracks, serial produce
//!         └── SubscriptionManager consumers, PeerStreams
//! ```
//!
//! The crate talks to the outside world through three seams:
//! [`signaling::SignalingPort`] (request/reply channel plus push events),
//! [`negotiator::CapabilityNegotiator`] (codec/transport library) and
//! [`media::MediaSource`] (local capture).
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_client::{Config, SessionOrchestrator};
//!
//! let orchestrator = SessionOrchestrator::new(Config::from_env()?, port, negotiators, media);
//! let summary = orchestrator.join("abc123".into()).await?;
//! let mut streams = orchestrator.watch_peer_streams();
//! // ...
//! orchestrator.close_session().await;
//! ```

#![warn(clippy::pedantic)]

pub mod config;
pub mod errors;
pub mod media;
pub mod negotiator;
pub mod observability;
pub mod orchestrator;
pub mod publication;
mod session;
pub mod signaling;
pub mod subscription;
pub mod transport;

pub use config::{Config, ConfigError};
pub use errors::{
    ClientError, MediaError, NegotiatorError, Severity, SignalingError, TransportError,
};
pub use orchestrator::{JoinSummary, SessionOrchestrator};
pub use session::SessionState;
pub use subscription::{
    ConsumeClaim, ConsumeOutcome, PeerStream, PeerStreams, SubscriptionPolicy,
};
