//! Local and remote media tracks.
//!
//! Capture itself lives outside this crate. [`MediaSource`] is the seam the
//! publication path uses to acquire [`LocalTrack`]s; [`RemoteTrack`] is the
//! value the subscription path hands to the rendering layer.

use crate::errors::MediaError;
use async_trait::async_trait;
use common::types::{ConsumerId, MediaKind, ProducerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which local tracks to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Number of tracks these constraints ask for.
    #[must_use]
    pub fn requested_tracks(&self) -> usize {
        usize::from(self.audio) + usize::from(self.video)
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// A captured local track.
///
/// Owned by the session from acquisition until teardown, when it must be
/// stopped.
pub trait LocalTrack: Send + Sync + fmt::Debug {
    /// Track identifier assigned by the capture layer.
    fn id(&self) -> &str;

    /// Audio or video.
    fn kind(&self) -> MediaKind;

    /// Stop capture. Idempotent.
    fn stop(&self);

    /// True until `stop` is called or the device goes away.
    fn is_live(&self) -> bool;
}

/// Acquires local media.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Capture tracks matching `constraints`.
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError>;
}

/// A subscribed remote track, as seen by the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier assigned by the capability library.
    pub id: String,
    pub kind: MediaKind,
    /// Producer this track was consumed from.
    pub producer_id: ProducerId,
    /// Consumer carrying this track.
    pub consumer_id: ConsumerId,
}
