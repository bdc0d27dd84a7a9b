//! Mock local capture.
//!
//! Hands out [`MockLocalTrack`]s matching the requested constraints, or fails
//! the way a denied permission prompt would.

use async_trait::async_trait;
use common::types::MediaKind;
use parking_lot::Mutex;
use sfu_client::errors::MediaError;
use sfu_client::media::{LocalTrack, MediaConstraints, MediaSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A captured track that only records whether it was stopped.
#[derive(Debug)]
pub struct MockLocalTrack {
    id: String,
    kind: MediaKind,
    live: AtomicBool,
}

impl MockLocalTrack {
    #[must_use]
    pub fn new(id: &str, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            live: AtomicBool::new(true),
        })
    }
}

impl LocalTrack for MockLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Mock media source.
#[derive(Default)]
pub struct MockMediaSource {
    tracks: Option<Vec<(String, MediaKind)>>,
    failure: Option<MediaError>,
    acquired: Mutex<Vec<Arc<MockLocalTrack>>>,
}

impl MockMediaSource {
    /// A source that captures one track per requested kind.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that returns exactly these tracks, whatever the constraints.
    #[must_use]
    pub fn with_tracks(tracks: &[(&str, MediaKind)]) -> Self {
        Self {
            tracks: Some(
                tracks
                    .iter()
                    .map(|(id, kind)| ((*id).to_string(), *kind))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    /// A source whose acquisition always fails.
    #[must_use]
    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// Every track handed out so far.
    #[must_use]
    pub fn acquired(&self) -> Vec<Arc<MockLocalTrack>> {
        self.acquired.lock().clone()
    }

    /// Tracks handed out and not yet stopped.
    #[must_use]
    pub fn live_track_count(&self) -> usize {
        self.acquired.lock().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let mut acquired = self.acquired.lock();
        let n = acquired.len();
        let tracks: Vec<Arc<MockLocalTrack>> = match &self.tracks {
            Some(tracks) => tracks
                .iter()
                .map(|(id, kind)| MockLocalTrack::new(id, *kind))
                .collect(),
            None => {
                let mut tracks = Vec::new();
                if constraints.audio {
                    tracks.push(MockLocalTrack::new(&format!("mic-{n}"), MediaKind::Audio));
                }
                if constraints.video {
                    tracks.push(MockLocalTrack::new(&format!("cam-{n}"), MediaKind::Video));
                }
                tracks
            }
        };
        acquired.extend(tracks.iter().cloned());

        Ok(tracks
            .into_iter()
            .map(|t| t as Arc<dyn LocalTrack>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_follows_constraints() {
        let source = MockMediaSource::new();

        let tracks = source
            .acquire(MediaConstraints {
                audio: false,
                video: true,
            })
            .await
            .unwrap();

        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind(), MediaKind::Video);
        assert_eq!(source.live_track_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_observed() {
        let source = MockMediaSource::with_tracks(&[("mic", MediaKind::Audio)]);
        let tracks = source.acquire(MediaConstraints::default()).await.unwrap();

        tracks[0].stop();
        assert_eq!(source.live_track_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_source() {
        let source = MockMediaSource::failing(MediaError::PermissionDenied("camera".into()));
        assert!(source.acquire(MediaConstraints::default()).await.is_err());
        assert!(source.acquired().is_empty());
    }
}
