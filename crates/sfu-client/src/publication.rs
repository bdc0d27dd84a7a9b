//! Local media publication.
//!
//! Tracks are produced one at a time on the send pipe, so at most one
//! produce intent is ever outstanding. A track whose produce fails is
//! logged and skipped; the rest of the batch still goes out.

use crate::errors::{ClientError, MediaError};
use crate::media::{LocalTrack, MediaConstraints, MediaSource};
use crate::negotiator::{CapabilityNegotiator, Producer, SendPipe};
use crate::observability::metrics;
use common::types::{MediaKind, ProducerId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A track that could not be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFailure {
    pub track_id: String,
    pub kind: MediaKind,
    pub reason: String,
}

impl From<PublishFailure> for ClientError {
    fn from(failure: PublishFailure) -> Self {
        ClientError::Produce {
            track_id: failure.track_id,
            kind: failure.kind,
            reason: failure.reason,
        }
    }
}

/// Result of publishing a batch of local tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Server-issued ids of the tracks that were published, in order.
    pub produced: Vec<ProducerId>,
    /// Tracks that failed or were skipped.
    pub failed: Vec<PublishFailure>,
}

/// Owns the session's local tracks and producers.
pub struct PublicationManager {
    liveness: CancellationToken,
    tracks: Mutex<Vec<Arc<dyn LocalTrack>>>,
    producers: Mutex<Vec<Box<dyn Producer>>>,
}

impl PublicationManager {
    #[must_use]
    pub fn new(liveness: CancellationToken) -> Self {
        Self {
            liveness,
            tracks: Mutex::new(Vec::new()),
            producers: Mutex::new(Vec::new()),
        }
    }

    /// Acquire local tracks. The session owns them from here on.
    ///
    /// Tracks acquired after teardown began are stopped immediately.
    ///
    /// # Errors
    ///
    /// Returns `MediaAcquisition` if capture fails or yields no track, and
    /// `SessionClosed` if teardown began meanwhile.
    #[instrument(skip_all, name = "sfu.publication.acquire", fields(audio = constraints.audio, video = constraints.video))]
    pub async fn acquire(
        &self,
        source: &dyn MediaSource,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, ClientError> {
        let tracks = source.acquire(constraints).await.map_err(|e| {
            warn!(target: "sfu.publication", error = %e, "Local media acquisition failed");
            ClientError::MediaAcquisition(e)
        })?;

        // Liveness is checked under the lock `stop_all` drains, so teardown
        // either sees these tracks or this call sees the cancellation.
        {
            let mut owned = self.tracks.lock();
            if self.liveness.is_cancelled() {
                drop(owned);
                for track in &tracks {
                    track.stop();
                }
                debug!(target: "sfu.publication", "Stopped tracks acquired after teardown");
                return Err(ClientError::SessionClosed);
            }

            if tracks.is_empty() {
                return Err(MediaError::DeviceNotFound("no tracks returned".to_string()).into());
            }

            owned.extend(tracks.iter().cloned());
        }
        info!(target: "sfu.publication", tracks = tracks.len(), "Local media acquired");
        Ok(tracks)
    }

    /// Produce each track on the send pipe, one at a time.
    ///
    /// # Errors
    ///
    /// Only a closed session aborts the batch, with `SessionClosed`.
    #[instrument(skip_all, name = "sfu.publication.publish", fields(tracks = tracks.len()))]
    pub async fn publish(
        &self,
        pipe: &dyn SendPipe,
        negotiator: &dyn CapabilityNegotiator,
        tracks: &[Arc<dyn LocalTrack>],
    ) -> Result<PublishReport, ClientError> {
        let mut report = PublishReport::default();

        for track in tracks {
            if self.liveness.is_cancelled() {
                return Err(ClientError::SessionClosed);
            }

            let kind = track.kind();
            if !negotiator.can_produce(kind) {
                warn!(
                    target: "sfu.publication",
                    track_id = track.id(),
                    kind = %kind,
                    "Router cannot receive this kind, skipping track"
                );
                metrics::record_produce("skipped", kind.as_str());
                report.failed.push(PublishFailure {
                    track_id: track.id().to_string(),
                    kind,
                    reason: "unsupported by router".to_string(),
                });
                continue;
            }

            match pipe.produce(Arc::clone(track)).await {
                Ok(producer) => {
                    let id = producer.id().clone();
                    {
                        let mut owned = self.producers.lock();
                        if self.liveness.is_cancelled() {
                            drop(owned);
                            producer.close();
                            return Err(ClientError::SessionClosed);
                        }
                        owned.push(producer);
                    }
                    info!(
                        target: "sfu.publication",
                        track_id = track.id(),
                        producer_id = %id,
                        kind = %kind,
                        "Track published"
                    );
                    metrics::record_produce("success", kind.as_str());
                    report.produced.push(id);
                }
                Err(e) => {
                    if self.liveness.is_cancelled() {
                        return Err(ClientError::SessionClosed);
                    }
                    warn!(
                        target: "sfu.publication",
                        track_id = track.id(),
                        kind = %kind,
                        error = %e,
                        "Produce failed, skipping track"
                    );
                    metrics::record_produce("failed", kind.as_str());
                    report.failed.push(PublishFailure {
                        track_id: track.id().to_string(),
                        kind,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Tracks owned by the session that are still capturing.
    #[must_use]
    pub fn live_tracks(&self) -> usize {
        self.tracks.lock().iter().filter(|t| t.is_live()).count()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.lock().len()
    }

    /// Close every producer, then stop every local track. Idempotent.
    pub fn stop_all(&self) {
        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in &producers {
            producer.close();
        }

        let tracks = std::mem::take(&mut *self.tracks.lock());
        for track in &tracks {
            track.stop();
        }

        if !producers.is_empty() || !tracks.is_empty() {
            debug!(
                target: "sfu.publication",
                producers = producers.len(),
                tracks = tracks.len(),
                "Local media stopped"
            );
        }
    }
}
