//! Remote track subscription and peer stream aggregation.
//!
//! Every remote producer, whether it came from the join snapshot or a
//! `newProducer` push event, is claimed with [`SubscriptionManager::claim`]
//! and then consumed. The event pump claims synchronously, in event order,
//! so a `producerClosed` that follows a `newProducer` always finds the
//! producer claimed or subscribed.
//!
//! # Duplicate guard
//!
//! A producer id is claimed at request-issue time, before the `consume`
//! request goes out. A second announcement for the same producer, while the
//! first is in flight or after it completed, is a [`ConsumeOutcome::Duplicate`].
//!
//! # Liveness
//!
//! Completions re-check the session's liveness token under the registry lock
//! before touching the peer streams; a completion that loses the race with
//! teardown closes its consumer and reports [`ConsumeOutcome::Discarded`].

use crate::errors::ClientError;
use crate::media::RemoteTrack;
use crate::negotiator::{Consumer, RecvPipe, RtpCapabilities};
use crate::observability::metrics;
use crate::signaling::{RemoteProducer, SignalingClient};
use common::types::{ConsumerId, MediaKind, PeerId, ProducerId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Which remote producers to consume and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionPolicy {
    /// Resume each consumer after creation.
    pub resume_consumers: bool,
    /// Kinds to subscribe to; others are ignored.
    pub consume_kinds: BTreeSet<MediaKind>,
}

impl SubscriptionPolicy {
    #[must_use]
    pub fn accepts(&self, kind: MediaKind) -> bool {
        self.consume_kinds.contains(&kind)
    }
}

impl Default for SubscriptionPolicy {
    fn default() -> Self {
        Self {
            resume_consumers: true,
            consume_kinds: BTreeSet::from([MediaKind::Audio, MediaKind::Video]),
        }
    }
}

/// Every subscribed track of one remote peer, as one composite stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStream {
    pub peer_id: PeerId,
    pub tracks: Vec<RemoteTrack>,
}

impl PeerStream {
    #[must_use]
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            tracks: Vec::new(),
        }
    }

    /// Add a track. Returns false if a track from the same producer is
    /// already present.
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self
            .tracks
            .iter()
            .any(|t| t.producer_id == track.producer_id)
        {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Remove the track consumed from `producer_id`.
    pub fn remove_producer(&mut self, producer_id: &ProducerId) -> Option<RemoteTrack> {
        let index = self
            .tracks
            .iter()
            .position(|t| &t.producer_id == producer_id)?;
        Some(self.tracks.remove(index))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Number of tracks of `kind` in this stream.
    #[must_use]
    pub fn count_kind(&self, kind: MediaKind) -> usize {
        self.tracks.iter().filter(|t| t.kind == kind).count()
    }
}

/// Peer streams keyed by origin peer. One entry per peer.
pub type PeerStreams = BTreeMap<PeerId, PeerStream>;

/// What happened to one remote producer announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// A consumer was created and its track merged into the peer's stream.
    Subscribed(ConsumerId),
    /// The producer was already consumed or is being consumed.
    Duplicate,
    /// The producer's kind is not subscribed to.
    Filtered,
    /// The session closed, or the producer went away, before completion.
    Discarded,
}

impl ConsumeOutcome {
    /// Bounded label for metrics.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            ConsumeOutcome::Subscribed(_) => "subscribed",
            ConsumeOutcome::Duplicate => "duplicate",
            ConsumeOutcome::Filtered => "filtered",
            ConsumeOutcome::Discarded => "discarded",
        }
    }
}

struct ConsumerEntry {
    consumer: Box<dyn Consumer>,
    peer_id: PeerId,
}

#[derive(Default)]
struct Registry {
    /// Producers with a consume request in flight.
    pending: HashSet<ProducerId>,
    consumers: HashMap<ProducerId, ConsumerEntry>,
    /// Producers the server closed while their consume was in flight.
    retired: HashSet<ProducerId>,
    streams: PeerStreams,
}

/// A remote producer reserved for consumption.
///
/// Obtained from [`SubscriptionManager::claim`]. Dropping it, on any path,
/// releases the reservation.
pub struct ConsumeClaim {
    registry: Arc<Mutex<Registry>>,
    descriptor: RemoteProducer,
}

impl ConsumeClaim {
    #[must_use]
    pub fn descriptor(&self) -> &RemoteProducer {
        &self.descriptor
    }
}

impl Drop for ConsumeClaim {
    fn drop(&mut self) {
        self.registry
            .lock()
            .pending
            .remove(&self.descriptor.producer_id);
    }
}

/// Consumes remote producers on the recv pipe and maintains peer streams.
pub struct SubscriptionManager {
    signaling: SignalingClient,
    pipe: Arc<dyn RecvPipe>,
    rtp_capabilities: RtpCapabilities,
    policy: SubscriptionPolicy,
    liveness: CancellationToken,
    registry: Arc<Mutex<Registry>>,
    streams_tx: Arc<watch::Sender<PeerStreams>>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(
        signaling: SignalingClient,
        pipe: Arc<dyn RecvPipe>,
        rtp_capabilities: RtpCapabilities,
        policy: SubscriptionPolicy,
        liveness: CancellationToken,
        streams_tx: Arc<watch::Sender<PeerStreams>>,
    ) -> Self {
        Self {
            signaling,
            pipe,
            rtp_capabilities,
            policy,
            liveness,
            registry: Arc::new(Mutex::new(Registry::default())),
            streams_tx,
        }
    }

    /// Subscribe to one remote producer.
    ///
    /// Equivalent to [`Self::claim`] followed by [`Self::consume_claimed`].
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Consume` if the request, the consumer creation
    /// or the resume fails. Callers treat it as recoverable.
    pub async fn consume(
        &self,
        descriptor: &RemoteProducer,
    ) -> Result<ConsumeOutcome, ClientError> {
        match self.claim(descriptor) {
            Ok(claim) => self.consume_claimed(claim).await,
            Err(outcome) => Ok(outcome),
        }
    }

    /// Reserve `descriptor`'s producer without awaiting anything.
    ///
    /// From here on a `producerClosed` for the producer finds it pending.
    ///
    /// # Errors
    ///
    /// Returns the final [`ConsumeOutcome`] instead of a claim when the
    /// producer is filtered, a duplicate or already closed, or the session
    /// is gone.
    pub fn claim(&self, descriptor: &RemoteProducer) -> Result<ConsumeClaim, ConsumeOutcome> {
        let producer_id = &descriptor.producer_id;
        let outcome = if self.liveness.is_cancelled() {
            ConsumeOutcome::Discarded
        } else if !self.policy.accepts(descriptor.kind) {
            debug!(target: "sfu.subscription", producer_id = %producer_id, kind = %descriptor.kind, "Kind not subscribed, ignoring producer");
            ConsumeOutcome::Filtered
        } else {
            let mut registry = self.registry.lock();
            if registry.pending.contains(producer_id) || registry.consumers.contains_key(producer_id)
            {
                debug!(target: "sfu.subscription", producer_id = %producer_id, "Producer already consumed, ignoring");
                ConsumeOutcome::Duplicate
            } else if registry.retired.contains(producer_id) {
                debug!(target: "sfu.subscription", producer_id = %producer_id, "Producer already closed, ignoring");
                ConsumeOutcome::Discarded
            } else {
                registry.pending.insert(producer_id.clone());
                return Ok(ConsumeClaim {
                    registry: Arc::clone(&self.registry),
                    descriptor: descriptor.clone(),
                });
            }
        };

        metrics::record_consume(outcome.metric_label());
        Err(outcome)
    }

    /// Finish consuming a claimed producer.
    ///
    /// # Errors
    ///
    /// Same as [`Self::consume`].
    #[instrument(
        skip_all,
        name = "sfu.subscription.consume",
        fields(
            producer_id = %claim.descriptor.producer_id,
            peer_id = %claim.descriptor.peer_id,
            kind = %claim.descriptor.kind
        )
    )]
    pub async fn consume_claimed(&self, claim: ConsumeClaim) -> Result<ConsumeOutcome, ClientError> {
        let result = self.complete(&claim).await;
        match &result {
            Ok(outcome) => metrics::record_consume(outcome.metric_label()),
            Err(_) => metrics::record_consume("failed"),
        }
        result
    }

    /// [`Self::consume`], with failures logged and dropped.
    pub async fn consume_or_log(&self, descriptor: &RemoteProducer) -> Option<ConsumeOutcome> {
        match self.claim(descriptor) {
            Ok(claim) => self.consume_claimed_or_log(claim).await,
            Err(outcome) => Some(outcome),
        }
    }

    /// [`Self::consume_claimed`], with failures logged and dropped.
    pub async fn consume_claimed_or_log(&self, claim: ConsumeClaim) -> Option<ConsumeOutcome> {
        let producer_id = claim.descriptor.producer_id.clone();
        let peer_id = claim.descriptor.peer_id.clone();
        match self.consume_claimed(claim).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(
                    target: "sfu.subscription",
                    producer_id = %producer_id,
                    peer_id = %peer_id,
                    error = %e,
                    "Consume failed, skipping producer"
                );
                None
            }
        }
    }

    async fn complete(&self, claim: &ConsumeClaim) -> Result<ConsumeOutcome, ClientError> {
        let descriptor = &claim.descriptor;
        let producer_id = &descriptor.producer_id;

        let options = match self
            .signaling
            .consume(producer_id, self.rtp_capabilities.clone())
            .await
        {
            Ok(options) => options,
            Err(_) if self.liveness.is_cancelled() => return Ok(ConsumeOutcome::Discarded),
            Err(e) => return Err(consume_error(producer_id, e)),
        };
        if self.liveness.is_cancelled() {
            return Ok(ConsumeOutcome::Discarded);
        }
        if &options.producer_id != producer_id {
            return Err(consume_error(
                producer_id,
                format!("reply is for producer {}", options.producer_id),
            ));
        }

        let consumer = match self.pipe.consume(options).await {
            Ok(consumer) => consumer,
            Err(_) if self.liveness.is_cancelled() => return Ok(ConsumeOutcome::Discarded),
            Err(e) => return Err(consume_error(producer_id, e)),
        };

        if self.policy.resume_consumers && !self.liveness.is_cancelled() {
            if let Err(e) = consumer.resume().await {
                consumer.close();
                if self.liveness.is_cancelled() {
                    return Ok(ConsumeOutcome::Discarded);
                }
                return Err(consume_error(producer_id, e));
            }
        }

        let consumer_id = consumer.id().clone();
        let track = consumer.track();

        let mut registry = self.registry.lock();
        if self.liveness.is_cancelled() || registry.retired.contains(producer_id) {
            drop(registry);
            consumer.close();
            debug!(target: "sfu.subscription", "Discarding consumer completed after close");
            return Ok(ConsumeOutcome::Discarded);
        }

        let stream = registry
            .streams
            .entry(descriptor.peer_id.clone())
            .or_insert_with(|| PeerStream::new(descriptor.peer_id.clone()));
        stream.add_track(track);
        let tracks = stream.tracks.len();

        registry.consumers.insert(
            producer_id.clone(),
            ConsumerEntry {
                consumer,
                peer_id: descriptor.peer_id.clone(),
            },
        );
        self.publish(&registry.streams);
        drop(registry);

        info!(
            target: "sfu.subscription",
            consumer_id = %consumer_id,
            peer_tracks = tracks,
            "Remote track subscribed"
        );
        Ok(ConsumeOutcome::Subscribed(consumer_id))
    }

    /// Drop the consumer of a producer the server closed.
    ///
    /// The peer's stream loses that track and disappears once empty. A
    /// claimed consume for the producer that has not completed yet is
    /// discarded, and the producer is not consumed again this session.
    /// Returns true if a subscribed track was removed.
    pub fn remove_producer(&self, producer_id: &ProducerId) -> bool {
        if self.liveness.is_cancelled() {
            return false;
        }

        let mut registry = self.registry.lock();
        let Some(entry) = registry.consumers.remove(producer_id) else {
            if registry.pending.contains(producer_id) {
                // The consume in flight must not resurrect it.
                registry.retired.insert(producer_id.clone());
                debug!(target: "sfu.subscription", producer_id = %producer_id, "Producer closed while being consumed");
            } else {
                debug!(target: "sfu.subscription", producer_id = %producer_id, "Closed producer was never consumed");
            }
            return false;
        };
        entry.consumer.close();

        let now_empty = registry
            .streams
            .get_mut(&entry.peer_id)
            .is_some_and(|stream| {
                stream.remove_producer(producer_id);
                stream.is_empty()
            });
        if now_empty {
            registry.streams.remove(&entry.peer_id);
        }
        self.publish(&registry.streams);

        info!(
            target: "sfu.subscription",
            producer_id = %producer_id,
            peer_id = %entry.peer_id,
            "Remote track removed"
        );
        true
    }

    /// Close every consumer and publish an empty peer-stream map. Idempotent.
    pub fn clear(&self) {
        let mut registry = self.registry.lock();
        let consumers = std::mem::take(&mut registry.consumers);
        for entry in consumers.values() {
            entry.consumer.close();
        }
        registry.pending.clear();
        registry.retired.clear();
        registry.streams.clear();
        self.publish(&registry.streams);

        if !consumers.is_empty() {
            debug!(target: "sfu.subscription", consumers = consumers.len(), "Consumers closed");
        }
    }

    /// Current peer streams.
    #[must_use]
    pub fn peer_streams(&self) -> PeerStreams {
        self.registry.lock().streams.clone()
    }

    // Called with the registry lock held so snapshots go out in mutation order.
    fn publish(&self, streams: &PeerStreams) {
        self.streams_tx.send_replace(streams.clone());
        metrics::set_peer_streams_active(streams.len());
    }
}

fn consume_error(producer_id: &ProducerId, reason: impl ToString) -> ClientError {
    ClientError::Consume {
        producer_id: producer_id.clone(),
        reason: reason.to_string(),
    }
}
