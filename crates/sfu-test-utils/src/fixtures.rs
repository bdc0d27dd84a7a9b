//! Test fixtures for SFU client tests.

use crate::{MockMediaSource, MockNegotiatorFactory, MockSignaling, NegotiatorLog};
use common::types::MediaKind;
use serde_json::{json, Value};
use sfu_client::signaling::RemoteProducer;
use sfu_client::{Config, SessionOrchestrator};
use std::sync::Arc;

/// Router capabilities the mock server advertises.
#[must_use]
pub fn router_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ],
        "headerExtensions": []
    })
}

#[must_use]
pub fn remote_producer(producer_id: &str, kind: MediaKind, peer_id: &str) -> RemoteProducer {
    RemoteProducer::new(producer_id, kind, peer_id)
}

/// An orchestrator wired to mocks, with handles to inspect them.
pub struct TestClient {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub signaling: Arc<MockSignaling>,
    pub negotiators: Arc<MockNegotiatorFactory>,
    pub media: Arc<MockMediaSource>,
}

impl TestClient {
    /// Default config, default mocks except for `signaling`.
    #[must_use]
    pub fn new(signaling: MockSignaling) -> Self {
        Self::with_parts(
            Config::default(),
            signaling,
            MockNegotiatorFactory::default(),
            MockMediaSource::new(),
        )
    }

    #[must_use]
    pub fn with_parts(
        config: Config,
        signaling: MockSignaling,
        negotiators: MockNegotiatorFactory,
        media: MockMediaSource,
    ) -> Self {
        let signaling = Arc::new(signaling);
        let negotiators = Arc::new(negotiators);
        let media = Arc::new(media);
        let orchestrator = Arc::new(SessionOrchestrator::new(
            config,
            signaling.clone(),
            negotiators.clone(),
            media.clone(),
        ));
        Self {
            orchestrator,
            signaling,
            negotiators,
            media,
        }
    }

    #[must_use]
    pub fn log(&self) -> Arc<NegotiatorLog> {
        self.negotiators.log()
    }

    /// Assert nothing session-scoped survived: no open pipe, no live track,
    /// no push-event handler, no peer stream.
    pub fn assert_released(&self) {
        assert_eq!(self.log().open_pipes(), 0, "pipes left open");
        assert_eq!(self.media.live_track_count(), 0, "tracks left running");
        assert_eq!(self.signaling.handler_count(), 0, "handlers left registered");
        assert!(
            self.orchestrator.peer_streams().is_empty(),
            "peer streams left behind"
        );
    }
}
