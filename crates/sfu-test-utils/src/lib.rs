//! # SFU Client Test Utilities
//!
//! Mock implementations of the client's three seams and fixtures for
//! exercising the orchestrator without a server, a codec library or a
//! camera.
//!
//! ## Modules
//!
//! - `mock_signaling` - scripted signaling channel with push-event injection
//! - `mock_negotiator` - capability library whose pipes raise real intents
//! - `mock_media` - local capture that records stopped tracks
//! - `fixtures` - capabilities, descriptors and a wired [`TestClient`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let client = TestClient::new(
//!         MockSignaling::builder()
//!             .with_existing_producer("p1", MediaKind::Video, "peerA")
//!             .build(),
//!     );
//!
//!     client.orchestrator.join("abc123".into()).await.unwrap();
//!     client.orchestrator.close_session().await;
//!     client.assert_released();
//! }
//! ```

pub mod fixtures;
pub mod mock_media;
pub mod mock_negotiator;
pub mod mock_signaling;

pub use fixtures::{remote_producer, router_capabilities, TestClient};
pub use mock_media::{MockLocalTrack, MockMediaSource};
pub use mock_negotiator::{
    MockNegotiator, MockNegotiatorFactory, MockNegotiatorFactoryBuilder, NegotiatorLog,
    PipeRecord,
};
pub use mock_signaling::{MockSignaling, MockSignalingBuilder};
