//! Observability for the SFU client.
//!
//! Logging goes through `tracing` with one target per component:
//!
//! | Target | Component |
//! |--------|-----------|
//! | `sfu.session` | join flow, state transitions, teardown |
//! | `sfu.transport` | pipe creation and intent handling |
//! | `sfu.publication` | local media and producers |
//! | `sfu.subscription` | consumers and peer streams |
//! | `sfu.signaling` | request/reply channel and push events |
//!
//! Metrics go through the `metrics` facade; the embedding application
//! chooses the recorder. Labels are bounded (see [`metrics`]).
//!
//! Room ids, peer ids and track ids are logged as span fields only, never
//! used as metric labels.

pub mod metrics;

pub use self::metrics::{
    record_consume, record_join, record_produce, record_push_event, record_teardown,
    set_peer_streams_active,
};

use common::config::ObservabilityConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Install a global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise `config.log_level` applies to every
/// target.
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    }
}
