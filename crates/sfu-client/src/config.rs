//! SFU client configuration.
//!
//! Configuration is loaded from environment variables with defaults that
//! match a plain camera-and-microphone participant.

use crate::media::MediaConstraints;
use crate::subscription::SubscriptionPolicy;
use common::config::{ObservabilityConfig, DEFAULT_LOG_LEVEL};
use common::types::MediaKind;
use std::collections::{BTreeSet, HashMap};
use std::env;
use thiserror::Error;

/// Default: request a local audio track.
pub const DEFAULT_CAPTURE_AUDIO: bool = true;

/// Default: request a local video track.
pub const DEFAULT_CAPTURE_VIDEO: bool = true;

/// Default: resume each consumer after creation (RTP starts paused).
pub const DEFAULT_RESUME_CONSUMERS: bool = true;

/// Default: the signaling channel outlives the session.
pub const DEFAULT_DISCONNECT_ON_LEAVE: bool = false;

/// Default kinds to subscribe to.
pub const DEFAULT_CONSUME_KINDS: &str = "audio,video";

/// SFU client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Request a local audio track when publishing.
    pub capture_audio: bool,

    /// Request a local video track when publishing.
    pub capture_video: bool,

    /// Call `resume` on each consumer after creation.
    ///
    /// Some SFU deployments create consumers paused and only start RTP
    /// after an explicit resume; others start flowing immediately.
    pub resume_consumers: bool,

    /// Remote track kinds to subscribe to. Announcements of other kinds are
    /// ignored.
    pub consume_kinds: BTreeSet<MediaKind>,

    /// The signaling channel is session-scoped: disconnect it on teardown.
    pub disconnect_on_leave: bool,

    /// Logging configuration.
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_audio: DEFAULT_CAPTURE_AUDIO,
            capture_video: DEFAULT_CAPTURE_VIDEO,
            resume_consumers: DEFAULT_RESUME_CONSUMERS,
            consume_kinds: BTreeSet::from([MediaKind::Audio, MediaKind::Video]),
            disconnect_on_leave: DEFAULT_DISCONNECT_ON_LEAVE,
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("At least one of SFU_CAPTURE_AUDIO or SFU_CAPTURE_VIDEO must be enabled")]
    NothingToCapture,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a boolean or media kind does
    /// not parse, and `ConfigError::NothingToCapture` if both audio and
    /// video capture are disabled.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let capture_audio = parse_bool(vars, "SFU_CAPTURE_AUDIO", DEFAULT_CAPTURE_AUDIO)?;
        let capture_video = parse_bool(vars, "SFU_CAPTURE_VIDEO", DEFAULT_CAPTURE_VIDEO)?;
        if !capture_audio && !capture_video {
            return Err(ConfigError::NothingToCapture);
        }

        let resume_consumers =
            parse_bool(vars, "SFU_RESUME_CONSUMERS", DEFAULT_RESUME_CONSUMERS)?;

        let disconnect_on_leave =
            parse_bool(vars, "SFU_DISCONNECT_ON_LEAVE", DEFAULT_DISCONNECT_ON_LEAVE)?;

        let consume_kinds = parse_kinds(
            vars.get("SFU_CONSUME_KINDS")
                .map_or(DEFAULT_CONSUME_KINDS, String::as_str),
        )?;

        let log_level = vars
            .get("SFU_LOG_LEVEL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let json_logs = parse_bool(vars, "SFU_JSON_LOGS", false)?;

        Ok(Config {
            capture_audio,
            capture_video,
            resume_consumers,
            consume_kinds,
            disconnect_on_leave,
            observability: ObservabilityConfig {
                log_level,
                json_logs,
            },
        })
    }

    /// Local capture constraints derived from this configuration.
    #[must_use]
    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.capture_audio,
            video: self.capture_video,
        }
    }

    /// Subscription policy derived from this configuration.
    #[must_use]
    pub fn subscription_policy(&self) -> SubscriptionPolicy {
        SubscriptionPolicy {
            resume_consumers: self.resume_consumers,
            consume_kinds: self.consume_kinds.clone(),
        }
    }
}

fn parse_bool(
    vars: &HashMap<String, String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = vars.get(name) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw.clone(),
        }),
    }
}

fn parse_kinds(raw: &str) -> Result<BTreeSet<MediaKind>, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        name: "SFU_CONSUME_KINDS".to_string(),
        value: raw.to_string(),
    };

    let kinds = raw
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.parse::<MediaKind>().map_err(|_| invalid()))
        .collect::<Result<BTreeSet<_>, _>>()?;

    if kinds.is_empty() {
        return Err(invalid());
    }
    Ok(kinds)
}
