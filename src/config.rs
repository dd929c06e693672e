use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::{
    estimator::{DEFAULT_WINDOW_SIZE, ThroughputEstimator},
    playback::PlaybackConfig,
    simulator::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_PACING_WAIT, DeliveryConfig, RateLimit},
};

pub const ENV_PREFIX: &str = "MPCSTREAM";

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub delivery: DeliverySettings,
    pub estimator: EstimatorSettings,
    pub playback: PlaybackSettings,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeliverySettings {
    pub block_size: usize,
    /// Unpaced when absent.
    pub rate_limit_kbps: Option<f64>,
    pub max_pacing_wait_ms: u64,
    pub timeout_ms: Option<u64>,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            rate_limit_kbps: None,
            max_pacing_wait_ms: DEFAULT_MAX_PACING_WAIT.as_millis() as u64,
            timeout_ms: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EstimatorSettings {
    pub window_size: usize,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackSettings {
    pub segments: Option<usize>,
    /// Falls back to the catalog's media info when absent.
    pub segment_duration_secs: Option<f64>,
    pub min_buffer_secs: Option<f64>,
    pub max_buffer_secs: f64,
    pub initial_buffer_secs: f64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        let defaults = PlaybackConfig::default();
        Self {
            segments: defaults.segments,
            segment_duration_secs: defaults.segment_duration.map(|d| d.as_secs_f64()),
            min_buffer_secs: defaults.min_buffer.map(|d| d.as_secs_f64()),
            max_buffer_secs: defaults.max_buffer.as_secs_f64(),
            initial_buffer_secs: defaults.initial_buffer.as_secs_f64(),
        }
    }
}

impl Settings {
    /// Layers an optional TOML file under `MPCSTREAM_*` environment overrides,
    /// e.g. `MPCSTREAM_DELIVERY__RATE_LIMIT_KBPS=800`.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        Self::build(builder)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml));
        Self::build(builder)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, SettingsError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |key, reason: &str| {
            Err(SettingsError::Invalid {
                key,
                reason: reason.to_string(),
            })
        };

        if self.delivery.block_size == 0 {
            return invalid("delivery.block_size", "must be at least 1");
        }
        if let Some(kbps) = self.delivery.rate_limit_kbps {
            if !(kbps.is_finite() && kbps > 0.0) {
                return invalid("delivery.rate_limit_kbps", "must be a positive number");
            }
        }
        if self.estimator.window_size == 0 {
            return invalid("estimator.window_size", "must be at least 1");
        }
        let playback = &self.playback;
        for (key, secs) in [
            ("playback.segment_duration_secs", playback.segment_duration_secs),
            ("playback.max_buffer_secs", Some(playback.max_buffer_secs)),
        ] {
            if secs.is_some_and(|secs| !(secs > 0.0 && as_duration(secs).is_some())) {
                return invalid(key, "must be a positive number of seconds");
            }
        }
        for (key, secs) in [
            ("playback.min_buffer_secs", playback.min_buffer_secs),
            ("playback.initial_buffer_secs", Some(playback.initial_buffer_secs)),
        ] {
            if secs.is_some_and(|secs| as_duration(secs).is_none()) {
                return invalid(key, "must be a non-negative number of seconds");
            }
        }
        Ok(())
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        let max_wait = Duration::from_millis(self.delivery.max_pacing_wait_ms);
        DeliveryConfig {
            block_size: self.delivery.block_size,
            rate_limit: self
                .delivery
                .rate_limit_kbps
                .and_then(|kbps| RateLimit::new(kbps, max_wait)),
            timeout: self.delivery.timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn estimator(&self) -> ThroughputEstimator {
        ThroughputEstimator::new(self.estimator.window_size)
    }

    /// Only meaningful on validated settings; out-of-range values saturate.
    pub fn playback_config(&self) -> PlaybackConfig {
        let saturating = |secs| as_duration(secs).unwrap_or(Duration::MAX);
        PlaybackConfig {
            segments: self.playback.segments,
            segment_duration: self.playback.segment_duration_secs.map(saturating),
            min_buffer: self.playback.min_buffer_secs.map(saturating),
            max_buffer: saturating(self.playback.max_buffer_secs),
            initial_buffer: saturating(self.playback.initial_buffer_secs),
        }
    }
}

/// `None` for negative, non-finite or out-of-range seconds.
fn as_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}
