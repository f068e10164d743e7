//! Forwarding core configuration
//!
//! Values can come from a config file and `MEDIARELAY_*` environment
//! variables; anything not given falls back to the defaults below.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    pub receiver: ReceiverConfig,
    pub stream_tracker: StreamTrackerConfig,
    pub down_track: DownTrackConfig,
    pub quality: QualityConfig,
    pub logging: LoggingConfig,
}

impl SfuConfig {
    /// Load configuration with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // MEDIARELAY_RECEIVER__PLI_THROTTLE_MS etc.
        builder = builder.add_source(
            Environment::with_prefix("MEDIARELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

/// Publisher-side receiver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Minimum interval between PLIs sent upstream for the same layer
    pub pli_throttle_ms: u64,
    /// Subscriber count from which fan-out runs in parallel (0 = never)
    pub load_balance_threshold: usize,
    /// Track layer liveness with stream trackers
    pub use_stream_trackers: bool,
    /// Number of packets kept per layer for retransmission
    pub packet_buffer_size: usize,
    /// Window over which per-layer bitrates are measured
    pub bitrate_interval_ms: u64,
}

impl ReceiverConfig {
    #[must_use]
    pub const fn pli_throttle(&self) -> Duration {
        Duration::from_millis(self.pli_throttle_ms)
    }

    #[must_use]
    pub const fn bitrate_interval(&self) -> Duration {
        Duration::from_millis(self.bitrate_interval_ms)
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            pli_throttle_ms: 500,
            load_balance_threshold: 20,
            use_stream_trackers: true,
            packet_buffer_size: 500,
            bitrate_interval_ms: 1000,
        }
    }
}

/// Thresholds for one class of stream tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerThresholds {
    pub samples_required: u32,
    pub cycles_required: u32,
}

/// Layer liveness detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTrackerConfig {
    /// Spatial layer 0, must never be falsely declared dead
    pub base_layer: TrackerThresholds,
    /// Spatial layers above 0
    pub higher_layers: TrackerThresholds,
    pub cycle_duration_ms: u64,
}

impl StreamTrackerConfig {
    #[must_use]
    pub const fn thresholds_for(&self, layer: i32) -> TrackerThresholds {
        if layer == 0 {
            self.base_layer
        } else {
            self.higher_layers
        }
    }

    #[must_use]
    pub const fn cycle_duration(&self) -> Duration {
        Duration::from_millis(self.cycle_duration_ms)
    }
}

impl Default for StreamTrackerConfig {
    fn default() -> Self {
        Self {
            base_layer: TrackerThresholds {
                samples_required: 1,
                cycles_required: 4,
            },
            higher_layers: TrackerThresholds {
                samples_required: 5,
                cycles_required: 60,
            },
            cycle_duration_ms: 500,
        }
    }
}

/// Subscriber-side sender settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownTrackConfig {
    /// Forwarded packets remembered for NACK handling
    pub sequencer_size: usize,
    /// Padding bytes each generated packet counts for, excluding the header
    pub max_padding_size: usize,
}

impl Default for DownTrackConfig {
    fn default() -> Self {
        Self {
            sequencer_size: 500,
            max_padding_size: 255,
        }
    }
}

/// Connection quality scoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Score points deducted per percent of weighted loss
    pub packet_loss_weight: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            packet_loss_weight: 20.0,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SfuConfig::default();
        assert_eq!(config.receiver.pli_throttle(), Duration::from_millis(500));
        assert_eq!(config.receiver.load_balance_threshold, 20);
        assert_eq!(config.stream_tracker.thresholds_for(0).cycles_required, 4);
        assert_eq!(config.stream_tracker.thresholds_for(2).samples_required, 5);
        assert_eq!(config.down_track.max_padding_size, 255);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[receiver]\nload_balance_threshold = 0\n\n[stream_tracker]\ncycle_duration_ms = 250"
        )
        .unwrap();

        let config = SfuConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.receiver.load_balance_threshold, 0);
        // untouched fields keep their defaults
        assert_eq!(config.receiver.packet_buffer_size, 500);
        assert_eq!(
            config.stream_tracker.cycle_duration(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = SfuConfig::load(Some("/nonexistent/mediarelay.toml")).unwrap();
        assert_eq!(config.quality.packet_loss_weight, 20.0);
    }
}
