//! Configuration module
//!
//! Loads the recorder configuration from a TOML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Operating mode: "test" or "production" (selects the base data directory)
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Data directory root
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// Channels to capture, keyed by SSRC
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    pub multicast: MulticastConfig,

    #[serde(default)]
    pub time_snap: TimeSnapConfig,

    #[serde(default)]
    pub bcd: BcdConfig,

    #[serde(default)]
    pub voting: VotingConfig,

    /// Opaque station metadata passed through into archive/status records
    #[serde(default)]
    pub station: StationMeta,
}

/// One capture channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// RTP synchronization source of the upstream SDR stream
    pub ssrc: u32,

    /// Center frequency in Hz
    pub frequency_hz: f64,

    /// I/Q sample rate in samples per second
    pub sample_rate: u32,

    /// Human-readable description, also used as the channel directory name
    pub description: String,
}

impl ChannelConfig {
    /// Directory-safe channel key derived from the description
    pub fn channel_key(&self) -> String {
        self.description
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

/// Multicast group the SDR daemon publishes RTP to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastConfig {
    /// Multicast group address, e.g. "239.1.2.3"
    pub group: String,

    /// UDP port
    #[serde(default = "default_rtp_port")]
    pub port: u16,

    /// Local interface address to join on (default: any)
    pub interface: Option<String>,
}

/// Time-snap (tone anchoring) parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSnapConfig {
    /// Startup tone-search buffer length in seconds
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: u32,

    /// Minimum implied error before an anchor correction is applied (ms)
    #[serde(default = "default_correction_threshold_ms")]
    pub correction_threshold_ms: f64,

    /// Minimum interval between anchor corrections (seconds)
    #[serde(default = "default_min_interval_s")]
    pub min_interval_s: u64,
}

impl Default for TimeSnapConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: default_buffer_seconds(),
            correction_threshold_ms: default_correction_threshold_ms(),
            min_interval_s: default_min_interval_s(),
        }
    }
}

/// BCD correlator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BcdConfig {
    /// Correlation window length in seconds
    #[serde(default = "default_bcd_window_s")]
    pub window_s: u32,

    /// Window step in seconds (step < window enables overlapped windows)
    #[serde(default = "default_bcd_step_s")]
    pub step_s: u32,

    /// Peak-to-median quality below which a window is dropped
    #[serde(default = "default_bcd_quality_threshold")]
    pub quality_threshold: f64,
}

impl Default for BcdConfig {
    fn default() -> Self {
        Self {
            window_s: default_bcd_window_s(),
            step_s: default_bcd_step_s(),
            quality_threshold: default_bcd_quality_threshold(),
        }
    }
}

/// Voting combiner parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotingConfig {
    /// Normalized score difference below which the minute is BALANCED
    #[serde(default = "default_balance_threshold")]
    pub balance_threshold: f64,

    /// Normalized score at or above which confidence is "high"
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f64,

    /// Normalized score at or above which confidence is "medium"
    #[serde(default = "default_medium_confidence")]
    pub medium_confidence: f64,

    /// Minimum per-method margin (dB or dB-equivalent) for a vote to count
    #[serde(default = "default_min_margin_db")]
    pub min_margin_db: f64,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            balance_threshold: default_balance_threshold(),
            high_confidence: default_high_confidence(),
            medium_confidence: default_medium_confidence(),
            min_margin_db: default_min_margin_db(),
        }
    }
}

/// Opaque receiver/station metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationMeta {
    pub callsign: Option<String>,

    /// Maidenhead grid square of the receiver (used by the BCD ToA model)
    pub grid_square: Option<String>,

    pub receiver_name: Option<String>,
    pub psws_station_id: Option<String>,
    pub psws_instrument_id: Option<String>,
}

// Defaults
fn default_mode() -> String { "production".to_string() }
fn default_data_root() -> String { "./data".to_string() }
fn default_rtp_port() -> u16 { 5004 }
fn default_buffer_seconds() -> u32 { 120 }
fn default_correction_threshold_ms() -> f64 { 50.0 }
fn default_min_interval_s() -> u64 { 600 }
fn default_bcd_window_s() -> u32 { 60 }
fn default_bcd_step_s() -> u32 { 60 }
fn default_bcd_quality_threshold() -> f64 { 3.0 }
fn default_balance_threshold() -> f64 { 0.15 }
fn default_high_confidence() -> f64 { 0.7 }
fn default_medium_confidence() -> f64 { 0.4 }
fn default_min_margin_db() -> f64 { 3.0 }

impl RecorderConfig {
    /// Load configuration from the first file found in the search path
    pub fn load() -> Result<Self> {
        let config_paths = [
            "recorder.toml",
            "/etc/timestation-recorder/recorder.toml",
            "~/.config/timestation-recorder/recorder.toml",
        ];

        for path in config_paths {
            let expanded_path = shellexpand::tilde(path);
            if Path::new(expanded_path.as_ref()).exists() {
                return Self::load_from_file(expanded_path.as_ref());
            }
        }

        anyhow::bail!("no recorder.toml found in search path")
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path))?;

        let config: RecorderConfig = toml::from_str(&content)
            .with_context(|| format!("error parsing {}", path))?;

        config.validate()?;
        tracing::info!("configuration loaded from: {}", path);
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("error serializing configuration")?;

        fs::write(path, content)
            .with_context(|| format!("could not write {}", path))?;

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            anyhow::bail!("no channels configured");
        }
        for ch in &self.channels {
            if ch.sample_rate == 0 {
                anyhow::bail!("channel {}: sample_rate must be nonzero", ch.description);
            }
        }
        if self.mode != "test" && self.mode != "production" {
            anyhow::bail!("mode must be \"test\" or \"production\", got {:?}", self.mode);
        }
        Ok(())
    }

    /// Base data directory for the configured mode
    pub fn base_dir(&self) -> PathBuf {
        let root = shellexpand::tilde(&self.data_root).to_string();
        if self.mode == "test" {
            Path::new(&root).join("test")
        } else {
            PathBuf::from(root)
        }
    }

    /// Archive directory for a channel
    pub fn archive_dir(&self, channel: &ChannelConfig) -> PathBuf {
        self.base_dir().join("archives").join(channel.channel_key())
    }

    /// Decimated-products directory for a channel
    pub fn decimated_dir(&self, channel: &ChannelConfig) -> PathBuf {
        self.base_dir()
            .join("analytics")
            .join(channel.channel_key())
            .join("decimated")
    }

    /// Discrimination CSV directory for a channel
    pub fn discrimination_dir(&self, channel: &ChannelConfig) -> PathBuf {
        self.base_dir()
            .join("analytics")
            .join(channel.channel_key())
            .join("discrimination")
    }

    /// Analytics resume-state file for a channel
    pub fn analytics_state_path(&self, channel: &ChannelConfig) -> PathBuf {
        self.base_dir()
            .join("state")
            .join(format!("analytics-{}.json", channel.channel_key()))
    }

    /// Status file directory
    pub fn status_dir(&self) -> PathBuf {
        self.base_dir().join("status")
    }
}
