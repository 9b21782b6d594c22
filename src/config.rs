//! Configuration file handling with TOML support.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use singlebell::audio::{AudioBackend, BellBackend, CommandBackend, NullBackend, default_player_command};
use singlebell::coordinator::{CoordinatorConfig, MIN_CADENCE};
use singlebell::lease::{ACTIVE_TAB_LEASE_KEY, PLAYBACK_LEASE_KEY};
use singlebell::tone::ToneSpec;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Playback lease
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Active-process lease
    #[serde(default)]
    pub active_tab: ActiveTabConfig,

    /// Burst repetition
    #[serde(default)]
    pub cadence: CadenceConfig,

    /// Tone shape
    #[serde(default)]
    pub tone: ToneConfig,

    /// Audio output
    #[serde(default)]
    pub audio: AudioConfig,

    /// Shared store
    #[serde(default)]
    pub store: StoreConfig,

    /// Broadcast bus
    #[serde(default)]
    pub bus: BusConfig,
}

/// Playback lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_key")]
    pub key: String,

    /// Age in milliseconds after which another process may take over
    #[serde(default = "default_lease_staleness_ms")]
    pub staleness_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            key: default_lease_key(),
            staleness_ms: default_lease_staleness_ms(),
        }
    }
}

fn default_lease_key() -> String {
    PLAYBACK_LEASE_KEY.to_string()
}
fn default_lease_staleness_ms() -> u64 {
    5_000
}

/// Active-process lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTabConfig {
    #[serde(default = "default_active_tab_key")]
    pub key: String,

    #[serde(default = "default_active_tab_staleness_ms")]
    pub staleness_ms: u64,

    /// How often the active process renews its claim
    #[serde(default = "default_active_tab_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

impl Default for ActiveTabConfig {
    fn default() -> Self {
        Self {
            key: default_active_tab_key(),
            staleness_ms: default_active_tab_staleness_ms(),
            heartbeat_ms: default_active_tab_heartbeat_ms(),
        }
    }
}

fn default_active_tab_key() -> String {
    ACTIVE_TAB_LEASE_KEY.to_string()
}
fn default_active_tab_staleness_ms() -> u64 {
    30_000
}
fn default_active_tab_heartbeat_ms() -> u64 {
    10_000
}

/// Burst cadence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Milliseconds between bursts
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

fn default_interval_ms() -> u64 {
    2_000
}

/// Tone shape settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToneConfig {
    #[serde(default = "default_high_hz")]
    pub high_hz: f32,
    #[serde(default = "default_low_hz")]
    pub low_hz: f32,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    #[serde(default = "default_peak_gain")]
    pub peak_gain: f32,
    #[serde(default = "default_floor_gain")]
    pub floor_gain: f32,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            high_hz: default_high_hz(),
            low_hz: default_low_hz(),
            steps: default_steps(),
            duration_ms: default_duration_ms(),
            peak_gain: default_peak_gain(),
            floor_gain: default_floor_gain(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_high_hz() -> f32 {
    880.0
}
fn default_low_hz() -> f32 {
    660.0
}
fn default_steps() -> usize {
    4
}
fn default_duration_ms() -> u64 {
    600
}
fn default_peak_gain() -> f32 {
    0.3
}
fn default_floor_gain() -> f32 {
    0.001
}
fn default_sample_rate() -> u32 {
    44_100
}

impl From<&ToneConfig> for ToneSpec {
    fn from(config: &ToneConfig) -> Self {
        let peak_gain = if config.peak_gain.is_finite() {
            config.peak_gain.clamp(0.0, 1.0)
        } else {
            default_peak_gain()
        };
        let floor_gain = if config.floor_gain.is_finite() {
            config.floor_gain.clamp(0.0, peak_gain)
        } else {
            default_floor_gain().min(peak_gain)
        };
        ToneSpec {
            high_hz: config.high_hz,
            low_hz: config.low_hz,
            steps: config.steps,
            duration: Duration::from_millis(config.duration_ms),
            peak_gain,
            floor_gain,
            sample_rate: config.sample_rate,
        }
    }
}

/// Which audio output to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pipe WAV into an external player
    #[default]
    Command,
    /// Default output device (needs the `device` feature)
    Device,
    /// Terminal bell
    Bell,
    /// No audio
    None,
}

/// Audio output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Player command line reading WAV from stdin
    #[serde(default = "default_player_command")]
    pub player: Vec<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            player: default_player_command(),
        }
    }
}

impl AudioConfig {
    /// Construct the configured backend.
    pub fn build_backend(&self, kind: BackendKind) -> Arc<dyn AudioBackend> {
        match kind {
            BackendKind::Command => match CommandBackend::from_command_line(&self.player) {
                Some(backend) => Arc::new(backend),
                None => {
                    warn!("Empty player command, audio disabled");
                    Arc::new(NullBackend)
                }
            },
            BackendKind::Device => device_backend(),
            BackendKind::Bell => Arc::new(BellBackend),
            BackendKind::None => Arc::new(NullBackend),
        }
    }
}

#[cfg(feature = "device")]
fn device_backend() -> Arc<dyn AudioBackend> {
    Arc::new(singlebell::audio::DeviceBackend)
}

#[cfg(not(feature = "device"))]
fn device_backend() -> Arc<dyn AudioBackend> {
    warn!("Built without the `device` feature, audio disabled");
    Arc::new(NullBackend)
}

/// Shared store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory of the shared store (defaults to the session runtime dir)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// How often to look for changes made by other processes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    250
}

/// Broadcast bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding one socket per process
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration from default location or create default.
    pub fn load_or_default() -> Self {
        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => return config,
                    Err(e) => {
                        eprintln!("Warning: Failed to load config: {:#}", e);
                    }
                }
            }
        }
        Config::default()
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("singlebell").join("config.toml"))
    }

    /// Coordinator settings, with an optional cadence override.
    pub fn coordinator_config(&self, cadence: Option<Duration>) -> CoordinatorConfig {
        CoordinatorConfig {
            cadence: cadence
                .unwrap_or(Duration::from_millis(self.cadence.interval_ms))
                .max(MIN_CADENCE),
            lease_key: self.lease.key.clone(),
            staleness: Duration::from_millis(self.lease.staleness_ms),
            tone: ToneSpec::from(&self.tone),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.poll_interval_ms.max(10))
    }
}

/// Generate a sample configuration file content.
pub fn sample_config() -> &'static str {
    r##"# Singlebell Configuration File
# One alert tone, however many processes want to ring it

[lease]
# Store key of the playback lease
key = "singlebell.playback-lock"
# Milliseconds before an abandoned lease may be taken over
staleness_ms = 5000

[active_tab]
key = "singlebell.active-tab"
staleness_ms = 30000
heartbeat_ms = 10000

[cadence]
# Milliseconds between bursts
interval_ms = 2000

[tone]
high_hz = 880.0
low_hz = 660.0
steps = 4
duration_ms = 600
peak_gain = 0.3
floor_gain = 0.001
sample_rate = 44100

[audio]
# command, device, bell or none (device needs the `device` build feature)
backend = "command"
# Player reading a WAV stream from stdin
player = ["aplay", "-q", "-"]

[store]
# dir = "/run/user/1000/singlebell/store"
poll_interval_ms = 250

[bus]
enabled = true
# dir = "/run/user/1000/singlebell/bus"
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sample_config_parses() {
        let config: Config = toml::from_str(sample_config()).unwrap();
        assert_eq!(config.lease.staleness_ms, 5_000);
        assert_eq!(config.active_tab.staleness_ms, 30_000);
        assert_eq!(config.cadence.interval_ms, 2_000);
        assert_eq!(config.audio.backend, BackendKind::Command);
        assert!(config.bus.enabled);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("[active_tab]\nstaleness_ms = 60000\n").unwrap();
        assert_eq!(config.active_tab.key, ACTIVE_TAB_LEASE_KEY);
        assert_eq!(config.active_tab.staleness_ms, 60_000);
        assert_eq!(config.lease.key, PLAYBACK_LEASE_KEY);
        assert_eq!(config.tone.high_hz, 880.0);
    }

    #[test]
    fn test_cadence_override() {
        let config = Config::default();
        assert_eq!(config.coordinator_config(None).cadence, Duration::from_secs(2));
        assert_eq!(
            config.coordinator_config(Some(Duration::from_millis(500))).cadence,
            Duration::from_millis(500)
        );
        assert_eq!(config.coordinator_config(None).staleness, Duration::from_secs(5));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[audio]\nbackend = \"bell\"\n\n[cadence]\ninterval_ms = 750\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.audio.backend, BackendKind::Bell);
        assert_eq!(loaded.cadence.interval_ms, 750);
        assert!(Config::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_zero_cadence_is_clamped() {
        let mut config = Config::default();
        config.cadence.interval_ms = 0;
        assert_eq!(config.coordinator_config(None).cadence, MIN_CADENCE);
        assert_eq!(config.coordinator_config(Some(Duration::ZERO)).cadence, MIN_CADENCE);
    }

    #[test]
    fn test_tone_gains_are_clamped() {
        let config: Config = toml::from_str("[tone]\npeak_gain = 0.0\nfloor_gain = 0.5\n").unwrap();
        let spec = ToneSpec::from(&config.tone);
        assert_eq!(spec.peak_gain, 0.0);
        assert_eq!(spec.floor_gain, 0.0);

        let config: Config = toml::from_str("[tone]\npeak_gain = 3.0\nfloor_gain = 2.0\n").unwrap();
        let spec = ToneSpec::from(&config.tone);
        assert_eq!(spec.peak_gain, 1.0);
        assert_eq!(spec.floor_gain, 1.0);
        assert!(spec.render().samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_device_backend_selectable() {
        let config: Config = toml::from_str("[audio]\nbackend = \"device\"\n").unwrap();
        assert_eq!(config.audio.backend, BackendKind::Device);
        let expected = if cfg!(feature = "device") { "device" } else { "none" };
        assert_eq!(config.audio.build_backend(BackendKind::Device).name(), expected);
    }

    #[test]
    fn test_empty_player_disables_audio() {
        let audio = AudioConfig {
            backend: BackendKind::Command,
            player: Vec::new(),
        };
        assert_eq!(audio.build_backend(BackendKind::Command).name(), "none");
    }
}
