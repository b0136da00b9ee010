//! TOML configuration for a data-on-demand device.
//!
//! A device is described by one TOML file with these sections:
//!
//! ```toml
//! [device]           # identity and acquisition profile
//! [timebase]         # clock frequencies, decimation, drift ratio
//! [buffer]           # history buffer geometry
//! [drain]            # hardware FIFO drain loop tuning
//! [controller]       # position resolution limits
//! [queue]            # per-client stream queue sizing
//! ```
//!
//! Only `[device]` is mandatory; every other section falls back to
//! defaults sized for a 125 MHz sample clock. Values can be overridden
//! with `DOD_`-prefixed environment variables using `__` as the section
//! separator, e.g. `DOD_CONTROLLER__TIMEOUT=10s`.

use crate::profile::DeviceProfile;
use crate::timebase::ClockRatio;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("config file not found: {0}")]
    NotFound(String),

    /// Parse error (invalid TOML or type mismatch)
    #[error("failed to parse config: {0}")]
    ParseError(String),

    /// Cross-field validation error
    #[error("config validation failed: {0}")]
    ValidationError(String),
}

// =============================================================================
// Top-Level Config
// =============================================================================

/// Complete device configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Device identity and acquisition profile.
    pub device: DeviceSection,

    /// Clock frequencies and decimation.
    #[serde(default)]
    pub timebase: TimebaseSection,

    /// History buffer geometry.
    #[serde(default)]
    pub buffer: BufferSection,

    /// FIFO drain loop tuning.
    #[serde(default)]
    pub drain: DrainSection,

    /// Position resolution limits.
    #[serde(default)]
    pub controller: ControllerSection,

    /// Per-client stream queue sizing.
    #[serde(default)]
    pub queue: QueueSection,
}

// =============================================================================
// Device Identity
// =============================================================================

/// Device identity and acquisition profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSection {
    /// Instrument name, used in log output.
    pub name: String,

    /// Acquisition profile, decides atom layout and trigger handling.
    pub profile: DeviceProfile,
}

// =============================================================================
// Timebase
// =============================================================================

/// Clock frequencies and decimation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimebaseSection {
    /// System-wide sample clock frequency in Hz.
    #[serde(default = "default_frequency_hz")]
    pub lst_frequency_hz: u64,

    /// Local sample clock frequency in Hz. Equal to the system frequency
    /// on instruments without an independent local clock.
    #[serde(default = "default_frequency_hz")]
    pub lmt_frequency_hz: u64,

    /// Samples per machine-time tick. Falls back to the profile default
    /// when absent.
    #[serde(default)]
    pub decimation: Option<u32>,

    /// Numerator of the measured clock drift ratio.
    #[serde(default = "default_ratio_term")]
    pub ratio_numerator: u64,

    /// Denominator of the measured clock drift ratio.
    #[serde(default = "default_ratio_term")]
    pub ratio_denominator: u64,
}

impl TimebaseSection {
    /// Drift ratio as passed to the timebase converter.
    #[must_use]
    pub fn ratio(&self) -> ClockRatio {
        ClockRatio {
            numerator: self.ratio_numerator,
            denominator: self.ratio_denominator,
        }
    }

    /// Configured decimation, or the profile default when absent.
    #[must_use]
    pub fn decimation_for(&self, profile: DeviceProfile) -> u32 {
        self.decimation.unwrap_or_else(|| profile.default_decimation())
    }
}

impl Default for TimebaseSection {
    fn default() -> Self {
        Self {
            lst_frequency_hz: default_frequency_hz(),
            lmt_frequency_hz: default_frequency_hz(),
            decimation: None,
            ratio_numerator: default_ratio_term(),
            ratio_denominator: default_ratio_term(),
        }
    }
}

fn default_frequency_hz() -> u64 {
    125_000_000
}

fn default_ratio_term() -> u64 {
    1
}

// =============================================================================
// Buffer
// =============================================================================

/// History buffer geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferSection {
    /// Ring capacity in atoms. Must be a power of two.
    #[serde(default = "default_capacity_atoms")]
    pub capacity_atoms: u64,

    /// Atoms behind the write head treated as unreadable. Falls back to
    /// the profile default when absent.
    #[serde(default)]
    pub dead_zone: Option<u64>,
}

impl BufferSection {
    /// Configured dead zone, or the profile default for this capacity.
    #[must_use]
    pub fn dead_zone_for(&self, profile: DeviceProfile) -> u64 {
        self.dead_zone
            .unwrap_or_else(|| profile.dead_zone(self.capacity_atoms))
    }
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            capacity_atoms: default_capacity_atoms(),
            dead_zone: None,
        }
    }
}

fn default_capacity_atoms() -> u64 {
    65_536
}

// =============================================================================
// Drain Loop
// =============================================================================

/// Hardware FIFO drain loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DrainSection {
    /// Largest burst transferred per poll, in atoms.
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: usize,

    /// Sleep between polls when the FIFO is empty.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Consecutive empty polls before the loop reports a dead data path.
    #[serde(default = "default_max_idle_polls")]
    pub max_idle_polls: u32,

    /// Drop all but every N-th atom in the drain loop instead of in
    /// hardware, where N is the timebase decimation.
    #[serde(default)]
    pub predecimate: bool,
}

impl Default for DrainSection {
    fn default() -> Self {
        Self {
            burst_capacity: default_burst_capacity(),
            poll_interval: default_poll_interval(),
            max_idle_polls: default_max_idle_polls(),
            predecimate: false,
        }
    }
}

fn default_burst_capacity() -> usize {
    256
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(1)
}

fn default_max_idle_polls() -> u32 {
    1_000
}

// =============================================================================
// Controller
// =============================================================================

/// Position resolution limits, shared by all controllers on the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSection {
    /// Budget for one position resolution, including waits for events
    /// and for data to arrive.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How many atoms past the write head a request may wait for before
    /// it is refused outright.
    #[serde(default)]
    pub max_look_ahead: u64,

    /// Largest read a single request may ask for, in atoms.
    #[serde(default = "default_max_read_size")]
    pub max_read_size: usize,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_look_ahead: 0,
            max_read_size: default_max_read_size(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_read_size() -> usize {
    16_384
}

// =============================================================================
// Stream Queue
// =============================================================================

/// What a full client queue does with the next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Refuse the new chunk, keep the backlog.
    KeepOld,
    /// Drop the oldest chunk to make room.
    KeepNew,
}

impl From<QueuePolicy> for dod_queue::OverflowPolicy {
    fn from(policy: QueuePolicy) -> Self {
        match policy {
            QueuePolicy::KeepOld => dod_queue::OverflowPolicy::KeepOld,
            QueuePolicy::KeepNew => dod_queue::OverflowPolicy::KeepNew,
        }
    }
}

/// Per-client stream queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSection {
    /// Chunks a client may hold unconsumed.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Overflow behavior when the queue is full.
    #[serde(default = "default_queue_policy")]
    pub policy: QueuePolicy,

    /// Pooled data chunks per client.
    #[serde(default = "default_chunk_count")]
    pub chunk_count: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            policy: default_queue_policy(),
            chunk_count: default_chunk_count(),
        }
    }
}

fn default_queue_capacity() -> usize {
    32
}

fn default_queue_policy() -> QueuePolicy {
    QueuePolicy::KeepOld
}

fn default_chunk_count() -> usize {
    16
}

// =============================================================================
// Validation
// =============================================================================

/// Cross-field validation beyond what deserialization enforces.
pub fn validate_device_config(config: &DeviceConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.device.name.trim().is_empty() {
        errors.push("device name cannot be empty".to_string());
    }

    let tb = &config.timebase;
    if tb.lst_frequency_hz == 0 || tb.lmt_frequency_hz == 0 {
        errors.push("timebase frequencies must be nonzero".to_string());
    }
    if tb.decimation == Some(0) {
        errors.push("decimation must be nonzero".to_string());
    }
    if tb.ratio_numerator == 0 || tb.ratio_denominator == 0 {
        errors.push("drift ratio terms must be nonzero".to_string());
    }

    let capacity = config.buffer.capacity_atoms;
    if !capacity.is_power_of_two() {
        errors.push(format!(
            "buffer capacity {capacity} must be a power of two"
        ));
    }
    let dead_zone = config.buffer.dead_zone_for(config.device.profile);
    if dead_zone >= capacity {
        errors.push(format!(
            "dead zone {dead_zone} must be smaller than the capacity {capacity}"
        ));
    } else if (config.controller.max_read_size as u64) > capacity - dead_zone {
        errors.push(format!(
            "max read size {} exceeds the readable window of {} atoms",
            config.controller.max_read_size,
            capacity - dead_zone
        ));
    }

    if config.drain.burst_capacity == 0 {
        errors.push("drain burst capacity must be nonzero".to_string());
    }
    if config.drain.poll_interval.is_zero() {
        errors.push("drain poll interval must be nonzero".to_string());
    }
    if config.drain.max_idle_polls == 0 {
        errors.push("max idle polls must be nonzero".to_string());
    }

    if config.controller.timeout.is_zero() {
        errors.push("controller timeout must be nonzero".to_string());
    }
    if config.controller.max_read_size == 0 {
        errors.push("max read size must be nonzero".to_string());
    }

    if config.queue.capacity == 0 {
        errors.push("queue capacity must be nonzero".to_string());
    }
    if config.queue.chunk_count == 0 {
        errors.push("chunk count must be nonzero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Load a device configuration from a TOML file.
///
/// The file is layered with `DOD_`-prefixed environment variables, then
/// validated. Returns [`ConfigLoadError`] describing the first failing
/// stage.
pub fn load_device_config(path: &Path) -> Result<DeviceConfig> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
    }

    debug!("loading device config from {}", path.display());

    let figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("DOD_").split("__"));

    let config: DeviceConfig = figment
        .extract()
        .map_err(|e| ConfigLoadError::ParseError(e.to_string()))
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    validate_device_config(&config)
        .map_err(|errors| ConfigLoadError::ValidationError(errors.join("; ")))?;

    info!(
        device = %config.device.name,
        profile = %config.device.profile,
        "loaded device config"
    );

    Ok(config)
}

/// Load a device configuration from a TOML string.
///
/// Useful for testing or for configs embedded in another file.
pub fn load_device_config_from_str(toml_content: &str) -> Result<DeviceConfig> {
    let config: DeviceConfig =
        toml::from_str(toml_content).with_context(|| "failed to parse TOML content")?;

    validate_device_config(&config)
        .map_err(|errors| ConfigLoadError::ValidationError(errors.join("; ")))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL_CONFIG: &str = r#"
[device]
name = "lab bpm 1"
profile = "ebpp"
"#;

    const FULL_CONFIG: &str = r#"
[device]
name = "booster bpm"
profile = "bbfp"

[timebase]
lst_frequency_hz = 125000000
lmt_frequency_hz = 117000000
decimation = 2
ratio_numerator = 1000001
ratio_denominator = 1000000

[buffer]
capacity_atoms = 131072
dead_zone = 128

[drain]
burst_capacity = 512
poll_interval = "250us"
max_idle_polls = 4000
predecimate = true

[controller]
timeout = "2s"
max_look_ahead = 64
max_read_size = 8192

[queue]
capacity = 8
policy = "keep_new"
chunk_count = 4
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = load_device_config_from_str(MINIMAL_CONFIG).unwrap();
        assert_eq!(config.device.name, "lab bpm 1");
        assert_eq!(config.device.profile, DeviceProfile::Ebpp);
        assert_eq!(config.timebase.lst_frequency_hz, 125_000_000);
        assert_eq!(config.timebase.decimation_for(DeviceProfile::Ebpp), 1);
        assert_eq!(config.timebase.decimation_for(DeviceProfile::Hbpp), 64);
        assert_eq!(config.buffer.capacity_atoms, 65_536);
        assert_eq!(config.buffer.dead_zone_for(DeviceProfile::Ebpp), 64);
        assert_eq!(config.drain.poll_interval, Duration::from_millis(1));
        assert!(!config.drain.predecimate);
        assert_eq!(config.controller.timeout, Duration::from_secs(5));
        assert_eq!(config.controller.max_look_ahead, 0);
        assert_eq!(config.queue.policy, QueuePolicy::KeepOld);
    }

    #[test]
    fn test_full_config_parses_every_section() {
        let config = load_device_config_from_str(FULL_CONFIG).unwrap();
        assert_eq!(config.device.profile, DeviceProfile::Bbfp);
        assert_eq!(config.timebase.lmt_frequency_hz, 117_000_000);
        assert_eq!(config.timebase.ratio().numerator, 1_000_001);
        assert_eq!(config.buffer.dead_zone_for(DeviceProfile::Bbfp), 128);
        assert_eq!(config.drain.poll_interval, Duration::from_micros(250));
        assert_eq!(config.drain.burst_capacity, 512);
        assert!(config.drain.predecimate);
        assert_eq!(config.controller.timeout, Duration::from_secs(2));
        assert_eq!(config.queue.policy, QueuePolicy::KeepNew);
        assert_eq!(
            dod_queue::OverflowPolicy::from(config.queue.policy),
            dod_queue::OverflowPolicy::KeepNew
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let bad = r#"
[device]
name = "x"
profile = "ebpp"
turbo = true
"#;
        assert!(load_device_config_from_str(bad).is_err());
    }

    #[test]
    fn test_validation_catches_bad_geometry() {
        let bad = r#"
[device]
name = "x"
profile = "ebpp"

[buffer]
capacity_atoms = 1000
dead_zone = 2000

[drain]
burst_capacity = 0
"#;
        let err = load_device_config_from_str(bad).unwrap_err().to_string();
        assert!(err.contains("power of two"), "{err}");
        assert!(err.contains("dead zone"), "{err}");
        assert!(err.contains("burst capacity"), "{err}");
    }

    #[test]
    fn test_read_size_must_fit_readable_window() {
        let bad = r#"
[device]
name = "x"
profile = "ebpp"

[buffer]
capacity_atoms = 1024

[controller]
max_read_size = 1000
"#;
        // 1024 atoms minus the 64-atom default dead zone leaves 960.
        let err = load_device_config_from_str(bad).unwrap_err().to_string();
        assert!(err.contains("readable window"), "{err}");
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(FULL_CONFIG.as_bytes()).unwrap();

        let config = load_device_config(&path).unwrap();
        assert_eq!(config.device.name, "booster bpm");

        let missing = dir.path().join("absent.toml");
        let err = load_device_config(&missing).unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
    }
}
