//! Monitor settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and handed to the
//! subsystems by value. Durations are stored as integer milliseconds (or
//! seconds where noted) and exposed as [`Duration`] through accessors.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// IntegratorConfig
// ---------------------------------------------------------------------------

/// Settings for the monitoring loop and its failure-escalation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    /// Period of the monitoring cycle.
    pub cycle_interval_ms: u64,
    /// Upper bound on a single sensor or voice pull.  An adapter that does
    /// not answer in time counts as a failed pull.
    pub pull_timeout_ms: u64,
    /// Consecutive failures after which a component is marked `FAILED`
    /// (below the threshold it is `DEGRADED`).
    pub failure_threshold: u32,
    /// Consecutive all-healthy cycles required before leaving `DEGRADED`.
    pub recovery_confirmation_cycles: u32,
    /// While in `FALLBACK`, a single probe delivery is attempted every this
    /// many cycles so the connector can prove it has recovered.
    pub fallback_recheck_cycles: u32,
    /// Time in-flight deliveries are given to finish after shutdown is
    /// requested; anything still running afterwards is cancelled.
    pub shutdown_grace_ms: u64,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 5_000,
            pull_timeout_ms: 2_000,
            failure_threshold: 3,
            recovery_confirmation_cycles: 3,
            fallback_recheck_cycles: 5,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl IntegratorConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// DeliveryConfig
// ---------------------------------------------------------------------------

/// Settings for outbound delivery to the automation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// URL of the sensor-data sink.  `None` leaves the sink unconfigured;
    /// every delivery to it fails and shows up in connector health.
    pub sensor_endpoint: Option<String>,
    /// URL of the command sink.
    pub command_endpoint: Option<String>,
    /// Total number of attempts a single delivery gets before it is marked
    /// `FAILED`.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_backoff_ms: u64,
    /// Upper bound on any single retry delay.
    pub max_backoff_ms: u64,
    /// Number of readings coalesced into one outbound batch.
    pub batch_size: usize,
    /// Maximum age of an open batch before it is sent regardless of size.
    pub batch_window_ms: u64,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            sensor_endpoint: None,
            command_endpoint: None,
            max_retries: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            batch_size: 10,
            batch_window_ms: 10_000,
            request_timeout_secs: 3,
        }
    }
}

impl DeliveryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// BroadcastConfig
// ---------------------------------------------------------------------------

/// Settings for subscriber fan-out and the WebSocket listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Events buffered per subscriber.  A subscriber whose queue is full
    /// when an event is published is dropped.
    pub subscriber_queue_capacity: usize,
    /// Address the WebSocket server listens on.
    pub bind_addr: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 64,
            bind_addr: "0.0.0.0:8000".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// SensorConfig
// ---------------------------------------------------------------------------

/// Settings for reading filtering on top of the raw level probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Number of raw samples in the moving average.
    pub window: usize,
    /// Smallest plausible raw distance in centimetres.
    pub min_cm: f64,
    /// Largest plausible raw distance in centimetres.
    pub max_cm: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            window: 5,
            min_cm: 2.0,
            max_cm: 400.0,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use potion_monitor::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
/// assert!(config.delivery.max_retries > 0);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Monitoring loop and escalation policy.
    pub integrator: IntegratorConfig,
    /// Outbound delivery policy and endpoints.
    pub delivery: DeliveryConfig,
    /// Subscriber fan-out.
    pub broadcast: BroadcastConfig,
    /// Reading filter.
    pub sensor: SensorConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
