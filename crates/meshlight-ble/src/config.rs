//! Configuration types for the mesh controller
//!
//! This module provides configuration structures for the BLE device, the
//! vendor opcode table, link reconnection, command retry policy and the
//! sub-devices registered at start-up. Durations are written as humantime
//! strings (`"2s"`, `"250ms"`) in JSON.

use meshlight_protocol::{OpcodeTable, BROADCAST_ADDRESS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{MeshError, Result};

/// Default per-attempt connection timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default GATT write timeout
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time to wait for a state report after a dispatch
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of retransmissions after the first dispatch
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default age after which a queued command is discarded
pub const DEFAULT_MAX_STALENESS: Duration = Duration::from_secs(30);

/// Default interval between keep-alive queries on an idle link
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Main configuration for a mesh controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Physical BLE device
    #[serde(default)]
    pub device: DeviceConfig,

    /// Vendor opcode byte values
    #[serde(default)]
    pub opcodes: OpcodeTable,

    /// Reconnection behavior
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Command timeout and retry policy
    #[serde(default)]
    pub queue: QueueConfig,

    /// Controller loop settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Sub-devices registered at start-up
    #[serde(default)]
    pub sub_devices: Vec<SubDeviceConfig>,
}

impl MeshConfig {
    /// Parse a configuration from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: MeshConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.opcodes.validate()?;

        if self.queue.ack_timeout.is_zero() {
            return Err(MeshError::InvalidConfig(
                "queue.ack_timeout must be greater than zero".to_string(),
            ));
        }
        if self.device.write_timeout.is_zero() || self.device.connect_timeout.is_zero() {
            return Err(MeshError::InvalidConfig(
                "device timeouts must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return Err(MeshError::InvalidConfig(
                "reconnect.initial_delay exceeds reconnect.max_delay".to_string(),
            ));
        }
        if self.controller.housekeeping_interval.is_zero() {
            return Err(MeshError::InvalidConfig(
                "controller.housekeeping_interval must be greater than zero".to_string(),
            ));
        }
        if self.controller.command_channel_size == 0 || self.controller.event_channel_size == 0 {
            return Err(MeshError::InvalidConfig(
                "controller channel sizes must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for sub in &self.sub_devices {
            if sub.address == BROADCAST_ADDRESS {
                return Err(MeshError::InvalidAddress(sub.address));
            }
            if !seen.insert(sub.address) {
                return Err(MeshError::InvalidConfig(format!(
                    "sub-device address {} listed twice",
                    sub.address
                )));
            }
        }

        Ok(())
    }
}

/// Connection parameters for the physical gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// BLE address (or advertised name) of the gateway
    #[serde(default)]
    pub address: String,

    /// Vendor GATT service
    #[serde(default)]
    pub service_uuid: Uuid,

    /// Characteristic commands are written to
    #[serde(default)]
    pub write_char_uuid: Uuid,

    /// Characteristic state reports are notified on
    #[serde(default)]
    pub notify_char_uuid: Uuid,

    /// Use acknowledged GATT writes
    #[serde(default)]
    pub write_with_response: bool,

    /// How long to scan for the gateway before giving up
    #[serde(with = "humantime_serde", default = "default_scan_timeout")]
    pub scan_timeout: Duration,

    /// Upper bound on one connect-and-subscribe attempt
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Upper bound on one GATT write
    #[serde(with = "humantime_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,
}

fn default_scan_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_write_timeout() -> Duration {
    DEFAULT_WRITE_TIMEOUT
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            service_uuid: Uuid::nil(),
            write_char_uuid: Uuid::nil(),
            notify_char_uuid: Uuid::nil(),
            write_with_response: false,
            scan_timeout: default_scan_timeout(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl DeviceConfig {
    /// Check the fields a real BLE transport needs
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(MeshError::InvalidConfig(
                "device.address is required".to_string(),
            ));
        }
        if self.write_char_uuid.is_nil() || self.notify_char_uuid.is_nil() {
            return Err(MeshError::InvalidConfig(
                "device write and notify characteristic UUIDs are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection after an unsolicited drop
    #[serde(default = "default_auto_reconnect")]
    pub enabled: bool,

    /// Delay before the second attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Ceiling for the doubling delay
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Attempts per connect or reconnect cycle (0 = infinite)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl ReconnectConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether `attempts` failed attempts exhaust the cycle
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

/// Command timeout and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Time to wait for a matching state report
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub ack_timeout: Duration,

    /// Retransmissions after the first dispatch
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Linear backoff step between retransmissions
    #[serde(with = "humantime_serde", default = "default_retry_backoff")]
    pub retry_backoff: Duration,

    /// Age after which an undispatched command expires
    #[serde(with = "humantime_serde", default = "default_max_staleness")]
    pub max_staleness: Duration,
}

fn default_ack_timeout() -> Duration {
    DEFAULT_ACK_TIMEOUT
}

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_max_staleness() -> Duration {
    DEFAULT_MAX_STALENESS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_backoff: Duration::from_millis(250),
            max_staleness: DEFAULT_MAX_STALENESS,
        }
    }
}

/// Controller loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Capacity of the handle command channel
    #[serde(default = "default_channel_size")]
    pub command_channel_size: usize,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_channel_size")]
    pub event_channel_size: usize,

    /// Broadcast a state query when the link has been idle this long
    #[serde(with = "humantime_serde_option", default = "default_keep_alive")]
    pub keep_alive_interval: Option<Duration>,

    /// Mark sub-devices stale when nothing was reported for this long
    #[serde(with = "humantime_serde", default = "default_stale_after")]
    pub stale_after: Duration,

    /// Period of the housekeeping tick
    #[serde(with = "humantime_serde", default = "default_housekeeping_interval")]
    pub housekeeping_interval: Duration,
}

fn default_channel_size() -> usize {
    256
}

fn default_keep_alive() -> Option<Duration> {
    Some(DEFAULT_KEEP_ALIVE_INTERVAL)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_housekeeping_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            command_channel_size: 256,
            event_channel_size: 256,
            keep_alive_interval: Some(DEFAULT_KEEP_ALIVE_INTERVAL),
            stale_after: Duration::from_secs(300),
            housekeeping_interval: Duration::from_secs(5),
        }
    }
}

/// A sub-device known from persisted configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDeviceConfig {
    /// Mesh address (1..=255)
    pub address: u8,
    /// Human-readable label
    pub label: String,
}

/// Builder for MeshConfig
#[derive(Debug, Default)]
pub struct MeshConfigBuilder {
    config: MeshConfig,
}

impl MeshConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gateway address and GATT identifiers
    pub fn device(
        mut self,
        address: impl Into<String>,
        service_uuid: Uuid,
        write_char_uuid: Uuid,
        notify_char_uuid: Uuid,
    ) -> Self {
        self.config.device.address = address.into();
        self.config.device.service_uuid = service_uuid;
        self.config.device.write_char_uuid = write_char_uuid;
        self.config.device.notify_char_uuid = notify_char_uuid;
        self
    }

    /// Replace the opcode table
    pub fn opcodes(mut self, opcodes: OpcodeTable) -> Self {
        self.config.opcodes = opcodes;
        self
    }

    /// Set the state-report timeout
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.queue.ack_timeout = timeout;
        self
    }

    /// Set the retransmission limit
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config.queue.retry_limit = limit;
        self
    }

    /// Set the retransmission backoff step
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.queue.retry_backoff = backoff;
        self
    }

    /// Set the queued-command staleness window
    pub fn max_staleness(mut self, window: Duration) -> Self {
        self.config.queue.max_staleness = window;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Set attempts per connect cycle (0 = infinite)
    pub fn max_connect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    /// Set the idle keep-alive interval (`None` disables it)
    pub fn keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.config.controller.keep_alive_interval = interval;
        self
    }

    /// Register a sub-device at start-up
    pub fn sub_device(mut self, address: u8, label: impl Into<String>) -> Self {
        self.config.sub_devices.push(SubDeviceConfig {
            address,
            label: label.into(),
        });
        self
    }

    /// Build the configuration
    pub fn build(self) -> MeshConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// Same as above, with `null` meaning disabled
mod humantime_serde_option {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
