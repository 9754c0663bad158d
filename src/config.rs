use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Static description of the emulated pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub modules: u8,
    pub cells_per_module: u8,
    pub max_cell_voltage: f32,
    pub min_cell_voltage: f32,
    pub default_cell_voltage: f32,
    pub max_current: f32,
    pub capacity_wh: u32,
    pub firmware_major: u8,
    pub firmware_minor: u8,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            modules: 2,
            cells_per_module: 32,
            max_cell_voltage: 3.6,
            min_cell_voltage: 2.8,
            default_cell_voltage: 3.3,
            max_current: 25.6,
            capacity_wh: 10_240,
            firmware_major: 3,
            firmware_minor: 29,
        }
    }
}

impl BatteryConfig {
    pub fn cell_count(&self) -> u16 {
        u16::from(self.modules) * u16::from(self.cells_per_module)
    }
}

/// Periods of the periodic frame categories, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub limits_interval_ms: u64,
    pub info_interval_ms: u64,
    pub state_interval_ms: u64,
    pub alarm_interval_ms: u64,
    pub handshake_attempts: u8,
    pub handshake_retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            limits_interval_ms: 2_000,
            info_interval_ms: 10_000,
            state_interval_ms: 10_000,
            alarm_interval_ms: 60_000,
            handshake_attempts: 3,
            handshake_retry_delay_ms: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// No heartbeat for this long zeroes the transmitted current limits.
    pub heartbeat_timeout_ms: u64,
    /// No heartbeat for this long requests a process restart.
    pub restart_timeout_ms: u64,
    /// How long a failed bus init is tolerated before a restart is requested.
    pub init_failure_grace_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 60_000,
            restart_timeout_ms: 600_000,
            init_failure_grace_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub hostname: String,
    /// Prefix prepended to every published topic. Empty means `<hostname>/`.
    pub module_topic: String,
    /// Absolute topic carrying the supervisory controller's heartbeat.
    pub heartbeat_topic: String,
    pub queue_capacity: usize,
    /// Messages handed to the broker per loop iteration.
    pub drain_budget: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            hostname: "hvsbus".into(),
            module_topic: String::new(),
            heartbeat_topic: "master/heartbeat".into(),
            queue_capacity: 64,
            drain_budget: 1,
        }
    }
}

impl BrokerConfig {
    pub fn resolved_module_topic(&self) -> String {
        if self.module_topic.is_empty() {
            format!("{}/", self.hostname)
        } else {
            self.module_topic.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub battery: BatteryConfig,
    pub scheduler: SchedulerConfig,
    pub safety: SafetyConfig,
    pub broker: BrokerConfig,
}

impl EmulatorConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.battery.cell_count() == 0 {
            return Err(ConfigError::Invalid("battery must have at least one cell"));
        }
        if self.broker.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be non-zero"));
        }
        if self.broker.drain_budget == 0 {
            return Err(ConfigError::Invalid("drain_budget must be non-zero"));
        }
        let s = &self.scheduler;
        if s.limits_interval_ms == 0
            || s.info_interval_ms == 0
            || s.state_interval_ms == 0
            || s.alarm_interval_ms == 0
        {
            return Err(ConfigError::Invalid("frame intervals must be non-zero"));
        }
        if s.handshake_attempts == 0 {
            return Err(ConfigError::Invalid("handshake_attempts must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EmulatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.battery.cell_count(), 64);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EmulatorConfig::from_json(r#"{"broker":{"hostname":"garage"}}"#).unwrap();
        assert_eq!(config.broker.hostname, "garage");
        assert_eq!(config.broker.resolved_module_topic(), "garage/");
        assert_eq!(config.scheduler.limits_interval_ms, 2_000);
    }

    #[test]
    fn test_explicit_module_topic_wins() {
        let mut broker = BrokerConfig::default();
        broker.module_topic = "site/bat1/".into();
        assert_eq!(broker.resolved_module_topic(), "site/bat1/");
    }

    #[test]
    fn test_zero_cells_rejected() {
        let result = EmulatorConfig::from_json(r#"{"battery":{"modules":0}}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_queue_rejected() {
        let result = EmulatorConfig::from_json(r#"{"broker":{"queue_capacity":0}}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(EmulatorConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
