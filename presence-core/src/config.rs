use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Minimum match score for a verification run to count as a match.
pub const SIMILARITY_THRESHOLD: f64 = 0.7;
/// Minimum liveness confidence for any verification or enrollment run.
pub const LIVENESS_THRESHOLD: f64 = 0.8;
/// Length of every face embedding vector.
pub const EMBEDDING_DIMENSIONS: usize = 128;
/// Number of distinct beacons whose latest reading is retained.
pub const READING_BUFFER_CAPACITY: usize = 10;

// Prefix for environment overrides, e.g. PRESENCE_TX_POWER
const ENV_PREFIX: &str = "PRESENCE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

// Calibration for converting RSSI into a distance estimate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    pub tx_power: f64,           // Measured RSSI at 1 meter, in dBm
    pub path_loss_exponent: f64, // 2.0 for free space, higher indoors
    pub range_threshold_meters: f64,
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
    // No reading for the session beacon within this window drops the connection
    #[serde(with = "humantime_serde")]
    pub staleness_window: Duration,
    pub event_channel_capacity: usize,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        let scan_interval = Duration::from_secs(2);
        ProximityConfig {
            tx_power: -59.0,
            path_loss_exponent: 2.0,
            range_threshold_meters: 15.0,
            scan_interval,
            staleness_window: scan_interval * 2,
            event_channel_capacity: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiometricConfig {
    pub similarity_threshold: f64,
    pub liveness_threshold: f64,
    // Each liveness check takes at least this long, so a static image can't
    // pass all three instantly
    #[serde(with = "humantime_serde")]
    pub liveness_check_window: Duration,
    // Upper bound for every individual pipeline stage
    #[serde(with = "humantime_serde")]
    pub stage_timeout: Duration,
}

impl Default for BiometricConfig {
    fn default() -> Self {
        BiometricConfig {
            similarity_threshold: SIMILARITY_THRESHOLD,
            liveness_threshold: LIVENESS_THRESHOLD,
            liveness_check_window: Duration::from_millis(500),
            stage_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    // After a session ends, arrivals inside this window are recorded as late
    #[serde(with = "humantime_serde")]
    pub late_grace: Duration,
    pub audit_channel_capacity: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            late_grace: Duration::from_secs(10 * 60),
            audit_channel_capacity: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub proximity: ProximityConfig,
    pub biometric: BiometricConfig,
    pub fusion: FusionConfig,
    pub log_level: log::LevelFilter,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            proximity: ProximityConfig::default(),
            biometric: BiometricConfig::default(),
            fusion: FusionConfig::default(),
            log_level: log::LevelFilter::Info,
        }
    }
}

impl SystemConfig {
    /// Parses a JSON document. Missing fields fall back to their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SystemConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `PRESENCE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = SystemConfig::default();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides from `lookup`, which maps a full variable name
    /// (`PRESENCE_SIMILARITY_THRESHOLD`) to its raw value.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(raw) = get("SIMILARITY_THRESHOLD") {
            self.biometric.similarity_threshold = parse_f64("SIMILARITY_THRESHOLD", &raw)?;
        }
        if let Some(raw) = get("LIVENESS_THRESHOLD") {
            self.biometric.liveness_threshold = parse_f64("LIVENESS_THRESHOLD", &raw)?;
        }
        if let Some(raw) = get("LIVENESS_CHECK_WINDOW") {
            self.biometric.liveness_check_window = parse_duration("LIVENESS_CHECK_WINDOW", &raw)?;
        }
        if let Some(raw) = get("STAGE_TIMEOUT") {
            self.biometric.stage_timeout = parse_duration("STAGE_TIMEOUT", &raw)?;
        }
        if let Some(raw) = get("RANGE_THRESHOLD_METERS") {
            self.proximity.range_threshold_meters = parse_f64("RANGE_THRESHOLD_METERS", &raw)?;
        }
        if let Some(raw) = get("TX_POWER") {
            self.proximity.tx_power = parse_f64("TX_POWER", &raw)?;
        }
        if let Some(raw) = get("PATH_LOSS_EXPONENT") {
            self.proximity.path_loss_exponent = parse_f64("PATH_LOSS_EXPONENT", &raw)?;
        }
        if let Some(raw) = get("SCAN_INTERVAL") {
            self.proximity.scan_interval = parse_duration("SCAN_INTERVAL", &raw)?;
            // Staleness follows the scan interval unless set explicitly below
            self.proximity.staleness_window = self.proximity.scan_interval * 2;
        }
        if let Some(raw) = get("STALENESS_WINDOW") {
            self.proximity.staleness_window = parse_duration("STALENESS_WINDOW", &raw)?;
        }
        if let Some(raw) = get("LATE_GRACE") {
            self.fusion.late_grace = parse_duration("LATE_GRACE", &raw)?;
        }
        if let Some(raw) = get("LOG_LEVEL") {
            self.log_level = raw.parse().map_err(|_| ConfigError::Invalid {
                key: "LOG_LEVEL",
                value: raw.clone(),
            })?;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("similarity_threshold", self.biometric.similarity_threshold)?;
        check_unit("liveness_threshold", self.biometric.liveness_threshold)?;
        if !(self.proximity.path_loss_exponent > 0.0) {
            return Err(invalid("path_loss_exponent", self.proximity.path_loss_exponent));
        }
        if !(self.proximity.range_threshold_meters >= 0.0) {
            return Err(invalid("range_threshold_meters", self.proximity.range_threshold_meters));
        }
        if self.proximity.scan_interval.is_zero() {
            return Err(invalid("scan_interval", "0s"));
        }
        if self.proximity.staleness_window.is_zero() {
            return Err(invalid("staleness_window", "0s"));
        }
        if self.biometric.stage_timeout.is_zero() {
            return Err(invalid("stage_timeout", "0s"));
        }
        // The liveness stage alone needs three check windows
        if self.biometric.stage_timeout <= self.biometric.liveness_check_window.saturating_mul(3) {
            return Err(invalid("stage_timeout", format!("{:?}", self.biometric.stage_timeout)));
        }
        if self.proximity.event_channel_capacity == 0 {
            return Err(invalid("event_channel_capacity", 0));
        }
        if self.fusion.audit_channel_capacity == 0 {
            return Err(invalid("audit_channel_capacity", 0));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid { key, value: value.to_string() }
}

fn check_unit(key: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(key, value))
    }
}

fn parse_f64(key: &'static str, raw: &str) -> Result<f64, ConfigError> {
    raw.trim().parse::<f64>().map_err(|_| invalid(key, raw))
}

// Same syntax the JSON form accepts ("2s", "500ms", "10m")
fn parse_duration(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    humantime_serde::deserialize(serde_json::Value::String(raw.trim().to_string()))
        .map_err(|_: serde_json::Error| invalid(key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SystemConfig::default();
        assert_eq!(config.biometric.similarity_threshold, 0.7);
        assert_eq!(config.biometric.liveness_threshold, 0.8);
        assert_eq!(config.proximity.tx_power, -59.0);
        assert_eq!(config.proximity.path_loss_exponent, 2.0);
        assert_eq!(config.proximity.range_threshold_meters, 15.0);
        assert_eq!(config.proximity.scan_interval, Duration::from_secs(2));
        // Staleness defaults to twice the scan interval
        assert_eq!(config.proximity.staleness_window, Duration::from_secs(4));
        assert_eq!(config.log_level, log::LevelFilter::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_are_applied() {
        let vars: HashMap<String, String> = [
            ("PRESENCE_SIMILARITY_THRESHOLD", "0.65"),
            ("PRESENCE_TX_POWER", "-61"),
            ("PRESENCE_SCAN_INTERVAL", "1s"),
            ("PRESENCE_LATE_GRACE", "5m"),
            ("PRESENCE_STAGE_TIMEOUT", "250ms"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut config = SystemConfig::default();
        config.apply_env_overrides(|key| vars.get(key).cloned()).unwrap();

        assert_eq!(config.biometric.similarity_threshold, 0.65);
        assert_eq!(config.proximity.tx_power, -61.0);
        assert_eq!(config.proximity.scan_interval, Duration::from_secs(1));
        assert_eq!(config.proximity.staleness_window, Duration::from_secs(2));
        assert_eq!(config.fusion.late_grace, Duration::from_secs(300));
        assert_eq!(config.biometric.stage_timeout, Duration::from_millis(250));
        // Untouched values keep their defaults
        assert_eq!(config.biometric.liveness_threshold, 0.8);
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut config = SystemConfig::default();
        let err = config
            .apply_env_overrides(|key| {
                (key == "PRESENCE_PATH_LOSS_EXPONENT").then(|| "steep".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PATH_LOSS_EXPONENT", .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_thresholds() {
        let mut config = SystemConfig::default();
        config.biometric.liveness_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = SystemConfig::default();
        config.proximity.path_loss_exponent = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_stage_timeout_shorter_than_liveness_windows() {
        let mut config = SystemConfig::default();
        config.biometric.liveness_check_window = Duration::from_millis(500);
        config.biometric.stage_timeout = Duration::from_millis(1500);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "stage_timeout", .. })
        ));

        config.biometric.stage_timeout = Duration::from_millis(1501);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_config_fills_missing_fields_with_defaults() {
        let raw = r#"{
            "proximity": { "range_threshold_meters": 8.0, "scan_interval": "3s" },
            "fusion": { "late_grace": "15m" }
        }"#;
        let config = SystemConfig::from_json_str(raw).unwrap();
        assert_eq!(config.proximity.range_threshold_meters, 8.0);
        assert_eq!(config.proximity.scan_interval, Duration::from_secs(3));
        assert_eq!(config.proximity.tx_power, -59.0);
        assert_eq!(config.fusion.late_grace, Duration::from_secs(900));
        assert_eq!(config.biometric, BiometricConfig::default());
    }
}
