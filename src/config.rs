//!
//! # 配置模块
//!
//! Configuration for the HSM subsystem: provider selection, hardware module
//! parameters, per-operation timeouts, scheduler intervals and storage paths.
//! Values come from serde (with defaults for every section) or from
//! environment-style variables via [`HsmConfig::from_env`].
//!
use crate::error::ValidationError;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which cryptographic provider the subsystem should use.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// In-process simulated provider.
    #[default]
    Simulated,
    /// PKCS#11 module (hardware HSM or SoftHSM).
    Hardware,
}

impl fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderMode::Simulated => f.write_str("simulated"),
            ProviderMode::Hardware => f.write_str("hardware"),
        }
    }
}

impl FromStr for ProviderMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" | "software" | "mock" => Ok(ProviderMode::Simulated),
            "hardware" | "pkcs11" | "softhsm" => Ok(ProviderMode::Hardware),
            other => Err(ValidationError::InvalidConfig(format!(
                "unknown provider mode: {other}"
            ))),
        }
    }
}

/// PKCS#11 module parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Path to the PKCS#11 shared library.
    pub module_path: Option<PathBuf>,
    /// Index into the list of slots that hold a token.
    pub slot: Option<usize>,
    /// User PIN. Never serialized.
    #[serde(skip)]
    pub pin: Option<SecretString>,
    /// Label used when a caller does not supply one.
    #[serde(default = "default_key_label")]
    pub key_label: String,
}

fn default_key_label() -> String {
    "seal-hsm-key".to_string()
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            module_path: None,
            slot: None,
            pin: None,
            key_label: default_key_label(),
        }
    }
}

/// Per-operation-type timeouts, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub connection_ms: u64,
    pub key_generation_ms: u64,
    pub crypto_ms: u64,
    pub health_probe_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection_ms: 5_000,
            key_generation_ms: 10_000,
            crypto_ms: 5_000,
            health_probe_ms: 3_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connection(&self) -> Duration {
        Duration::from_millis(self.connection_ms)
    }

    pub fn key_generation(&self) -> Duration {
        Duration::from_millis(self.key_generation_ms)
    }

    pub fn crypto(&self) -> Duration {
        Duration::from_millis(self.crypto_ms)
    }

    pub fn health_probe(&self) -> Duration {
        Duration::from_millis(self.health_probe_ms)
    }
}

/// Background task intervals.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Whether `HsmService::start` spawns the background tasks.
    pub enabled: bool,
    /// Device health probe interval (order of minutes).
    pub health_interval_secs: u64,
    /// Backup policy evaluation interval (order of hours).
    pub backup_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_interval_secs: 5 * 60,
            backup_interval_secs: 60 * 60,
        }
    }
}

impl SchedulerConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_secs)
    }
}

/// Storage locations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory for the file-backed store. `None` keeps state in memory.
    pub data_dir: Option<PathBuf>,
    /// Directory where backup descriptors are written.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Persistence file permissions (Unix mode).
    #[serde(default = "default_file_permissions")]
    pub file_permissions: u32,
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_file_permissions() -> u32 {
    0o600 // 等同于 -rw-------
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            backup_dir: default_backup_dir(),
            file_permissions: default_file_permissions(),
        }
    }
}

/// Complete subsystem configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HsmConfig {
    #[serde(default)]
    pub provider: ProviderMode,
    /// When set, a hardware initialization failure is fatal instead of
    /// falling back to the simulated provider.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl HsmConfig {
    /// Simulated provider, schedulers disabled, in-memory store.
    pub fn simulated() -> Self {
        Self {
            scheduler: SchedulerConfig {
                enabled: false,
                ..SchedulerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Reads configuration from the process environment.
    ///
    /// Recognised variables: `HSM_PROVIDER`, `HSM_STRICT`, `HSM_MODULE_PATH`,
    /// `HSM_SLOT`, `HSM_PIN`, `HSM_KEY_LABEL`, `HSM_HEALTH_INTERVAL_SECS`,
    /// `HSM_BACKUP_INTERVAL_SECS`, `HSM_SCHEDULER_ENABLED`, `HSM_DATA_DIR`,
    /// `HSM_BACKUP_DIR`, `HSM_CRYPTO_TIMEOUT_MS`, `HSM_CONNECTION_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ValidationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`HsmConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = HsmConfig::default();

        if let Some(mode) = lookup("HSM_PROVIDER") {
            config.provider = mode.parse()?;
        }
        if let Some(strict) = lookup("HSM_STRICT") {
            config.strict = parse_bool("HSM_STRICT", &strict)?;
        }
        if let Some(path) = lookup("HSM_MODULE_PATH").filter(|p| !p.is_empty()) {
            config.hardware.module_path = Some(PathBuf::from(path));
        }
        if let Some(slot) = lookup("HSM_SLOT") {
            config.hardware.slot = Some(parse_number("HSM_SLOT", &slot)?);
        }
        if let Some(pin) = lookup("HSM_PIN").filter(|p| !p.is_empty()) {
            config.hardware.pin = Some(SecretString::from(pin));
        }
        if let Some(label) = lookup("HSM_KEY_LABEL").filter(|l| !l.is_empty()) {
            config.hardware.key_label = label;
        }
        if let Some(v) = lookup("HSM_SCHEDULER_ENABLED") {
            config.scheduler.enabled = parse_bool("HSM_SCHEDULER_ENABLED", &v)?;
        }
        if let Some(v) = lookup("HSM_HEALTH_INTERVAL_SECS") {
            config.scheduler.health_interval_secs = parse_number("HSM_HEALTH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("HSM_BACKUP_INTERVAL_SECS") {
            config.scheduler.backup_interval_secs = parse_number("HSM_BACKUP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("HSM_CRYPTO_TIMEOUT_MS") {
            config.timeouts.crypto_ms = parse_number("HSM_CRYPTO_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("HSM_CONNECTION_TIMEOUT_MS") {
            config.timeouts.connection_ms = parse_number("HSM_CONNECTION_TIMEOUT_MS", &v)?;
        }
        if let Some(dir) = lookup("HSM_DATA_DIR").filter(|d| !d.is_empty()) {
            config.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("HSM_BACKUP_DIR").filter(|d| !d.is_empty()) {
            config.storage.backup_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that can never work.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.scheduler.enabled
            && (self.scheduler.health_interval_secs == 0 || self.scheduler.backup_interval_secs == 0)
        {
            return Err(ValidationError::InvalidConfig(
                "scheduler intervals must be positive".to_string(),
            ));
        }
        let t = &self.timeouts;
        if t.connection_ms == 0 || t.crypto_ms == 0 || t.key_generation_ms == 0 || t.health_probe_ms == 0 {
            return Err(ValidationError::InvalidConfig(
                "timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ValidationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ValidationError::InvalidConfig(format!(
            "{name} must be a boolean, got {other}"
        ))),
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T, ValidationError> {
    value.trim().parse().map_err(|_| {
        ValidationError::InvalidConfig(format!("{name} must be a number, got {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_simulated_and_lenient() {
        let config = HsmConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.provider, ProviderMode::Simulated);
        assert!(!config.strict);
        assert_eq!(config.hardware.key_label, "seal-hsm-key");
        assert_eq!(config.scheduler.health_interval(), Duration::from_secs(300));
    }

    #[test]
    fn reads_hardware_settings() {
        let config = HsmConfig::from_lookup(lookup(&[
            ("HSM_PROVIDER", "hardware"),
            ("HSM_STRICT", "true"),
            ("HSM_MODULE_PATH", "/usr/lib/softhsm/libsofthsm2.so"),
            ("HSM_SLOT", "1"),
            ("HSM_PIN", "1234"),
            ("HSM_KEY_LABEL", "records"),
        ]))
        .unwrap();

        assert_eq!(config.provider, ProviderMode::Hardware);
        assert!(config.strict);
        assert_eq!(config.hardware.slot, Some(1));
        assert_eq!(config.hardware.key_label, "records");
        assert_eq!(
            config.hardware.pin.as_ref().map(|p| p.expose_secret().to_string()),
            Some("1234".to_string())
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(HsmConfig::from_lookup(lookup(&[("HSM_PROVIDER", "cloud")])).is_err());
        assert!(HsmConfig::from_lookup(lookup(&[("HSM_STRICT", "maybe")])).is_err());
        assert!(HsmConfig::from_lookup(lookup(&[("HSM_SLOT", "first")])).is_err());
        assert!(HsmConfig::from_lookup(lookup(&[("HSM_CRYPTO_TIMEOUT_MS", "0")])).is_err());
    }

    #[test]
    fn pin_is_never_serialized() {
        let mut config = HsmConfig::default();
        config.hardware.pin = Some(SecretString::from("secret-pin".to_string()));
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret-pin"));
    }
}
