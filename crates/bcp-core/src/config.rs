//! Engine configuration.
//!
//! All timings are stored as integer milliseconds so the TOML stays
//! readable. The defaults are the production values.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::dispatch::RetryPolicy;

/// Authentication coprocessor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipVariant {
    #[default]
    Roswell,
    Veridian,
}

impl ChipVariant {
    /// Whether register keys are printed in logs unless overridden.
    pub fn displays_keys_by_default(self) -> bool {
        matches!(self, ChipVariant::Roswell)
    }

    /// Whether the gauge exposes a controller reset counter.
    pub fn tracks_controller_resets(self) -> bool {
        matches!(self, ChipVariant::Roswell)
    }
}

impl std::fmt::Display for ChipVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChipVariant::Roswell => write!(f, "Roswell"),
            ChipVariant::Veridian => write!(f, "Veridian"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub chip: ChipVariant,
    /// Publish trust verdicts and nonces at all.
    pub trusted_data_enabled: bool,
    /// Treat every signature exchange as passed (development override).
    pub force_trust: bool,
    /// Override key masking in logs; `None` follows the chip default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_keys: Option<bool>,
    pub completion_timeout_ms: u64,
    pub command_attempts: u32,
    pub command_retry_delay_ms: u64,
    pub challenge_settle_ms: u64,
    pub status_poll_interval_ms: u64,
    pub status_poll_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            chip: ChipVariant::Roswell,
            trusted_data_enabled: true,
            force_trust: false,
            display_keys: None,
            completion_timeout_ms: 5_000,
            command_attempts: 5,
            command_retry_delay_ms: 700,
            challenge_settle_ms: 550,
            status_poll_interval_ms: 3_000,
            status_poll_timeout_ms: 20_000,
        }
    }
}

impl AuthConfig {
    pub fn show_keys(&self) -> bool {
        self.display_keys
            .unwrap_or_else(|| self.chip.displays_keys_by_default())
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn command_retry_delay(&self) -> Duration {
        Duration::from_millis(self.command_retry_delay_ms)
    }

    pub fn challenge_settle(&self) -> Duration {
        Duration::from_millis(self.challenge_settle_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    /// Number of Veridian status polls, rounding the timeout up.
    pub fn status_poll_iterations(&self) -> u64 {
        self.status_poll_timeout_ms
            .div_ceil(self.status_poll_interval_ms.max(1))
    }
}

/// Typical duration, overall timeout and retry interval for one updater step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollProfile {
    pub typical_ms: u64,
    pub timeout_ms: u64,
    pub retry_ms: u64,
}

impl PollProfile {
    pub const fn new(typical_ms: u64, timeout_ms: u64, retry_ms: u64) -> Self {
        Self {
            typical_ms,
            timeout_ms,
            retry_ms,
        }
    }

    pub fn typical(&self) -> Duration {
        Duration::from_millis(self.typical_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    /// Extra polls allowed after the first one.
    pub fn max_retries(&self) -> u64 {
        self.timeout_ms / self.retry_ms.max(1) + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Print register keys in logs instead of masking them.
    pub display_keys: bool,
    pub completion_timeout_ms: u64,
    pub init: PollProfile,
    pub pre_write: PollProfile,
    pub start_firmware: PollProfile,
    pub start_image: PollProfile,
    pub write_length: PollProfile,
    pub data_chunk: PollProfile,
    pub signature: PollProfile,
    pub finish_dnvd: PollProfile,
    pub finish_config: PollProfile,
    pub finish_firmware: PollProfile,
    pub start_crypto: PollProfile,
    pub commit: PollProfile,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            display_keys: true,
            completion_timeout_ms: 10_000,
            init: PollProfile::new(40, 1_500, 70),
            pre_write: PollProfile::new(0, 2_800, 700),
            start_firmware: PollProfile::new(220, 1_500, 700),
            start_image: PollProfile::new(40, 1_000, 70),
            write_length: PollProfile::new(15, 700, 100),
            data_chunk: PollProfile::new(15, 700, 70),
            signature: PollProfile::new(0, 700, 80),
            finish_dnvd: PollProfile::new(500, 2_000, 700),
            finish_config: PollProfile::new(1_500, 10_000, 700),
            finish_firmware: PollProfile::new(3_000, 16_000, 1_000),
            start_crypto: PollProfile::new(12_000, 27_000, 5_000),
            commit: PollProfile::new(3_000, 7_000, 100),
        }
    }
}

impl UpdateConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub auth: AuthConfig,
    pub update: UpdateConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
impl EngineConfig {
    /// Millisecond-scale timings for driving the engine against `MockBus`.
    pub(crate) fn fast() -> Self {
        let quick = PollProfile::new(0, 10, 1);
        Self {
            retry: RetryPolicy::immediate(5),
            auth: AuthConfig {
                completion_timeout_ms: 30,
                command_retry_delay_ms: 1,
                challenge_settle_ms: 1,
                status_poll_interval_ms: 1,
                status_poll_timeout_ms: 5,
                ..AuthConfig::default()
            },
            update: UpdateConfig {
                display_keys: true,
                completion_timeout_ms: 30,
                init: quick,
                pre_write: quick,
                start_firmware: quick,
                start_image: quick,
                write_length: quick,
                data_chunk: quick,
                signature: quick,
                finish_dnvd: quick,
                finish_config: quick,
                finish_firmware: quick,
                start_crypto: quick,
                commit: quick,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_production_timings() {
        let config = EngineConfig::default();
        assert_eq!(config.auth.completion_timeout(), Duration::from_secs(5));
        assert_eq!(config.auth.status_poll_iterations(), 7);
        assert_eq!(config.update.completion_timeout(), Duration::from_secs(10));
        assert_eq!(config.update.start_crypto.timeout_ms, 27_000);
        assert_eq!(config.update.pre_write.max_retries(), 5);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_key_display_follows_chip() {
        let mut auth = AuthConfig::default();
        assert!(auth.show_keys());
        auth.chip = ChipVariant::Veridian;
        assert!(!auth.show_keys());
        auth.display_keys = Some(true);
        assert!(auth.show_keys());
    }

    #[test]
    fn test_update_key_display_is_independent_of_chip() {
        let mut config = EngineConfig::default();
        config.auth.chip = ChipVariant::Veridian;
        assert!(!config.auth.show_keys());
        assert!(config.update.display_keys);

        let config: EngineConfig = toml::from_str("[update]\ndisplay_keys = false\n").unwrap();
        assert!(!config.update.display_keys);
        assert!(config.auth.show_keys());
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let mut config = EngineConfig::default();
        config.auth.chip = ChipVariant::Veridian;
        config.auth.force_trust = true;
        config.update.commit = PollProfile::new(1, 2, 3);

        let path = std::env::temp_dir().join(format!("bcp-config-{}.toml", std::process::id()));
        config.save_to_file(&path).unwrap();
        let loaded = EngineConfig::load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("[auth]\nchip = \"veridian\"\n").unwrap();
        assert_eq!(config.auth.chip, ChipVariant::Veridian);
        assert_eq!(config.auth.challenge_settle_ms, 550);
        assert_eq!(config.update, UpdateConfig::default());
    }
}
