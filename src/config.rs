use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::storage;

/// Main time bank configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeBankConfig {
    /// Directory holding the ledger, session, and queue state files
    #[serde(default = "storage::default_data_dir")]
    pub data_dir: PathBuf,

    /// Bounded wait when acquiring a user's balance lock (seconds)
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,

    /// Smallest session a user may purchase (minutes)
    #[serde(default = "default_min_session_minutes")]
    pub min_session_minutes: u32,

    /// Largest session a user may purchase (minutes)
    #[serde(default = "default_max_session_minutes")]
    pub max_session_minutes: u32,

    /// How many times a failed offline entry may be re-opened for replay
    #[serde(default = "default_max_replay_retries")]
    pub max_replay_retries: u32,
}

fn default_lock_wait_secs() -> u64 {
    5
}

fn default_min_session_minutes() -> u32 {
    1
}

fn default_max_session_minutes() -> u32 {
    480
}

fn default_max_replay_retries() -> u32 {
    3
}

impl Default for TimeBankConfig {
    fn default() -> Self {
        Self {
            data_dir: storage::default_data_dir(),
            lock_wait_secs: default_lock_wait_secs(),
            min_session_minutes: default_min_session_minutes(),
            max_session_minutes: default_max_session_minutes(),
            max_replay_retries: default_max_replay_retries(),
        }
    }
}

/// Load configuration from YAML file
pub fn load_config(path: &Path) -> Result<TimeBankConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: TimeBankConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))?;

    validate_config(&config)?;

    Ok(config)
}

/// Save configuration to YAML file
pub fn save_config(path: &Path, config: &TimeBankConfig) -> Result<()> {
    validate_config(config)?;

    let content = serde_yaml::to_string(config)
        .context("Failed to serialize config to YAML")?;

    storage::atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &TimeBankConfig) -> Result<()> {
    if config.lock_wait_secs == 0 {
        anyhow::bail!("lock_wait_secs must be at least 1 second");
    }

    if config.min_session_minutes == 0 {
        anyhow::bail!("min_session_minutes must be at least 1");
    }

    if config.min_session_minutes > config.max_session_minutes {
        anyhow::bail!(
            "min_session_minutes ({}) exceeds max_session_minutes ({})",
            config.min_session_minutes,
            config.max_session_minutes
        );
    }

    // 8-hour ceiling on a single unlock
    if config.max_session_minutes > 480 {
        anyhow::bail!(
            "max_session_minutes must not exceed 480, got {}",
            config.max_session_minutes
        );
    }

    Ok(())
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = include_str!("../example-config.yaml");

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = TimeBankConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.lock_wait_secs, 5);
        assert_eq!(config.max_session_minutes, 480);
        assert_eq!(config.max_replay_retries, 3);
    }

    #[test]
    fn test_example_config_parses() {
        let config: TimeBankConfig = serde_yaml::from_str(EXAMPLE_CONFIG).unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: TimeBankConfig = serde_yaml::from_str("lock_wait_secs: 2\n").unwrap();
        assert_eq!(config.lock_wait_secs, 2);
        assert_eq!(config.min_session_minutes, 1);
        assert_eq!(config.max_session_minutes, 480);
    }

    #[test]
    fn test_validate_rejects_zero_lock_wait() {
        let config = TimeBankConfig {
            lock_wait_secs: 0,
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_min_session() {
        let config = TimeBankConfig {
            min_session_minutes: 0,
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_session_bounds() {
        let config = TimeBankConfig {
            min_session_minutes: 60,
            max_session_minutes: 30,
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_session_above_ceiling() {
        let config = TimeBankConfig {
            max_session_minutes: 481,
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let config = TimeBankConfig {
            data_dir: temp_dir.path().join("data"),
            lock_wait_secs: 2,
            max_replay_retries: 5,
            ..Default::default()
        };

        save_config(&config_path, &config).unwrap();
        let loaded = load_config(&config_path).unwrap();

        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.lock_wait_secs, 2);
        assert_eq!(loaded.max_replay_retries, 5);
    }
}
