use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UnreadError};

/// Environment override for [`CompactionConfig::workers`].
pub const WORKERS_ENV: &str = "UNREAD_COMPACTION_WORKERS";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Distance between the oldest unread read key and the new baseline.
    /// Must match the precision of the host's read-key column.
    #[serde(default = "default_baseline_gap_us")]
    pub baseline_gap_us: i64,
    /// Worker threads for path-based compaction runs.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            baseline_gap_us: default_baseline_gap_us(),
            workers: default_workers(),
        }
    }
}

impl UnreadConfig {
    /// Reject values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`UnreadError::Config`] when a field is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.compaction.baseline_gap_us < 1 {
            return Err(UnreadError::Config(
                "compaction.baseline_gap_us must be >= 1".to_string(),
            ));
        }
        if self.compaction.workers == 0 {
            return Err(UnreadError::Config(
                "compaction.workers must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load config from an explicit file, falling back to defaults when absent.
///
/// # Errors
///
/// Returns [`UnreadError::Config`] when the file exists but cannot be read,
/// parsed, or validated.
pub fn load_config(path: &Path) -> Result<UnreadConfig> {
    let mut config = read_config_file(path).map_err(|e| UnreadError::Config(format!("{e:#}")))?;
    apply_env_overrides(&mut config, env::var(WORKERS_ENV).ok())?;
    config.validate()?;
    Ok(config)
}

/// Load `unread/config.toml` from the user's config directory.
///
/// # Errors
///
/// See [`load_config`].
pub fn load_user_config() -> Result<UnreadConfig> {
    match user_config_path() {
        Some(path) => load_config(&path),
        None => {
            let mut config = UnreadConfig::default();
            apply_env_overrides(&mut config, env::var(WORKERS_ENV).ok())?;
            config.validate()?;
            Ok(config)
        }
    }
}

#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("unread/config.toml"))
}

fn read_config_file(path: &Path) -> anyhow::Result<UnreadConfig> {
    if !path.exists() {
        return Ok(UnreadConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<UnreadConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn apply_env_overrides(config: &mut UnreadConfig, workers: Option<String>) -> Result<()> {
    if let Some(raw) = workers {
        config.compaction.workers = raw.trim().parse().map_err(|_| {
            UnreadError::Config(format!("{WORKERS_ENV} must be a positive integer, got '{raw}'"))
        })?;
    }
    Ok(())
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_baseline_gap_us() -> i64 {
    1
}

const fn default_workers() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = read_config_file(&dir.path().join("config.toml")).expect("load defaults");
        assert_eq!(cfg, UnreadConfig::default());
        assert_eq!(cfg.store.busy_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.compaction.baseline_gap_us, 1);
        assert_eq!(cfg.compaction.workers, 1);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[compaction]\nbaseline_gap_us = 1000\n").expect("write");

        let cfg = read_config_file(&path).expect("parse");
        assert_eq!(cfg.compaction.baseline_gap_us, 1_000);
        assert_eq!(cfg.compaction.workers, 1);
        assert_eq!(cfg.store.busy_timeout_ms, 5_000);
    }

    #[test]
    fn malformed_config_is_a_config_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[compaction\nworkers = ").expect("write");

        let err = load_config(&path).expect_err("must fail");
        assert!(matches!(err, UnreadError::Config(_)));
    }

    #[test]
    fn zero_gap_is_rejected() {
        let mut cfg = UnreadConfig::default();
        cfg.compaction.baseline_gap_us = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_override_sets_workers() {
        let mut cfg = UnreadConfig::default();
        apply_env_overrides(&mut cfg, Some(" 4 ".to_string())).expect("override");
        assert_eq!(cfg.compaction.workers, 4);

        let err = apply_env_overrides(&mut cfg, Some("many".to_string())).expect_err("bad value");
        assert!(err.to_string().contains(WORKERS_ENV));
    }
}
