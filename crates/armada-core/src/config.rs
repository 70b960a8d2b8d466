//! Configuration resolution for Armada.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/armada/settings.json)
//! 3. Project config (.armada/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Armada configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            pool: PoolSettings::default(),
            cache: CacheSettings::default(),
            log_level: default_log_level(),
        }
    }
}

/// Wave planning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Items whose priority ordinal is at or below this are high-priority
    /// (0 = critical, 1 = high).
    pub high_priority_threshold: u8,
    /// A wave with more distinct owner tags than this is flagged.
    pub contention_owner_limit: usize,
    /// Per-owner activation delay suggested when contention is flagged.
    pub stagger_delay_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            high_priority_threshold: 1,
            contention_owner_limit: 3,
            stagger_delay_ms: 2000,
        }
    }
}

/// Size bounds for one worker type's warm queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizing {
    pub base_size: usize,
    pub min_size: usize,
    pub max_size: usize,
}

impl PoolSizing {
    fn validate(&self, label: &str) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config(format!("{label}: max_size must be at least 1")));
        }
        if self.min_size > self.base_size || self.base_size > self.max_size {
            return Err(Error::Config(format!(
                "{label}: expected min_size <= base_size <= max_size, got {} / {} / {}",
                self.min_size, self.base_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub base_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Grace period before the background warm-up pass.
    pub warmup_delay_ms: u64,
    /// Number of allocation latency samples kept for the rolling average.
    pub stats_window: usize,
    /// Per-type overrides of the default sizing.
    pub types: HashMap<String, PoolSizing>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            base_size: 2,
            min_size: 1,
            max_size: 4,
            warmup_delay_ms: 1000,
            stats_window: 100,
            types: HashMap::new(),
        }
    }
}

impl PoolSettings {
    /// Default sizing applied to types without an override.
    pub const fn default_sizing(&self) -> PoolSizing {
        PoolSizing {
            base_size: self.base_size,
            min_size: self.min_size,
            max_size: self.max_size,
        }
    }
}

/// Context cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 5 * 60,
            sweep_interval_secs: 60,
            max_entries: 10_000,
        }
    }
}

impl Config {
    /// Reject settings the orchestration services cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.pool.default_sizing().validate("pool")?;
        for (worker_type, sizing) in &self.pool.types {
            sizing.validate(&format!("pool.types.{worker_type}"))?;
        }
        if self.pool.stats_window == 0 {
            return Err(Error::Config("pool.stats_window must be at least 1".into()));
        }
        if self.cache.ttl_secs == 0 {
            return Err(Error::Config("cache.ttl_secs must be at least 1".into()));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "cache.sweep_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_config(&mut config, read_overlay(&global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".armada").join("settings.json");
        if project_path.exists() {
            merge_config(&mut config, read_overlay(&project_path)?);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Load a single explicit config file on top of the defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let mut config = Config::default();
    merge_config(&mut config, read_overlay(path)?);
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".armada").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/armada/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("armada").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// A partially specified config file. Absent keys leave the base untouched.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    scheduler: Option<SchedulerSettings>,
    pool: Option<PoolOverlay>,
    cache: Option<CacheSettings>,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PoolOverlay {
    base_size: Option<usize>,
    min_size: Option<usize>,
    max_size: Option<usize>,
    warmup_delay_ms: Option<u64>,
    stats_window: Option<usize>,
    #[serde(default)]
    types: HashMap<String, PoolSizing>,
}

fn read_overlay(path: &Path) -> Result<ConfigOverlay> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| Error::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}

fn merge_config(base: &mut Config, overlay: ConfigOverlay) {
    if let Some(scheduler) = overlay.scheduler {
        base.scheduler = scheduler;
    }
    if let Some(cache) = overlay.cache {
        base.cache = cache;
    }
    if let Some(level) = overlay.log_level {
        base.log_level = level;
    }

    if let Some(pool) = overlay.pool {
        if let Some(n) = pool.base_size {
            base.pool.base_size = n;
        }
        if let Some(n) = pool.min_size {
            base.pool.min_size = n;
        }
        if let Some(n) = pool.max_size {
            base.pool.max_size = n;
        }
        if let Some(ms) = pool.warmup_delay_ms {
            base.pool.warmup_delay_ms = ms;
        }
        if let Some(n) = pool.stats_window {
            base.pool.stats_window = n;
        }
        base.pool.types.extend(pool.types);
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("ARMADA_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(n) = lookup("ARMADA_POOL_BASE_SIZE").and_then(|v| v.parse().ok()) {
        config.pool.base_size = n;
    }
    if let Some(n) = lookup("ARMADA_POOL_MAX_SIZE").and_then(|v| v.parse().ok()) {
        config.pool.max_size = n;
    }
    if let Some(n) = lookup("ARMADA_CACHE_TTL_SECS").and_then(|v| v.parse().ok()) {
        config.cache.ttl_secs = n;
    }
    if let Some(n) = lookup("ARMADA_HIGH_PRIORITY_THRESHOLD").and_then(|v| v.parse().ok()) {
        config.scheduler.high_priority_threshold = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.cache.sweep_interval_secs, 60);
        assert_eq!(config.pool.stats_window, 100);
        assert_eq!(config.scheduler.contention_owner_limit, 3);
    }

    #[test]
    fn project_file_overrides_only_given_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"pool": {"max_size": 8, "types": {"reviewer": {"base_size": 1, "min_size": 0, "max_size": 2}}}}"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.pool.max_size, 8);
        assert_eq!(config.pool.base_size, 2);
        assert_eq!(config.pool.types["reviewer"].max_size, 2);
        assert_eq!(config.cache.ttl_secs, 300);
    }

    #[test]
    fn project_dir_layout_is_discovered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".armada")).unwrap();
        std::fs::write(
            dir.path().join(".armada").join("settings.json"),
            r#"{"cache": {"ttl_secs": 5, "sweep_interval_secs": 1, "max_entries": 10}}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.cache.ttl_secs, 5);
        assert_eq!(config.cache.max_entries, 10);
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }), "unexpected error: {err}");
        assert!(err.to_string().contains("settings.json"), "unexpected error: {err}");
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| match key {
            "ARMADA_POOL_MAX_SIZE" => Some("9".into()),
            "ARMADA_CACHE_TTL_SECS" => Some("not-a-number".into()),
            "ARMADA_LOG_LEVEL" => Some("debug".into()),
            _ => None,
        });
        assert_eq!(config.pool.max_size, 9);
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn validate_rejects_inverted_sizing() {
        let mut config = Config::default();
        config.pool.min_size = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.types.insert(
            "builder".into(),
            PoolSizing {
                base_size: 5,
                min_size: 1,
                max_size: 2,
            },
        );
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("pool.types.builder"), "unexpected error: {err}");
    }

    #[test]
    fn validate_rejects_zero_ttl() {
        let mut config = Config::default();
        config.cache.ttl_secs = 0;
        assert!(config.validate().is_err());
    }
}
