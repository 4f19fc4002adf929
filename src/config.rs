use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::activity::{DEFAULT_BOUNDED_MAX_EVENTS, DEFAULT_BOUNDED_TTL_MS, GhostRetention};

const CONFIG_SCHEMA_VERSION: u32 = 2;
const DEFAULT_POLL_MS: u64 = 750;
const DEFAULT_GRACE_MS: u64 = 10_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BASE_URL: &str = "http://localhost:5001";
pub const HOME_ENV: &str = "CASCADE_TELEMETRY_HOME";
pub const URL_ENV: &str = "CASCADE_TELEMETRY_URL";
pub const POLL_ENV: &str = "CASCADE_TELEMETRY_POLL_MS";
pub const GRACE_ENV: &str = "CASCADE_TELEMETRY_GRACE_MS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub schema_version: u32,
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub ghost_retention: GhostRetention,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            ghost_retention: GhostRetention::Unbounded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub ghost_retention: GhostRetention,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            grace_period: Duration::from_millis(DEFAULT_GRACE_MS),
            ghost_retention: GhostRetention::Unbounded,
        }
    }
}

impl SyncConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(path: &Path) -> Result<Self> {
        if !path.exists() {
            let cfg = SyncConfig::default();
            cfg.save_to(path)?;
            return Ok(cfg);
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut parsed: SyncConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;
        if parsed.normalize_and_migrate() {
            parsed.save_to(path)?;
        }
        Ok(parsed)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;

        let data = serde_json::to_string_pretty(self)?;
        let mut file = NamedTempFile::new_in(parent)
            .with_context(|| format!("failed to stage config in {}", parent.display()))?;
        file.write_all(data.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        file.persist(path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn effective_base_url(&self) -> String {
        env::var(URL_ENV)
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.base_url.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        let trimmed = self.base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            self.base_url = DEFAULT_BASE_URL.to_string();
            changed = true;
        } else if trimmed != self.base_url {
            self.base_url = trimmed.to_string();
            changed = true;
        }

        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = DEFAULT_REQUEST_TIMEOUT_MS;
            changed = true;
        }

        if let GhostRetention::Bounded { ttl_ms, max_events } = &mut self.ghost_retention {
            if *ttl_ms == 0 {
                *ttl_ms = DEFAULT_BOUNDED_TTL_MS;
                changed = true;
            }
            if *max_events == 0 {
                *max_events = DEFAULT_BOUNDED_MAX_EVENTS;
                changed = true;
            }
        }

        changed
    }
}

pub fn runtime_settings(config: &SyncConfig) -> SyncSettings {
    SyncSettings {
        poll_interval: Duration::from_millis(env_u64(POLL_ENV, DEFAULT_POLL_MS)),
        grace_period: Duration::from_millis(env_u64(GRACE_ENV, DEFAULT_GRACE_MS)),
        ghost_retention: config.ghost_retention,
    }
}

pub fn telemetry_home() -> PathBuf {
    if let Ok(custom) = env::var(HOME_ENV) {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cascade-telemetry")
}

pub fn config_path() -> PathBuf {
    telemetry_home().join("config.json")
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");

        let cfg = SyncConfig::load_or_init_at(&path).expect("load");

        assert_eq!(cfg, SyncConfig::default());
        assert!(path.exists());
        let reloaded = SyncConfig::load_or_init_at(&path).expect("reload");
        assert_eq!(reloaded, cfg);
    }

    #[test]
    fn migration_normalizes_old_files() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"schema_version": 1, "base_url": " http://engine:5001/ ",
                "ghost_retention": {"mode": "bounded", "ttl_ms": 0, "max_events": 0}}"#,
        )
        .expect("write");

        let cfg = SyncConfig::load_or_init_at(&path).expect("load");

        assert_eq!(cfg.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(cfg.base_url, "http://engine:5001");
        assert_eq!(cfg.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert_eq!(cfg.ghost_retention, GhostRetention::bounded_default());
        let on_disk = fs::read_to_string(&path).expect("read");
        assert!(on_disk.contains("\"schema_version\": 2"));
    }

    #[test]
    fn invalid_json_is_reported_with_path() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");

        let err = SyncConfig::load_or_init_at(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("invalid JSON"));
    }

    #[test]
    fn retention_defaults_to_unbounded() {
        let cfg: SyncConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(cfg.ghost_retention, GhostRetention::Unbounded);
        assert_eq!(runtime_settings(&cfg).ghost_retention, GhostRetention::Unbounded);
    }

    #[test]
    fn default_settings_poll_every_750ms_with_10s_grace() {
        let settings = SyncSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_millis(750));
        assert_eq!(settings.grace_period, Duration::from_millis(10_000));
        assert_eq!(settings.ghost_retention, GhostRetention::Unbounded);
    }

    #[test]
    fn request_timeout_is_in_millis() {
        let cfg = SyncConfig {
            request_timeout_ms: 1_500,
            ..SyncConfig::default()
        };
        assert_eq!(cfg.request_timeout(), Duration::from_millis(1_500));
    }
}
