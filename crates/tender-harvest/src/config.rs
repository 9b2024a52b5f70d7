//! Engine configuration and target definitions.
//!
//! [`HarvestConfig`] starts from compiled defaults and is overridden by
//! `HARVEST_*` environment variables; the CLI applies its flags last.
//! [`TargetConfig`] is read from a JSON file per target.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup::BackupPolicy;
use crate::coordinator::CoordinatorConfig;
use crate::delta::VerifyMode;
use crate::error::{HarvestError, HarvestResult};
use crate::types::WorkUnit;

const DEFAULT_CHECKPOINT_SECS: u64 = 120;
const DEFAULT_INTERACTION_TIMEOUT_SECS: u64 = 90;
const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 60;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WATCHDOG_TICK_MS: u64 = 2_000;
const DEFAULT_MAX_UNIT_ATTEMPTS: u32 = 3;
const DEFAULT_CONCURRENCY: usize = 3;

const DB_FILE: &str = "harvest.sqlite3";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub data_dir: PathBuf,
    /// Checkpoint timer period.
    pub checkpoint_interval: Duration,
    pub interaction_timeout: Duration,
    pub launch_timeout: Duration,
    /// Silence after which a busy worker counts as stalled.
    pub stall_timeout: Duration,
    pub watchdog_tick: Duration,
    /// Attempts per unit, stall re-queues included.
    pub max_unit_attempts: u32,
    pub max_session_reacquisitions: u32,
    pub default_concurrency: usize,
    pub verify_mode: VerifyMode,
    pub backups_enabled: bool,
    pub backup_policy: BackupPolicy,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            checkpoint_interval: Duration::from_secs(DEFAULT_CHECKPOINT_SECS),
            interaction_timeout: Duration::from_secs(DEFAULT_INTERACTION_TIMEOUT_SECS),
            launch_timeout: Duration::from_secs(DEFAULT_LAUNCH_TIMEOUT_SECS),
            stall_timeout: Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECS),
            watchdog_tick: Duration::from_millis(DEFAULT_WATCHDOG_TICK_MS),
            max_unit_attempts: DEFAULT_MAX_UNIT_ATTEMPTS,
            max_session_reacquisitions: 1,
            default_concurrency: DEFAULT_CONCURRENCY,
            verify_mode: VerifyMode::None,
            backups_enabled: true,
            backup_policy: BackupPolicy::default(),
        }
    }
}

impl HarvestConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        let d = Self::default();
        let verify_mode = read_env_string("HARVEST_VERIFY_MODE")
            .and_then(|raw| {
                let parsed = VerifyMode::parse(&raw);
                if parsed.is_none() {
                    tracing::warn!("ignoring HARVEST_VERIFY_MODE={raw:?}");
                }
                parsed
            })
            .unwrap_or(d.verify_mode);

        Self {
            data_dir: resolve_data_dir(None),
            checkpoint_interval: Duration::from_secs(
                read_env_u64("HARVEST_CHECKPOINT_SECS", DEFAULT_CHECKPOINT_SECS).max(1),
            ),
            interaction_timeout: Duration::from_secs(
                read_env_u64("HARVEST_INTERACTION_TIMEOUT_SECS", DEFAULT_INTERACTION_TIMEOUT_SECS)
                    .max(1),
            ),
            launch_timeout: Duration::from_secs(
                read_env_u64("HARVEST_LAUNCH_TIMEOUT_SECS", DEFAULT_LAUNCH_TIMEOUT_SECS).max(1),
            ),
            stall_timeout: Duration::from_secs(
                read_env_u64("HARVEST_STALL_TIMEOUT_SECS", DEFAULT_STALL_TIMEOUT_SECS).max(1),
            ),
            watchdog_tick: Duration::from_millis(
                read_env_u64("HARVEST_WATCHDOG_TICK_MS", DEFAULT_WATCHDOG_TICK_MS).max(10),
            ),
            max_unit_attempts: read_env_u32("HARVEST_MAX_UNIT_ATTEMPTS", DEFAULT_MAX_UNIT_ATTEMPTS)
                .max(1),
            max_session_reacquisitions: read_env_u32(
                "HARVEST_MAX_SESSION_REACQUISITIONS",
                d.max_session_reacquisitions,
            ),
            default_concurrency: read_env_usize("HARVEST_CONCURRENCY", DEFAULT_CONCURRENCY).max(1),
            verify_mode,
            backups_enabled: read_env_string("HARVEST_BACKUPS")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "off" | "false"))
                .unwrap_or(true),
            backup_policy: BackupPolicy::with_daily_days(read_env_u32(
                "HARVEST_BACKUP_DAILY_DAYS",
                d.backup_policy.daily_days,
            )),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            interaction_timeout: self.interaction_timeout,
            launch_timeout: self.launch_timeout,
            max_reacquisitions: self.max_session_reacquisitions,
        }
    }

    pub fn validate(&self) -> HarvestResult<()> {
        if self.checkpoint_interval.is_zero() {
            return Err(HarvestError::InvalidConfig("checkpoint interval must be positive".into()));
        }
        if self.stall_timeout.is_zero() || self.watchdog_tick.is_zero() {
            return Err(HarvestError::InvalidConfig("watchdog timings must be positive".into()));
        }
        if self.max_unit_attempts == 0 {
            return Err(HarvestError::InvalidConfig("max_unit_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// One harvesting target as read from its JSON definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    /// Layout family used to pick the extraction adapter.
    pub layout: String,
    #[serde(default)]
    pub units: Vec<WorkUnit>,
    /// Family-specific settings, interpreted by the adapter.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl TargetConfig {
    pub fn load(path: &Path) -> HarvestResult<Self> {
        let bytes = std::fs::read(path)?;
        let cfg: Self = serde_json::from_slice(&bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> HarvestResult<()> {
        if self.name.trim().is_empty() {
            return Err(HarvestError::InvalidConfig("target name is empty".into()));
        }
        if self.layout.trim().is_empty() {
            return Err(HarvestError::InvalidConfig(format!(
                "target {:?} has no layout family",
                self.name
            )));
        }
        if let Some(unit) = self.units.iter().find(|u| u.name.trim().is_empty()) {
            return Err(HarvestError::InvalidConfig(format!(
                "target {:?} has a unit without a name ({:?})",
                self.name, unit.url
            )));
        }
        Ok(())
    }
}

/// Resolve the data directory: explicit, then `HARVEST_DATA_DIR`, then a
/// `.tender-harvest` directory in the working directory, then the home
/// default.
pub fn resolve_data_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    if let Some(env_dir) = read_env_string("HARVEST_DATA_DIR") {
        if !env_dir.is_empty() {
            return PathBuf::from(env_dir);
        }
    }

    let cwd_dir = PathBuf::from(".tender-harvest");
    if cwd_dir.is_dir() {
        return cwd_dir;
    }

    default_data_dir()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tender-harvest")
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = HarvestConfig::default().with_data_dir("/tmp/h");
        assert_eq!(cfg.checkpoint_interval, Duration::from_secs(120));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/h/harvest.sqlite3"));
        assert_eq!(cfg.checkpoint_dir(), PathBuf::from("/tmp/h/checkpoints"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let dir = resolve_data_dir(Some(Path::new("/srv/harvest")));
        assert_eq!(dir, PathBuf::from("/srv/harvest"));
    }

    #[test]
    fn test_target_config_parses_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kpwd.json");
        std::fs::write(
            &path,
            r#"{
                "name": "Kerala PWD",
                "layout": "script",
                "units": [{"name": "Roads", "url": "https://example.org/roads"}, {"name": "Bridges"}],
                "options": {"script": "[]"}
            }"#,
        )
        .unwrap();

        let cfg = TargetConfig::load(&path).unwrap();
        assert_eq!(cfg.units.len(), 2);
        assert_eq!(cfg.units[1].url, None);
        assert_eq!(cfg.options["script"], "[]");

        std::fs::write(&path, r#"{"name": " ", "layout": "script"}"#).unwrap();
        assert!(matches!(
            TargetConfig::load(&path),
            Err(HarvestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let cfg = HarvestConfig {
            max_unit_attempts: 0,
            ..HarvestConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
