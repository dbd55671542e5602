// chat-archiver/crates/chat-archiver/src/config.rs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::retry::RetryPolicy;
use crate::target::Target;

/// Fully resolved behaviour for one run. Snapshotted into the run record and
/// never changed while the run is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviourConfig {
    pub download_media: bool,
    pub check_admin_log: bool,
    pub follow_live: bool,
    pub archive_history: bool,
    pub msg_history_overlap_days: u32,
    pub recheck_media: bool,
}

impl Default for BehaviourConfig {
    fn default() -> Self {
        Self {
            download_media: true,
            check_admin_log: true,
            follow_live: false,
            archive_history: true,
            msg_history_overlap_days: 2,
            recheck_media: false,
        }
    }
}

/// Partial behaviour, as written in settings files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviourOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_media: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_admin_log: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_live: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_history: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_history_overlap_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recheck_media: Option<bool>,
}

impl BehaviourOverrides {
    /// Values set here win; anything unset falls through to `fallback`.
    pub fn merge(&self, fallback: &BehaviourOverrides) -> BehaviourOverrides {
        BehaviourOverrides {
            download_media: self.download_media.or(fallback.download_media),
            check_admin_log: self.check_admin_log.or(fallback.check_admin_log),
            follow_live: self.follow_live.or(fallback.follow_live),
            archive_history: self.archive_history.or(fallback.archive_history),
            msg_history_overlap_days: self.msg_history_overlap_days.or(fallback.msg_history_overlap_days),
            recheck_media: self.recheck_media.or(fallback.recheck_media),
        }
    }

    pub fn resolve(&self, base: &BehaviourConfig) -> BehaviourConfig {
        BehaviourConfig {
            download_media: self.download_media.unwrap_or(base.download_media),
            check_admin_log: self.check_admin_log.unwrap_or(base.check_admin_log),
            follow_live: self.follow_live.unwrap_or(base.follow_live),
            archive_history: self.archive_history.unwrap_or(base.archive_history),
            msg_history_overlap_days: self.msg_history_overlap_days.unwrap_or(base.msg_history_overlap_days),
            recheck_media: self.recheck_media.unwrap_or(base.recheck_media),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSettings {
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<bool>,
    #[serde(default)]
    pub behaviour: BehaviourOverrides,
}

/// Which targets to archive and how, loaded from `archive_settings.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveSettings {
    #[serde(default)]
    pub default_archive: bool,
    #[serde(default)]
    pub default_behaviour: BehaviourOverrides,
    #[serde(default)]
    pub targets: Vec<TargetSettings>,
}

impl ArchiveSettings {
    /// A missing file means "archive nothing unless asked".
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Settings file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write settings file {}", path.display()))
    }

    fn entry(&self, target: &Target) -> Option<&TargetSettings> {
        self.targets.iter().find(|t| t.target == *target)
    }

    /// Target override, then settings default, then built-in default.
    pub fn behaviour_for(&self, target: &Target) -> BehaviourConfig {
        let target_overrides = self.entry(target).map(|t| t.behaviour.clone()).unwrap_or_default();
        target_overrides
            .merge(&self.default_behaviour)
            .resolve(&BehaviourConfig::default())
    }

    pub fn should_archive(&self, target: &Target) -> bool {
        self.entry(target).and_then(|t| t.archive).unwrap_or(self.default_archive)
    }

    /// Targets to run, in a stable order: every known dialog the settings
    /// select, plus explicitly enabled targets not among the dialogs.
    pub fn targets_to_archive(&self, known: &[Target]) -> Vec<Target> {
        let mut selected: Vec<Target> = known.iter().copied().filter(|t| self.should_archive(t)).collect();
        for entry in &self.targets {
            if entry.archive == Some(true) && !selected.contains(&entry.target) {
                selected.push(entry.target);
            }
        }
        selected.sort();
        selected.dedup();
        selected
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_root: PathBuf,
    pub settings_path: PathBuf,
    pub max_concurrent_targets: usize,
    pub history_page_size: usize,
    pub worker_idle_poll_ms: u64,
    pub live_poll_ms: u64,
    pub run_record_save_secs: u64,
    pub db_pool_size: u32,
    pub retry: RetryPolicy,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("store"),
            settings_path: PathBuf::from("archive_settings.json"),
            max_concurrent_targets: 4,
            history_page_size: 100,
            worker_idle_poll_ms: 100,
            live_poll_ms: 5000,
            run_record_save_secs: 180,
            db_pool_size: 8,
            retry: RetryPolicy::default(),
            metrics_port: None,
        }
    }
}

/// Parses `name` from the environment, or returns `default` when it is unset
/// or blank.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, value)),
        _ => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        let defaults = Config::default();

        let store_root = env::var("ARCHIVE_STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.store_root);
        let settings_path = env::var("ARCHIVE_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or(defaults.settings_path);
        let max_concurrent_targets = env_or("MAX_CONCURRENT_TARGETS", defaults.max_concurrent_targets)?;
        let history_page_size = env_or("HISTORY_PAGE_SIZE", defaults.history_page_size)?;
        let worker_idle_poll_ms = env_or("WORKER_IDLE_POLL_MS", defaults.worker_idle_poll_ms)?;
        let live_poll_ms = env_or("LIVE_POLL_MS", defaults.live_poll_ms)?;
        let run_record_save_secs = env_or("RUN_RECORD_SAVE_SECS", defaults.run_record_save_secs)?;
        let db_pool_size = env_or("DB_POOL_SIZE", defaults.db_pool_size)?;
        let retry = RetryPolicy {
            max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: Duration::from_millis(env_or(
                "RETRY_BASE_DELAY_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(env_or(
                "RETRY_MAX_DELAY_MS",
                defaults.retry.max_delay.as_millis() as u64,
            )?),
        };
        let metrics_port = match env::var("METRICS_PORT") {
            Ok(port) if !port.trim().is_empty() => Some(port.trim().parse().context("METRICS_PORT must be a port number")?),
            _ => None,
        };

        let config = Self {
            store_root,
            settings_path,
            max_concurrent_targets,
            history_page_size,
            worker_idle_poll_ms,
            live_poll_ms,
            run_record_save_secs,
            db_pool_size,
            retry,
            metrics_port,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_targets == 0 {
            anyhow::bail!("MAX_CONCURRENT_TARGETS must be at least 1");
        }
        if self.history_page_size == 0 {
            anyhow::bail!("HISTORY_PAGE_SIZE must be at least 1");
        }
        if self.db_pool_size == 0 {
            anyhow::bail!("DB_POOL_SIZE must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }
        Ok(())
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Store: {}", self.store_root.display());
        info!("- Settings: {}", self.settings_path.display());
        info!("- Max Concurrent Targets: {}", self.max_concurrent_targets);
        info!("- History Page Size: {}", self.history_page_size);
        info!("- Worker Idle Poll: {}ms", self.worker_idle_poll_ms);
        info!("- Live Poll: {}ms", self.live_poll_ms);
        info!("- Run Record Save Interval: {}s", self.run_record_save_secs);
        info!("- DB Pool Size: {}", self.db_pool_size);
        info!(
            "- Retry: {} attempts, {:?} base, {:?} max",
            self.retry.max_attempts, self.retry.base_delay, self.retry.max_delay
        );
        match self.metrics_port {
            Some(port) => info!("- Metrics Port: {}", port),
            None => info!("- Metrics: disabled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ArchiveSettings {
        ArchiveSettings {
            default_archive: false,
            default_behaviour: BehaviourOverrides {
                follow_live: Some(true),
                msg_history_overlap_days: Some(7),
                ..Default::default()
            },
            targets: vec![
                TargetSettings {
                    target: Target::chat(1),
                    archive: Some(true),
                    behaviour: BehaviourOverrides { download_media: Some(false), ..Default::default() },
                },
                TargetSettings {
                    target: Target::user(2),
                    archive: None,
                    behaviour: BehaviourOverrides { follow_live: Some(false), ..Default::default() },
                },
            ],
        }
    }

    // ===== Behaviour Layering Tests =====

    #[test]
    fn test_merge_prefers_first_set_value() {
        let first = BehaviourOverrides { download_media: Some(false), ..Default::default() };
        let second = BehaviourOverrides { download_media: Some(true), recheck_media: Some(true), ..Default::default() };
        let merged = first.merge(&second);
        assert_eq!(merged.download_media, Some(false));
        assert_eq!(merged.recheck_media, Some(true));
        assert_eq!(merged.follow_live, None);
    }

    #[test]
    fn test_target_override_then_default_then_builtin() {
        let settings = settings();
        let chat = settings.behaviour_for(&Target::chat(1));
        assert!(!chat.download_media);
        assert!(chat.follow_live);
        assert_eq!(chat.msg_history_overlap_days, 7);
        assert!(chat.archive_history);

        let user = settings.behaviour_for(&Target::user(2));
        assert!(!user.follow_live);
        assert!(user.download_media);

        let unknown = settings.behaviour_for(&Target::chat(99));
        assert!(unknown.follow_live);
        assert_eq!(unknown.check_admin_log, BehaviourConfig::default().check_admin_log);
    }

    // ===== Target Selection Tests =====

    #[test]
    fn test_targets_to_archive() {
        let settings = settings();
        let known = [Target::chat(1), Target::user(2), Target::chat(3)];
        assert_eq!(settings.targets_to_archive(&known), vec![Target::chat(1)]);

        let everything = ArchiveSettings { default_archive: true, ..settings };
        assert_eq!(
            everything.targets_to_archive(&known),
            vec![Target::chat(1), Target::chat(3), Target::user(2)]
        );
    }

    #[test]
    fn test_settings_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(ArchiveSettings::load(&path).unwrap(), ArchiveSettings::default());
        settings().save(&path).unwrap();
        assert_eq!(ArchiveSettings::load(&path).unwrap(), settings());
    }

    #[test]
    fn test_settings_parse_minimal_json() {
        let parsed: ArchiveSettings =
            serde_json::from_str(r#"{"targets": [{"target": "chat:5", "behaviour": {"recheck_media": true}}]}"#).unwrap();
        assert!(!parsed.default_archive);
        assert!(parsed.behaviour_for(&Target::chat(5)).recheck_media);
    }

    // ===== Config Validation Tests =====

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store_root, PathBuf::from("store"));
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let config = Config { max_concurrent_targets: 0, ..Config::default() };
        assert!(config.validate().is_err());
        let config = Config { history_page_size: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_or_falls_back_to_default() {
        assert_eq!(env_or("CHAT_ARCHIVER_TEST_UNSET", 42usize).unwrap(), 42);
        env::set_var("CHAT_ARCHIVER_TEST_BLANK", " ");
        assert_eq!(env_or("CHAT_ARCHIVER_TEST_BLANK", 7u64).unwrap(), 7);
        env::set_var("CHAT_ARCHIVER_TEST_SET", " 12 ");
        assert_eq!(env_or("CHAT_ARCHIVER_TEST_SET", 7u64).unwrap(), 12);
        env::set_var("CHAT_ARCHIVER_TEST_BAD", "many");
        let err = env_or("CHAT_ARCHIVER_TEST_BAD", 1u32).unwrap_err();
        assert!(err.to_string().contains("CHAT_ARCHIVER_TEST_BAD"));
    }
}
