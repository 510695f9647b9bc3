//! Configuration resolution for the karaoke node.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/karaoke/settings.json`)
//! 3. Environment variables (`KARAOKE_*`)
//! 4. CLI arguments (highest priority, applied by the binary)

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub license: LicenseConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Where the node lives and whom it talks to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    /// Base URL of the authority (`http://host:port`).
    pub authority_url: String,
    /// Local API bind address for the front-end.
    pub listen: String,
    /// State directory; defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    /// Media directory; defaults to `<data_dir>/media`.
    pub media_root: Option<PathBuf>,
    /// Local store; defaults to `<data_dir>/node.db`.
    pub db_path: Option<PathBuf>,
    /// Overrides the persisted device fingerprint.
    pub device_id: Option<String>,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            authority_url: "http://127.0.0.1:8080".to_string(),
            listen: "127.0.0.1:7878".to_string(),
            data_dir: None,
            media_root: None,
            db_path: None,
            device_id: None,
            log_level: "info".to_string(),
        }
    }
}

/// What to do with a local row whose code the authority no longer knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Keep the row pending but stop trying to download it.
    #[default]
    KeepPending,
    /// Like `KeepPending`, and also hide it from search and totals.
    Hide,
    /// Remove the local row.
    Delete,
}

/// When a play is written to history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRecordPolicy {
    TrackStart,
    #[default]
    TrackCompletion,
}

macro_rules! snake_case_enum_str {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().replace('-', "_").as_str() {
                    $($s => Ok(Self::$variant),)+
                    other => Err(Error::Config(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

snake_case_enum_str!(OrphanPolicy {
    KeepPending => "keep_pending",
    Hide => "hide",
    Delete => "delete",
});

snake_case_enum_str!(HistoryRecordPolicy {
    TrackStart => "track_start",
    TrackCompletion => "track_completion",
});

/// Catalog sync tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: u32,
    /// Pause between batches while entries remain.
    pub batch_backoff_secs: u64,
    /// How often to rediscover once everything is mirrored.
    pub rediscovery_interval_secs: u64,
    pub page_limit: u32,
    pub orphan_policy: OrphanPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            batch_backoff_secs: 5,
            rediscovery_interval_secs: 30 * 60,
            page_limit: 100,
            orphan_policy: OrphanPolicy::KeepPending,
        }
    }
}

impl SyncConfig {
    pub const fn batch_backoff(&self) -> Duration {
        Duration::from_secs(self.batch_backoff_secs)
    }

    pub const fn rediscovery_interval(&self) -> Duration {
        period_secs(self.rediscovery_interval_secs)
    }
}

/// Lease checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LicenseConfig {
    pub revalidate_interval_secs: u64,
    /// Upper bound on the local store read behind the fast check.
    pub lease_read_budget_ms: u64,
    /// Mark the lease revoked when background revalidation is refused.
    pub revoke_on_rejection: bool,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            revalidate_interval_secs: 60 * 60,
            lease_read_budget_ms: 50,
            revoke_on_rejection: true,
        }
    }
}

impl LicenseConfig {
    pub const fn revalidate_interval(&self) -> Duration {
        period_secs(self.revalidate_interval_secs)
    }

    pub const fn lease_read_budget(&self) -> Duration {
        Duration::from_millis(self.lease_read_budget_ms)
    }
}

/// Play history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    pub push_interval_secs: u64,
    pub record_policy: HistoryRecordPolicy,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            push_interval_secs: 5 * 60,
            record_policy: HistoryRecordPolicy::TrackCompletion,
        }
    }
}

impl HistoryConfig {
    pub const fn push_interval(&self) -> Duration {
        period_secs(self.push_interval_secs)
    }
}

/// A timer period; zero is raised to one second since a periodic timer
/// cannot tick every zero seconds.
const fn period_secs(secs: u64) -> Duration {
    Duration::from_secs(if secs == 0 { 1 } else { secs })
}

impl Config {
    /// State directory, falling back to the platform data dir.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.node.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join("karaoke"))
            .ok_or_else(|| Error::Config("Cannot determine data directory".into()))
    }

    pub fn media_root(&self) -> Result<PathBuf> {
        match &self.node.media_root {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("media")),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.node.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("node.db")),
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config() -> Result<Config> {
    load_config_from(global_config_path().as_deref(), |name| std::env::var(name).ok())
}

/// Load configuration from an explicit settings file and environment lookup.
pub fn load_config_from(
    settings: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut config = Config::default();

    if let Some(path) = settings
        && path.exists()
    {
        let global = load_config_file(path)?;
        merge_config(&mut config, global);
    }

    apply_env_overrides(&mut config, env)?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("karaoke").join("settings.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    let Config {
        node,
        sync,
        license,
        history,
    } = overlay;

    base.node.authority_url = node.authority_url;
    base.node.listen = node.listen;
    base.node.log_level = node.log_level;
    if node.data_dir.is_some() {
        base.node.data_dir = node.data_dir;
    }
    if node.media_root.is_some() {
        base.node.media_root = node.media_root;
    }
    if node.db_path.is_some() {
        base.node.db_path = node.db_path;
    }
    if node.device_id.is_some() {
        base.node.device_id = node.device_id;
    }

    base.sync = sync;
    base.license = license;
    base.history = history;
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={value:?}: {e}")))
}

fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(val) = env("KARAOKE_AUTHORITY_URL") {
        config.node.authority_url = val;
    }
    if let Some(val) = env("KARAOKE_LISTEN") {
        config.node.listen = val;
    }
    if let Some(val) = env("KARAOKE_DATA_DIR") {
        config.node.data_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = env("KARAOKE_MEDIA_ROOT") {
        config.node.media_root = Some(PathBuf::from(val));
    }
    if let Some(val) = env("KARAOKE_DB_PATH") {
        config.node.db_path = Some(PathBuf::from(val));
    }
    if let Some(val) = env("KARAOKE_DEVICE_ID") {
        config.node.device_id = Some(val);
    }
    if let Some(val) = env("KARAOKE_LOG_LEVEL") {
        config.node.log_level = val;
    }
    if let Some(val) = env("KARAOKE_BATCH_SIZE") {
        config.sync.batch_size = parse_env("KARAOKE_BATCH_SIZE", &val)?;
    }
    if let Some(val) = env("KARAOKE_ORPHAN_POLICY") {
        config.sync.orphan_policy = parse_env("KARAOKE_ORPHAN_POLICY", &val)?;
    }
    if let Some(val) = env("KARAOKE_REVALIDATE_INTERVAL_SECS") {
        config.license.revalidate_interval_secs =
            parse_env("KARAOKE_REVALIDATE_INTERVAL_SECS", &val)?;
    }
    if let Some(val) = env("KARAOKE_REVOKE_ON_REJECTION") {
        config.license.revoke_on_rejection = parse_env("KARAOKE_REVOKE_ON_REJECTION", &val)?;
    }
    if let Some(val) = env("KARAOKE_HISTORY_RECORD_POLICY") {
        config.history.record_policy = parse_env("KARAOKE_HISTORY_RECORD_POLICY", &val)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.sync.batch_size, 3);
        assert_eq!(config.sync.batch_backoff_secs, 5);
        assert_eq!(config.sync.rediscovery_interval_secs, 1800);
        assert_eq!(config.license.lease_read_budget_ms, 50);
        assert_eq!(config.history.record_policy, HistoryRecordPolicy::TrackCompletion);
        assert_eq!(config.sync.orphan_policy, OrphanPolicy::KeepPending);
        assert!(config.license.revoke_on_rejection);
        assert_eq!(config.node.listen, "127.0.0.1:7878");
    }

    #[test]
    fn settings_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"node": {"authority_url": "https://auth.example"}, "sync": {"batch_size": 7}}"#,
        )
        .unwrap();

        let config = load_config_from(
            Some(&path),
            env_from(&[
                ("KARAOKE_BATCH_SIZE", "9"),
                ("KARAOKE_ORPHAN_POLICY", "delete"),
                ("KARAOKE_HISTORY_RECORD_POLICY", "track-start"),
            ]),
        )
        .unwrap();

        assert_eq!(config.node.authority_url, "https://auth.example");
        assert_eq!(config.node.listen, "127.0.0.1:7878");
        assert_eq!(config.sync.batch_size, 9);
        assert_eq!(config.sync.batch_backoff_secs, 5);
        assert_eq!(config.sync.orphan_policy, OrphanPolicy::Delete);
        assert_eq!(config.history.record_policy, HistoryRecordPolicy::TrackStart);
    }

    #[test]
    fn missing_settings_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            load_config_from(Some(&dir.path().join("absent.json")), env_from(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn malformed_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_config_from(Some(&path), env_from(&[])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let result = load_config_from(None, env_from(&[("KARAOKE_BATCH_SIZE", "many")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn derived_paths_follow_data_dir() {
        let mut config = Config::default();
        config.node.data_dir = Some(PathBuf::from("/srv/karaoke"));
        assert_eq!(config.media_root().unwrap(), PathBuf::from("/srv/karaoke/media"));
        assert_eq!(config.db_path().unwrap(), PathBuf::from("/srv/karaoke/node.db"));

        config.node.media_root = Some(PathBuf::from("/mnt/songs"));
        assert_eq!(config.media_root().unwrap(), PathBuf::from("/mnt/songs"));
    }

    #[test]
    fn zero_periods_are_raised_to_one_second() {
        let config = load_config_from(
            None,
            env_from(&[("KARAOKE_REVALIDATE_INTERVAL_SECS", "0")]),
        )
        .unwrap();
        assert_eq!(config.license.revalidate_interval(), Duration::from_secs(1));

        let history = HistoryConfig {
            push_interval_secs: 0,
            ..HistoryConfig::default()
        };
        assert_eq!(history.push_interval(), Duration::from_secs(1));

        let sync = SyncConfig {
            rediscovery_interval_secs: 0,
            ..SyncConfig::default()
        };
        assert_eq!(sync.rediscovery_interval(), Duration::from_secs(1));
        assert_eq!(SyncConfig::default().rediscovery_interval(), Duration::from_secs(1800));
    }
}
