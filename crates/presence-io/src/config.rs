use crate::corpus::DirCorpus;
use crate::encoder::CommandEncoder;
use crate::snapshot_store::{DirRemoteStore, FileSnapshotCache, HttpRemoteStore};
use chrono::Duration;
use presence_core::{DedupConfig, Metric, MatcherConfig, RemoteSnapshotStore, DEFAULT_TOLERANCE, DEFAULT_WINDOW_SECS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} is not configured")]
    Missing(&'static str),
    #[error("encoder command: {0}")]
    Encoder(#[from] presence_core::EncoderError),
}

/// Where the daemon takes its initial snapshot from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    /// Local cache, recomputing from the corpus when stale.
    #[default]
    Local,
    /// Whatever was last published to the remote store.
    Remote,
}

impl FromStr for SnapshotSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("expected local or remote, got {other}")),
        }
    }
}

/// Runtime configuration shared by the daemon and the CLI.
///
/// Built from defaults, then the TOML file named by `PRESENCE_CONFIG` (if
/// set), then `PRESENCE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Enrollment images, one subdirectory per identity.
    pub corpus_dir: PathBuf,
    /// SQLite roster and attendance database.
    pub db_path: PathBuf,
    /// Local snapshot cache file.
    pub cache_path: PathBuf,
    /// HTTP URL of the shared snapshot. Takes precedence over `remote_dir`.
    pub remote_url: Option<String>,
    /// Shared directory acting as the remote object store.
    pub remote_dir: Option<PathBuf>,
    /// Object key of the snapshot under `remote_dir`.
    pub remote_key: String,
    /// Shell-style command line of the external face encoder.
    pub encoder_cmd: Option<String>,
    pub model_version: Option<String>,
    pub metric: Metric,
    pub tolerance: f32,
    /// Dedup window in seconds.
    pub window_secs: i64,
    /// Directory the daemon watches for incoming frames.
    pub spool_dir: PathBuf,
    pub poll_ms: u64,
    /// How often the daemon re-checks the corpus for changes.
    pub refresh_secs: u64,
    pub snapshot_source: SnapshotSource,
}

/// TOML overlay; every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    corpus_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    cache_path: Option<PathBuf>,
    remote_url: Option<String>,
    remote_dir: Option<PathBuf>,
    remote_key: Option<String>,
    encoder_cmd: Option<String>,
    model_version: Option<String>,
    metric: Option<Metric>,
    tolerance: Option<f32>,
    window_secs: Option<i64>,
    spool_dir: Option<PathBuf>,
    poll_ms: Option<u64>,
    refresh_secs: Option<u64>,
    snapshot_source: Option<SnapshotSource>,
}

/// Longest accepted dedup window: ten years.
pub const MAX_WINDOW_SECS: i64 = 10 * 365 * 24 * 3600;

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

impl Config {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            corpus_dir: data_dir.join("faces"),
            db_path: data_dir.join("attendance.db"),
            cache_path: data_dir.join("snapshot.json"),
            remote_url: None,
            remote_dir: None,
            remote_key: "embeddings.json".to_string(),
            encoder_cmd: None,
            model_version: None,
            metric: Metric::default(),
            tolerance: DEFAULT_TOLERANCE,
            window_secs: DEFAULT_WINDOW_SECS,
            spool_dir: data_dir.join("spool"),
            poll_ms: 500,
            refresh_secs: 300,
            snapshot_source: SnapshotSource::Local,
        }
    }

    /// Load from `PRESENCE_CONFIG` and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("PRESENCE_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Some((path, text))
            }
            Err(_) => None,
        };
        let config = Self::from_sources(
            &default_data_dir(),
            file.as_ref().map(|(path, text)| (path.as_str(), text.as_str())),
            |key| std::env::var(key).ok(),
        )?;
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Layer an optional `(path, toml)` file and an environment lookup over
    /// the defaults.
    pub fn from_sources(
        data_dir: &Path,
        file: Option<(&str, &str)>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::with_data_dir(data_dir);

        if let Some((path, text)) = file {
            let overlay: FileConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
            config.apply_file(overlay);
        }

        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = file.$field { self.$field = v; })*
            };
        }
        overlay!(
            corpus_dir, db_path, cache_path, remote_key, metric, tolerance, window_secs,
            spool_dir, poll_ms, refresh_secs, snapshot_source,
        );
        if file.remote_url.is_some() {
            self.remote_url = file.remote_url;
        }
        if file.remote_dir.is_some() {
            self.remote_dir = file.remote_dir;
        }
        if file.encoder_cmd.is_some() {
            self.encoder_cmd = file.encoder_cmd;
        }
        if file.model_version.is_some() {
            self.model_version = file.model_version;
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = env("PRESENCE_CORPUS_DIR") {
            self.corpus_dir = PathBuf::from(v);
        }
        if let Some(v) = env("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("PRESENCE_CACHE_PATH") {
            self.cache_path = PathBuf::from(v);
        }
        if let Some(v) = env("PRESENCE_REMOTE_URL") {
            self.remote_url = Some(v);
        }
        if let Some(v) = env("PRESENCE_REMOTE_DIR") {
            self.remote_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("PRESENCE_REMOTE_KEY") {
            self.remote_key = v;
        }
        if let Some(v) = env("PRESENCE_ENCODER_CMD") {
            self.encoder_cmd = Some(v);
        }
        if let Some(v) = env("PRESENCE_MODEL_VERSION") {
            self.model_version = Some(v);
        }
        if let Some(v) = env("PRESENCE_SPOOL_DIR") {
            self.spool_dir = PathBuf::from(v);
        }

        env_parse(&env, "PRESENCE_METRIC", &mut self.metric)?;
        env_parse(&env, "PRESENCE_TOLERANCE", &mut self.tolerance)?;
        env_parse(&env, "PRESENCE_WINDOW_SECS", &mut self.window_secs)?;
        env_parse(&env, "PRESENCE_POLL_MS", &mut self.poll_ms)?;
        env_parse(&env, "PRESENCE_REFRESH_SECS", &mut self.refresh_secs)?;
        env_parse(&env, "PRESENCE_SNAPSHOT_SOURCE", &mut self.snapshot_source)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(ConfigError::Invalid {
                key: "tolerance",
                value: self.tolerance.to_string(),
                reason: "must be a finite, non-negative distance".into(),
            });
        }
        let window = Duration::try_seconds(self.window_secs)
            .filter(|_| (1..=MAX_WINDOW_SECS).contains(&self.window_secs));
        if window.is_none() {
            return Err(ConfigError::Invalid {
                key: "window_secs",
                value: self.window_secs.to_string(),
                reason: format!("must be between 1 and {MAX_WINDOW_SECS}"),
            });
        }
        if self.poll_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "poll_ms",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }
        if self.refresh_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "refresh_secs",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            metric: self.metric,
            tolerance: self.tolerance,
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            window: Duration::seconds(self.window_secs.clamp(1, MAX_WINDOW_SECS)),
        }
    }

    pub fn corpus(&self) -> DirCorpus {
        DirCorpus::new(&self.corpus_dir)
    }

    pub fn cache(&self) -> FileSnapshotCache {
        FileSnapshotCache::new(&self.cache_path)
    }

    /// Configured remote snapshot store, if any. `remote_url` wins over `remote_dir`.
    pub fn remote_store(&self) -> Option<Box<dyn RemoteSnapshotStore + Send>> {
        if let Some(url) = &self.remote_url {
            return Some(Box::new(HttpRemoteStore::new(url.clone())));
        }
        self.remote_dir
            .as_ref()
            .map(|dir| Box::new(DirRemoteStore::new(dir, self.remote_key.clone())) as Box<dyn RemoteSnapshotStore + Send>)
    }

    pub fn encoder(&self) -> Result<CommandEncoder, ConfigError> {
        let cmd = self
            .encoder_cmd
            .as_deref()
            .ok_or(ConfigError::Missing("encoder_cmd (PRESENCE_ENCODER_CMD)"))?;
        let encoder = CommandEncoder::new(cmd)?;
        Ok(match &self.model_version {
            Some(version) => encoder.with_model_version(version.clone()),
            None => encoder,
        })
    }
}

fn env_parse<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = env(key) {
        *slot = value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: value.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}
