//! Server configuration.
//!
//! A single YAML document with `${VAR}` environment expansion applied
//! before parsing. A missing file is not an error; every option has a
//! default so a bare `fleetd` starts with local storage and no Git source.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use fleetd_core::gitsync::{GitAuth, GitSyncConfig};

/// Errors produced while loading the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The configuration is syntactically valid but inconsistent.
    #[error("invalid config: {message}")]
    Invalid {
        /// What is inconsistent.
        message: String,
    },
}

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen endpoints.
    #[serde(default)]
    pub server: ServerSection,
    /// Registry persistence.
    #[serde(default)]
    pub storage: StorageSection,
    /// Configuration repository source.
    #[serde(default)]
    pub git: GitSection,
    /// Effective-configuration validation.
    #[serde(default)]
    pub validation: ValidationSection,
    /// Log verbosity and rendering.
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listen endpoints for the admin API and the agent protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Admin HTTP API address.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Agent protocol (OpAMP WebSocket) address.
    #[serde(default = "default_opamp_addr")]
    pub opamp_addr: String,
}

/// Registry persistence options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// SQLite storage options.
    #[serde(default)]
    pub sqlite: SqliteSection,
}

/// SQLite-specific storage options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSection {
    /// Registry database file path.
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
}

/// Git source options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSection {
    /// Remote repository URL. Empty disables the syncer; the store is
    /// loaded once from `local_path` instead.
    #[serde(default)]
    pub repo_url: String,
    /// Branch to track.
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Interval of the periodic sync loop.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Local checkout path; doubles as the load directory when no remote is
    /// configured.
    #[serde(default = "default_local_path")]
    pub local_path: PathBuf,
    /// Basic-auth user name. Mutually exclusive with `ssh_key_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Basic-auth password or token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// SSH private key path. Mutually exclusive with `username`/`password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
    /// When set, enables `POST /webhook/git` with HMAC verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
}

/// Validation toggles for merged configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSection {
    /// Validate merged documents before delivery.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Additionally require referenced components to be defined.
    #[serde(default)]
    pub strict_otel_schema: bool,
}

/// Logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level filter (`trace` .. `error`, or a full filter directive).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Rendering: `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_opamp_addr() -> String {
    "0.0.0.0:4320".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./data/fleetd.db")
}

fn default_branch() -> String {
    "main".to_string()
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_local_path() -> PathBuf {
    PathBuf::from("./data/configs")
}

const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            opamp_addr: default_opamp_addr(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            sqlite: SqliteSection::default(),
        }
    }
}

impl Default for SqliteSection {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            branch: default_branch(),
            poll_interval: default_poll_interval(),
            local_path: default_local_path(),
            username: None,
            password: None,
            ssh_key_path: None,
            webhook_secret: None,
        }
    }
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            strict_otel_schema: false,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ServerConfig {
    /// Loads the configuration from `path`. A missing file yields the
    /// defaults; any present file must parse and pass consistency checks.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read, parse, or consistency failure.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let expanded = expand_env(&raw);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let basic = self.git.username.is_some() || self.git.password.is_some();
        if basic && self.git.ssh_key_path.is_some() {
            return Err(ConfigError::Invalid {
                message: "git.username/git.password and git.ssh_key_path are mutually exclusive"
                    .to_string(),
            });
        }
        if self.git.username.is_some() != self.git.password.is_some() {
            return Err(ConfigError::Invalid {
                message: "git.username and git.password must be set together".to_string(),
            });
        }
        match self.logging.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::Invalid {
                message: format!("logging.format must be 'text' or 'json', got {other:?}"),
            }),
        }
    }

    /// Whether a Git remote is configured.
    #[must_use]
    pub fn git_enabled(&self) -> bool {
        !self.git.repo_url.is_empty()
    }

    /// Builds the syncer configuration from the `git` section.
    #[must_use]
    pub fn syncer_config(&self) -> GitSyncConfig {
        let auth = match (&self.git.username, &self.git.password, &self.git.ssh_key_path) {
            (Some(username), Some(password), _) => GitAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            (_, _, Some(key_path)) => GitAuth::SshKey {
                key_path: key_path.clone(),
            },
            _ => GitAuth::Anonymous,
        };
        GitSyncConfig {
            repo_url: self.git.repo_url.clone(),
            branch: self.git.branch.clone(),
            local_path: self.git.local_path.clone(),
            poll_interval: self.git.poll_interval,
            auth,
            shallow: true,
        }
    }
}

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

/// Replaces `${VAR}` references with environment values; unset variables
/// expand to the empty string.
fn expand_env(raw: &str) -> String {
    ENV_VAR
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetd.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = ServerConfig::load(Path::new("/nonexistent/fleetd.yaml")).unwrap();
        assert_eq!(config.server.http_addr, "0.0.0.0:8080");
        assert_eq!(config.server.opamp_addr, "0.0.0.0:4320");
        assert_eq!(config.git.branch, "main");
        assert_eq!(config.git.poll_interval, Duration::from_secs(60));
        assert!(config.validation.enabled);
        assert!(!config.git_enabled());
    }

    #[test]
    fn test_full_config_parses() {
        let (_dir, path) = write_config(
            "
server:
  http_addr: 127.0.0.1:9090
  opamp_addr: 127.0.0.1:9320
storage:
  sqlite:
    path: /var/lib/fleetd/registry.db
git:
  repo_url: https://git.example.com/telemetry-configs.git
  branch: production
  poll_interval: 2m
  local_path: /var/lib/fleetd/configs
  webhook_secret: sekrit
validation:
  enabled: true
  strict_otel_schema: true
logging:
  level: debug
  format: json
",
        );
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.server.http_addr, "127.0.0.1:9090");
        assert_eq!(config.git.branch, "production");
        assert_eq!(config.git.poll_interval, Duration::from_secs(120));
        assert_eq!(config.git.webhook_secret.as_deref(), Some("sekrit"));
        assert!(config.validation.strict_otel_schema);
        assert_eq!(config.logging.format, "json");
        assert!(config.git_enabled());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("FLEETD_TEST_TOKEN", "tok-123");
        let (_dir, path) = write_config(
            "
git:
  repo_url: https://git.example.com/configs.git
  username: ci
  password: ${FLEETD_TEST_TOKEN}
",
        );
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.git.password.as_deref(), Some("tok-123"));

        match config.syncer_config().auth {
            GitAuth::Basic { username, password } => {
                assert_eq!(username, "ci");
                assert_eq!(password, "tok-123");
            }
            other => panic!("expected basic auth, got {other:?}"),
        }
    }

    #[test]
    fn test_unset_env_expands_to_empty() {
        std::env::remove_var("FLEETD_TEST_MISSING");
        let (_dir, path) = write_config("logging:\n  level: ${FLEETD_TEST_MISSING}info\n");
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_auth_modes_are_mutually_exclusive() {
        let (_dir, path) = write_config(
            "
git:
  repo_url: https://git.example.com/configs.git
  username: ci
  password: hunter2
  ssh_key_path: /etc/fleetd/id_ed25519
",
        );
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_username_requires_password() {
        let (_dir, path) = write_config("git:\n  repo_url: x\n  username: ci\n");
        assert!(matches!(
            ServerConfig::load(&path).unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let (_dir, path) = write_config("server: [not a mapping");
        assert!(matches!(
            ServerConfig::load(&path).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_ssh_auth_maps_to_key() {
        let (_dir, path) = write_config(
            "git:\n  repo_url: git@git.example.com:configs.git\n  ssh_key_path: /etc/fleetd/id_ed25519\n",
        );
        let config = ServerConfig::load(&path).unwrap();
        match config.syncer_config().auth {
            GitAuth::SshKey { key_path } => {
                assert_eq!(key_path, PathBuf::from("/etc/fleetd/id_ed25519"));
            }
            other => panic!("expected ssh auth, got {other:?}"),
        }
    }
}
