//! TOML configuration. Secrets are read from the environment variables the
//! file names, never from the file itself.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "review-sync.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("diff source 'local' requires [diff] local_repo")]
    MissingLocalRepo,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            github: GitHubConfig::default(),
            webhook: WebhookConfig::default(),
            review: ReviewConfig::default(),
            diff: DiffConfig::default(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<u64>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
            installation_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Link target of the status line in posted summaries.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffSourceKind {
    #[default]
    Github,
    Local,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffConfig {
    #[serde(default)]
    pub source: DiffSourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_repo: Option<PathBuf>,
}

impl Config {
    /// Load `path`, or defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        if config.diff.source == DiffSourceKind::Local && config.diff.local_repo.is_none() {
            return Err(ConfigError::MissingLocalRepo);
        }
        Ok(config)
    }

    pub fn github_token(&self) -> Result<SecretString> {
        secret_from_env(&self.github.token_env)
    }

    pub fn webhook_secret(&self) -> Result<SecretString> {
        secret_from_env(&self.webhook.secret_env)
    }
}

fn secret_from_env(name: &str) -> Result<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
        .ok_or_else(|| ConfigError::MissingEnv(name.to_string()))
}

fn default_database() -> PathBuf {
    PathBuf::from(".review-sync").join("reviews.db")
}

fn default_api_url() -> String {
    crate::github::API_BASE_URL.to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_secret_env() -> String {
    "GITHUB_WEBHOOK_SECRET".to_string()
}

fn default_base_url() -> String {
    "https://codeapprove.com".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.storage.database, PathBuf::from(".review-sync/reviews.db"));
        assert_eq!(config.diff.source, DiffSourceKind::Github);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::parse(
            r#"
log_level = "debug"

[github]
installation_id = 42

[diff]
source = "local"
local_repo = "/src/widgets"
"#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.github.installation_id, Some(42));
        assert_eq!(config.github.token_env, "GITHUB_TOKEN");
        assert_eq!(config.diff.local_repo, Some(PathBuf::from("/src/widgets")));
        assert_eq!(config.review.base_url, "https://codeapprove.com");
    }

    #[test]
    fn local_source_needs_a_repo() {
        assert!(matches!(
            Config::parse("[diff]\nsource = \"local\"\n"),
            Err(ConfigError::MissingLocalRepo)
        ));
    }

    #[test]
    fn unknown_source_is_rejected() {
        assert!(matches!(
            Config::parse("[diff]\nsource = \"svn\"\n"),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[storage]\ndatabase = \"/tmp/r.db\"\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.storage.database, PathBuf::from("/tmp/r.db"));
    }

    #[test]
    fn unset_secret_env_is_reported() {
        let mut config = Config::default();
        config.github.token_env = "REVIEW_SYNC_TEST_UNSET_TOKEN".to_string();
        assert!(matches!(config.github_token(), Err(ConfigError::MissingEnv(_))));
    }
}
