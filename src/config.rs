//! Configuration parsing and validation for relaygate.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

use crate::channel::{ChannelSpec, DEFAULT_GROUP};
use crate::storage::Dialect;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub refresher: RefresherConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Channels inserted into an empty store at startup.
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Group used when a request carries no `x-relay-group` header.
    #[serde(default = "default_group")]
    pub default_group: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Identifier quoting used in generated SQL (`sqlite`, `postgres`, `mysql`).
    #[serde(default)]
    pub dialect: Dialect,
}

fn default_db_path() -> String {
    "./relaygate.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            dialect: Dialect::default(),
        }
    }
}

/// Outbound relay settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    /// Whole-request timeout for upstream calls. Unset or 0 means none.
    pub timeout_secs: Option<u64>,
}

impl RelayConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Access-token renewal settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RefresherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_refresh_interval")]
    pub interval_secs: u64,
    /// Tokens expiring within this window are renewed.
    #[serde(default = "default_lookahead")]
    pub lookahead_secs: i64,
    /// Exchange through the mirror endpoint (form body) instead of the
    /// primary one (JSON body).
    #[serde(default = "default_true")]
    pub use_mirror: bool,
    #[serde(default = "default_primary_url")]
    pub primary_url: String,
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
}

fn default_refresh_interval() -> u64 {
    3600
}

fn default_lookahead() -> i64 {
    24 * 3600
}

fn default_primary_url() -> String {
    "https://auth0.openai.com/oauth/token".to_string()
}

fn default_mirror_url() -> String {
    "https://token.oaifree.com/api/auth/refresh".to_string()
}

fn default_client_id() -> String {
    "pdlLIX2Y72MIl2rhLhTE9VV9bN905kBh".to_string()
}

fn default_redirect_uri() -> String {
    "com.openai.chat://auth0.openai.com/ios/com.openai.chat/callback".to_string()
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_refresh_interval(),
            lookahead_secs: default_lookahead(),
            use_mirror: true,
            primary_url: default_primary_url(),
            mirror_url: default_mirror_url(),
            client_id: default_client_id(),
            redirect_uri: default_redirect_uri(),
        }
    }
}

/// Deferred `used_quota` accounting.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default)]
    pub batch_update_enabled: bool,
    #[serde(default = "default_quota_interval")]
    pub interval_secs: u64,
    /// Flush early once this many channels have pending deltas.
    #[serde(default = "default_size_threshold")]
    pub size_threshold: usize,
}

fn default_quota_interval() -> u64 {
    5
}

fn default_size_threshold() -> usize {
    1000
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            batch_update_enabled: false,
            interval_secs: default_quota_interval(),
            size_threshold: default_size_threshold(),
        }
    }
}

/// Outbound mail settings for operator notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub account: String,
    pub token: Option<ApiKey>,
    /// Sender address; defaults to `account`.
    pub from: Option<String>,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default = "default_system_name")]
    pub system_name: String,
    /// Semicolon-separated list, e.g. `"ops@example.com;oncall@example.com"`.
    #[serde(default)]
    pub recipients: String,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_system_name() -> String {
    "relaygate".to_string()
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// The inner `SecretString` ensures the key value is:
/// - Zeroized in memory when dropped
/// - Never exposed via Debug or Display
/// - Only accessible via `.expose_secret()` (grep-auditable)
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a seed channel's key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LoggingConfig {
    const LEVELS: [&'static str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

    /// `EnvFilter` directives applied when `RUST_LOG` is unset.
    pub fn filter_directives(&self) -> String {
        format!("relaygate={0},tower_http={0}", self.level.trim().to_ascii_lowercase())
    }
}

impl Config {
    /// Load configuration from a TOML file, expanding `${VAR}` references
    /// from the process environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self::from_file_with_env(path)?.0)
    }

    /// Like [`Config::from_file`], also reporting how each seed channel's key
    /// was resolved.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str_with(&content, |name| std::env::var(name).ok())
    }

    /// Parse configuration from a TOML string using the process environment.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        Ok(Self::parse_str_with(content, |name| std::env::var(name).ok())?.0)
    }

    /// Parse, resolve secrets through `lookup`, then validate.
    pub fn parse_str_with<F>(
        content: &str,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        let key_sources = config.resolve_secrets(&lookup)?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Expand `${VAR}` in secret fields and fill missing seed keys from
    /// `RELAYGATE_<NAME>_API_KEY`.
    fn resolve_secrets<F>(&mut self, lookup: &F) -> Result<Vec<(String, KeySource)>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut key_sources = Vec::with_capacity(self.channels.len());

        for channel in &mut self.channels {
            let source = match channel.key.take() {
                Some(raw) if raw.expose_secret().contains("${") => {
                    let expanded =
                        expand_env_vars_with(raw.expose_secret(), &channel.name, lookup)?;
                    channel.key = Some(ApiKey::from(expanded));
                    KeySource::EnvExpanded
                }
                Some(raw) => {
                    channel.key = Some(raw);
                    KeySource::Literal
                }
                None => {
                    let var_name = convention_env_var_name(&channel.name);
                    match lookup(&var_name) {
                        Some(value) => {
                            channel.key = Some(ApiKey::from(value));
                            KeySource::Convention(var_name)
                        }
                        None => KeySource::None,
                    }
                }
            };

            if let Some(raw) = channel.refresh_token.take() {
                let value = expand_env_vars_with(raw.expose_secret(), &channel.name, lookup)?;
                channel.refresh_token = Some(ApiKey::from(value));
            }

            key_sources.push((channel.name.clone(), source));
        }

        if let Some(smtp) = &mut self.smtp {
            if let Some(raw) = smtp.token.take() {
                let value = expand_env_vars_with(raw.expose_secret(), "smtp", lookup)?;
                smtp.token = Some(ApiKey::from(value));
            }
        }

        Ok(key_sources)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.default_group.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.default_group cannot be empty".to_string(),
            ));
        }

        if self.refresher.enabled && self.refresher.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "refresher.interval_secs must be positive".to_string(),
            ));
        }

        if self.quota.batch_update_enabled && self.quota.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "quota.interval_secs must be positive when batching".to_string(),
            ));
        }

        let level = self.logging.level.trim().to_ascii_lowercase();
        if !LoggingConfig::LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level '{}' is not one of {}",
                self.logging.level,
                LoggingConfig::LEVELS.join(", ")
            )));
        }

        if let Some(smtp) = &self.smtp {
            if smtp.server.is_empty() || smtp.account.is_empty() {
                return Err(ConfigError::Validation(
                    "smtp.server and smtp.account are required".to_string(),
                ));
            }
        }

        for channel in &self.channels {
            channel
                .validate()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }

        Ok(())
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{field}': {message}")]
    EnvVar {
        var: String,
        field: String,
        message: String,
    },
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${PREFIX}-${SUFFIX}`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, field: &str, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            field: field.to_string(),
            message: "Unclosed '${' in config value".to_string(),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                field: field.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            field: field.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in '{}')",
                var_name, field
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Convention env var for a seed channel's key.
///
/// - "alpha" -> "RELAYGATE_ALPHA_API_KEY"
/// - "azure-east" -> "RELAYGATE_AZURE_EAST_API_KEY"
pub fn convention_env_var_name(channel_name: &str) -> String {
    let upper_snake = channel_name.to_uppercase().replace(['-', ' '], "_");
    format!("RELAYGATE_{}_API_KEY", upper_snake)
}
