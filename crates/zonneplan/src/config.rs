//! Configuration file parsing and structures.
//!
//! zonneplan reads a single TOML file. Only `[account]` is required; every
//! other section falls back to defaults that match the vendor app.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use zonneplan_api::ClientConfig;
use zonneplan_api::client::DEFAULT_BASE_URL;

use crate::coordinator::RetryOptions;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub account: AccountConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `zonneplan_api = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    /// Address the login link is mailed to
    pub email: String,

    /// Where the token blob is kept between runs
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
}

fn default_token_path() -> PathBuf {
    PathBuf::from("zonneplan-token.json")
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Window in which manual refresh requests are coalesced
    pub debounce_cooldown_secs: u64,

    /// Delay between re-polls while an action is unconfirmed
    pub action_retry_delay_secs: u64,

    /// Re-polls before an action is given up as unconfirmed
    pub action_retry_max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            debounce_cooldown_secs: 60,
            action_retry_delay_secs: 10,
            action_retry_max_attempts: 30,
        }
    }
}

impl PollingConfig {
    pub fn debounce_cooldown(&self) -> Duration {
        Duration::from_secs(self.debounce_cooldown_secs)
    }

    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions {
            delay: Duration::from_secs(self.action_retry_delay_secs),
            max_attempts: self.action_retry_max_attempts,
        }
    }
}

/// Local HTTP API configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub listen: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1".to_string(),
            port: 8566,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [account]
            email = "user@example.com"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.account.email, "user@example.com");
        assert_eq!(
            config.account.token_path,
            PathBuf::from("zonneplan-token.json")
        );
        assert_eq!(config.api.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.polling.debounce_cooldown(), Duration::from_secs(60));
        assert_eq!(config.polling.retry_options().max_attempts, 30);
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8566);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [logging]
            level = "debug"
            overrides = { "zonneplan_api" = "trace" }

            [account]
            email = "user@example.com"
            token_path = "/var/lib/zonneplan/token.json"

            [api]
            base_url = "http://localhost:9000"
            timeout_secs = 10

            [polling]
            debounce_cooldown_secs = 5
            action_retry_delay_secs = 2
            action_retry_max_attempts = 3

            [http]
            enabled = false
            listen = "0.0.0.0"
            port = 9100
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(
            config.logging.overrides.get("zonneplan_api"),
            Some(&LogLevel::Trace)
        );

        let client = config.api.client_config();
        assert_eq!(client.base_url, "http://localhost:9000");
        assert_eq!(client.timeout, Duration::from_secs(10));

        let retry = config.polling.retry_options();
        assert_eq!(retry.delay, Duration::from_secs(2));
        assert_eq!(retry.max_attempts, 3);

        assert!(!config.http.enabled);
        assert_eq!(config.http.listen, "0.0.0.0");
    }

    #[test]
    fn test_missing_account_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[logging]\nlevel = \"info\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[account]\nemail = \"file@example.com\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.account.email, "file@example.com");

        let missing = Config::from_file("/nonexistent/zonneplan.toml").unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_, _)));
    }
}
