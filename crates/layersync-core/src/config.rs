//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/layersync/config.toml)
//! 3. Environment variables (LAYERSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::adapter::{AdapterSettings, DEFAULT_CHANNEL_CAPACITY};
use crate::realtime::RealtimeConfig;
use crate::remote::RestConfig;
use crate::router::RouterSettings;

/// Environment variable prefix
const ENV_PREFIX: &str = "LAYERSYNC";

/// Base URL of a locally running instance
const LOCAL_BASE_URL: &str = "http://localhost:8000";

/// Which remote instance to talk to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    #[default]
    Local,
    Hosted,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => write!(f, "local"),
            Target::Hosted => write!(f, "hosted"),
        }
    }
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Target::Local),
            "hosted" => Ok(Target::Hosted),
            other => bail!("Invalid target '{}'. Use 'local' or 'hosted'.", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the local feature file and logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub target: Target,

    /// Base URL of the hosted instance, e.g. `https://example.supabase.co`
    #[serde(default)]
    pub hosted_url: Option<String>,

    /// Explicit REST endpoint; derived from the target when unset
    #[serde(default)]
    pub rest_url: Option<String>,

    /// Explicit realtime endpoint; derived from the target when unset
    #[serde(default)]
    pub realtime_url: Option<String>,

    /// Project key sent with every request
    #[serde(default)]
    pub api_key: String,

    /// User token; the project key is used when unset
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    #[serde(default = "default_echo_ttl_ms")]
    pub echo_ttl_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How often the local feature file is polled for edits
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            target: Target::Local,
            hosted_url: None,
            rest_url: None,
            realtime_url: None,
            api_key: String::new(),
            access_token: None,
            batch_window_ms: default_batch_window_ms(),
            echo_ttl_ms: default_echo_ttl_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            channel_capacity: default_channel_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            log_file: None,
            verbose: false,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (LAYERSYNC_REST_URL, LAYERSYNC_API_KEY, ...)
    /// 2. Config file (~/.config/layersync/config.toml or LAYERSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load from the path given on the command line, or the default one
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Some(val) = env_var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }

        if let Some(val) = env_var("TARGET") {
            match val.parse() {
                Ok(target) => self.target = target,
                Err(e) => warn!("Ignoring {}_TARGET: {}", ENV_PREFIX, e),
            }
        }

        if let Some(val) = env_var("HOSTED_URL") {
            self.hosted_url = non_empty(val);
        }
        if let Some(val) = env_var("REST_URL") {
            self.rest_url = non_empty(val);
        }
        if let Some(val) = env_var("REALTIME_URL") {
            self.realtime_url = non_empty(val);
        }
        if let Some(val) = env_var("API_KEY") {
            self.api_key = val;
        }
        if let Some(val) = env_var("ACCESS_TOKEN") {
            self.access_token = non_empty(val);
        }

        parse_env("BATCH_WINDOW_MS", &mut self.batch_window_ms);
        parse_env("ECHO_TTL_MS", &mut self.echo_ttl_ms);
        parse_env("REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        parse_env("CHANNEL_CAPACITY", &mut self.channel_capacity);
        parse_env("POLL_INTERVAL_MS", &mut self.poll_interval_ms);

        if let Some(val) = env_var("LOG_FILE") {
            self.log_file = non_empty(val).map(PathBuf::from);
        }
        if let Some(val) = env_var("VERBOSE") {
            self.verbose = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with LAYERSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Some(path) = env_var("CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("layersync")
            .join("config.toml")
    }

    /// Get the path to the local feature file
    pub fn features_path(&self) -> PathBuf {
        self.data_dir.join("features.db")
    }

    /// Get the path of the log file used when none is configured
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("layersync.log"))
    }

    fn base_url(&self) -> Result<String> {
        match self.target {
            Target::Local => Ok(LOCAL_BASE_URL.to_string()),
            Target::Hosted => match &self.hosted_url {
                Some(url) => Ok(url.trim_end_matches('/').to_string()),
                None => bail!(
                    "Target is 'hosted' but hosted_url is not set. \
                     Run `layersync config set hosted_url <url>`."
                ),
            },
        }
    }

    /// REST endpoint for the current target
    pub fn rest_endpoint(&self) -> Result<String> {
        if let Some(url) = &self.rest_url {
            return Ok(url.clone());
        }
        Ok(format!("{}/rest/v1", self.base_url()?))
    }

    /// Realtime endpoint for the current target
    pub fn realtime_endpoint(&self) -> Result<String> {
        if let Some(url) = &self.realtime_url {
            return Ok(url.clone());
        }
        let base = self.base_url()?;
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base
        };
        Ok(format!("{}/realtime/v1", base))
    }

    fn require_api_key(&self) -> Result<&str> {
        if self.api_key.is_empty() {
            bail!("api_key is not set. Run `layersync config set api_key <key>`.");
        }
        Ok(&self.api_key)
    }

    pub fn rest_config(&self) -> Result<RestConfig> {
        let mut config = RestConfig::new(self.rest_endpoint()?, self.require_api_key()?)
            .with_timeout(Duration::from_secs(self.request_timeout_secs));
        if let Some(token) = &self.access_token {
            config = config.with_access_token(token);
        }
        Ok(config)
    }

    pub fn realtime_config(&self) -> Result<RealtimeConfig> {
        let mut config = RealtimeConfig::new(self.realtime_endpoint()?, self.require_api_key()?);
        if let Some(token) = &self.access_token {
            config = config.with_access_token(token);
        }
        Ok(config)
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            router: RouterSettings {
                batch_window: Duration::from_millis(self.batch_window_ms),
                echo_ttl: Duration::from_millis(self.echo_ttl_ms),
            },
            channel_capacity: self.channel_capacity.max(1),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

fn parse_env<T: FromStr>(name: &str, target: &mut T) {
    if let Some(val) = env_var(name) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("Ignoring {}_{}: '{}' is not a number", ENV_PREFIX, name, val),
        }
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("layersync")
}

fn default_batch_window_ms() -> u64 {
    250
}

fn default_echo_ttl_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_poll_interval_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "LAYERSYNC_DATA_DIR",
        "LAYERSYNC_TARGET",
        "LAYERSYNC_HOSTED_URL",
        "LAYERSYNC_REST_URL",
        "LAYERSYNC_REALTIME_URL",
        "LAYERSYNC_API_KEY",
        "LAYERSYNC_ACCESS_TOKEN",
        "LAYERSYNC_BATCH_WINDOW_MS",
        "LAYERSYNC_ECHO_TTL_MS",
        "LAYERSYNC_REQUEST_TIMEOUT_SECS",
        "LAYERSYNC_CHANNEL_CAPACITY",
        "LAYERSYNC_POLL_INTERVAL_MS",
        "LAYERSYNC_LOG_FILE",
        "LAYERSYNC_VERBOSE",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.target, Target::Local);
        assert_eq!(config.batch_window_ms, 250);
        assert_eq!(config.echo_ttl_ms, 5000);
        assert_eq!(config.channel_capacity, 1024);
        assert!(config.data_dir.ends_with("layersync"));
        assert!(config.features_path().ends_with("features.db"));
    }

    #[test]
    fn test_local_endpoints() {
        let config = Config::default();
        assert_eq!(config.rest_endpoint().unwrap(), "http://localhost:8000/rest/v1");
        assert_eq!(
            config.realtime_endpoint().unwrap(),
            "ws://localhost:8000/realtime/v1"
        );
    }

    #[test]
    fn test_hosted_endpoints() {
        let mut config = Config {
            target: Target::Hosted,
            ..Config::default()
        };
        assert!(config.rest_endpoint().is_err());

        config.hosted_url = Some("https://demo.example.co/".to_string());
        assert_eq!(config.rest_endpoint().unwrap(), "https://demo.example.co/rest/v1");
        assert_eq!(
            config.realtime_endpoint().unwrap(),
            "wss://demo.example.co/realtime/v1"
        );

        // Explicit endpoints win
        config.rest_url = Some("http://10.0.0.5/rest/v1".to_string());
        assert_eq!(config.rest_endpoint().unwrap(), "http://10.0.0.5/rest/v1");
    }

    #[test]
    fn test_rest_config_requires_api_key() {
        let mut config = Config::default();
        assert!(config.rest_config().is_err());

        config.api_key = "anon".to_string();
        config.access_token = Some("user".to_string());
        config.request_timeout_secs = 2;
        let rest = config.rest_config().unwrap();
        assert_eq!(rest.api_key, "anon");
        assert_eq!(rest.access_token.as_deref(), Some("user"));
        assert_eq!(rest.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_adapter_settings() {
        let config = Config {
            batch_window_ms: 50,
            echo_ttl_ms: 800,
            channel_capacity: 0,
            ..Config::default()
        };
        let settings = config.adapter_settings();
        assert_eq!(settings.router.batch_window, Duration::from_millis(50));
        assert_eq!(settings.router.echo_ttl, Duration::from_millis(800));
        assert_eq!(settings.channel_capacity, 1);
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();

        env::set_var("LAYERSYNC_DATA_DIR", "/tmp/layersync-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/layersync-test"));
    }

    #[test]
    fn test_env_override_target() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("LAYERSYNC_TARGET", "hosted");
        env::set_var("LAYERSYNC_HOSTED_URL", "https://demo.example.co");
        config.apply_env_overrides();
        assert_eq!(config.target, Target::Hosted);
        assert_eq!(config.rest_endpoint().unwrap(), "https://demo.example.co/rest/v1");

        // Unknown values are ignored
        env::set_var("LAYERSYNC_TARGET", "staging");
        config.apply_env_overrides();
        assert_eq!(config.target, Target::Hosted);
    }

    #[test]
    fn test_env_override_numbers() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("LAYERSYNC_BATCH_WINDOW_MS", "500");
        env::set_var("LAYERSYNC_ECHO_TTL_MS", "not-a-number");
        config.apply_env_overrides();

        assert_eq!(config.batch_window_ms, 500);
        assert_eq!(config.echo_ttl_ms, 5000);
    }

    #[test]
    fn test_env_override_access_token() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("LAYERSYNC_ACCESS_TOKEN", "token");
        config.apply_env_overrides();
        assert_eq!(config.access_token, Some("token".to_string()));

        // Empty string clears it
        env::set_var("LAYERSYNC_ACCESS_TOKEN", "");
        config.apply_env_overrides();
        assert!(config.access_token.is_none());
    }

    #[test]
    fn test_serialization() {
        let _guard = EnvGuard::new(ENV_VARS);

        let config = Config {
            data_dir: PathBuf::from("/data/layersync"),
            target: Target::Hosted,
            hosted_url: Some("https://demo.example.co".to_string()),
            api_key: "anon".to_string(),
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("target = \"hosted\""));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            api_key = "anon"
            batch_window_ms = 100
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.api_key, "anon");
        assert_eq!(config.batch_window_ms, 100);
        assert_eq!(config.echo_ttl_ms, 5000);
    }

    #[test]
    fn test_save_and_load_from_path() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            data_dir: dir.path().join("data"),
            api_key: "anon".to_string(),
            ..Config::default()
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.data_dir.exists());
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let dir = tempfile::tempdir().unwrap();
        env::set_var("LAYERSYNC_DATA_DIR", dir.path().join("data"));

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        // Should return defaults when file doesn't exist
        assert_eq!(config.target, Target::Local);
        assert!(config.api_key.is_empty());
    }
}
