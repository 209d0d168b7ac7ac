//! MaskHub connection configuration.
//!
//! Credentials and retry settings are resolved from, in order of precedence:
//!
//! 1. Environment variables (`MASKHUB_API`, `MASKHUB_API_V3`, `MASKHUB_API_TOKEN`
//!    for credentials; `MASKHUB_TIMEOUT`, `MASKHUB_MAX_RETRIES`,
//!    `MASKHUB_RETRY_MULTIPLIER`, `MASKHUB_RETRY_MIN_WAIT` for settings)
//! 2. An explicitly supplied JSON config file
//! 3. The first existing default location (`~/.edwa/maskhub_config.json`,
//!    `config/maskhub_config.json`, `maskhub_config.json`)
//!
//! Missing credentials are not an error: the integration falls back to
//! local-only mode.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{MaskHubError, MaskHubResult};
use crate::retry::RetryPolicy;
use crate::security::SecureString;

pub const ENV_API_URL: &str = "MASKHUB_API";
pub const ENV_API_V3_URL: &str = "MASKHUB_API_V3";
pub const ENV_API_TOKEN: &str = "MASKHUB_API_TOKEN";
pub const ENV_TIMEOUT: &str = "MASKHUB_TIMEOUT";
pub const ENV_MAX_RETRIES: &str = "MASKHUB_MAX_RETRIES";
pub const ENV_RETRY_MULTIPLIER: &str = "MASKHUB_RETRY_MULTIPLIER";
pub const ENV_RETRY_MIN_WAIT: &str = "MASKHUB_RETRY_MIN_WAIT";

/// MaskHub API credentials.
#[derive(Debug, Clone)]
pub struct MaskHubCredentials {
    pub api_url: String,
    pub api_v3_url: String,
    pub api_token: SecureString,
}

/// On-disk shape of the credentials block.
#[derive(Serialize, Deserialize)]
struct CredentialsFile {
    api_url: String,
    api_v3_url: String,
    api_token: String,
}

impl MaskHubCredentials {
    pub fn new(
        api_url: impl Into<String>,
        api_v3_url: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            api_v3_url: api_v3_url.into(),
            api_token: SecureString::new(api_token.into()),
        }
    }

    /// Load credentials from the process environment.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load credentials through an arbitrary variable lookup.
    ///
    /// All three variables must be present and non-empty.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fetch = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let api_url = fetch(ENV_API_URL);
        let api_v3_url = fetch(ENV_API_V3_URL);
        let api_token = fetch(ENV_API_TOKEN);

        match (api_url, api_v3_url, api_token) {
            (Some(api_url), Some(api_v3_url), Some(api_token)) => {
                Some(Self::new(api_url, api_v3_url, api_token))
            }
            (api_url, api_v3_url, api_token) => {
                let missing: Vec<&str> = [
                    (ENV_API_URL, api_url.is_none()),
                    (ENV_API_V3_URL, api_v3_url.is_none()),
                    (ENV_API_TOKEN, api_token.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, absent)| absent.then_some(name))
                .collect();
                debug!(missing = %missing.join(", "), "MaskHub environment variables incomplete");
                None
            }
        }
    }

    fn from_file_block(block: CredentialsFile) -> Self {
        Self::new(block.api_url, block.api_v3_url, block.api_token)
    }

    fn to_file_block(&self) -> CredentialsFile {
        CredentialsFile {
            api_url: self.api_url.clone(),
            api_v3_url: self.api_v3_url.clone(),
            api_token: self.api_token.expose().to_string(),
        }
    }
}

/// Tunable transport and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskHubSettings {
    /// Per-request timeout in seconds.
    pub timeout: u64,
    /// Total attempts per upload, including the first.
    pub max_retries: u32,
    pub retry_multiplier: f64,
    /// First backoff delay in seconds.
    pub retry_min_wait: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_max_wait: Option<u64>,
}

impl Default for MaskHubSettings {
    fn default() -> Self {
        Self {
            timeout: 30,
            max_retries: 5,
            retry_multiplier: 2.0,
            retry_min_wait: 15,
            retry_max_wait: None,
        }
    }
}

impl MaskHubSettings {
    /// Apply `MASKHUB_*` setting overrides. Unparseable values are ignored.
    fn apply_overrides<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(variable = key, value = %raw, "Ignoring unparseable setting override");
                    None
                }
            }
        }

        if let Some(v) = parse(ENV_TIMEOUT, lookup(ENV_TIMEOUT)) {
            self.timeout = v;
        }
        if let Some(v) = parse(ENV_MAX_RETRIES, lookup(ENV_MAX_RETRIES)) {
            self.max_retries = v;
        }
        if let Some(v) = parse(ENV_RETRY_MULTIPLIER, lookup(ENV_RETRY_MULTIPLIER)) {
            self.retry_multiplier = v;
        }
        if let Some(v) = parse(ENV_RETRY_MIN_WAIT, lookup(ENV_RETRY_MIN_WAIT)) {
            self.retry_min_wait = v;
        }
    }
}

/// Configuration for connecting to MaskHub.
#[derive(Debug, Clone)]
pub struct MaskHubConfig {
    credentials: MaskHubCredentials,
    settings: MaskHubSettings,
    timeout: Duration,
    retry_min_wait: Duration,
}

impl MaskHubConfig {
    /// Create a config with default settings.
    pub fn new(credentials: MaskHubCredentials) -> Self {
        let settings = MaskHubSettings::default();
        Self {
            credentials,
            timeout: Duration::from_secs(settings.timeout),
            retry_min_wait: Duration::from_secs(settings.retry_min_wait),
            settings,
        }
    }

    pub fn with_settings(mut self, settings: MaskHubSettings) -> Self {
        self.timeout = Duration::from_secs(settings.timeout);
        self.retry_min_wait = Duration::from_secs(settings.retry_min_wait);
        self.settings = settings;
        self
    }

    /// Set the HTTP request timeout. Sub-second values are kept exactly;
    /// the persisted settings round up to whole seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.settings.timeout = whole_seconds_ceil(timeout);
        self
    }

    /// Set the total number of upload attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.settings.max_retries = max_retries;
        self
    }

    /// Set the exponential backoff parameters.
    pub fn with_backoff(mut self, min_wait: Duration, multiplier: f64) -> Self {
        self.retry_min_wait = min_wait;
        self.settings.retry_min_wait = whole_seconds_ceil(min_wait);
        self.settings.retry_multiplier = multiplier;
        self
    }

    pub fn credentials(&self) -> &MaskHubCredentials {
        &self.credentials
    }

    pub fn settings(&self) -> &MaskHubSettings {
        &self.settings
    }

    /// Base URL of the v1 API (runs, masks, attachments).
    pub fn api_url(&self) -> &str {
        self.credentials.api_url.trim_end_matches('/')
    }

    /// Base URL of the v3 API (measurement uploads).
    pub fn api_v3_url(&self) -> &str {
        self.credentials.api_v3_url.trim_end_matches('/')
    }

    /// Get the API token.
    ///
    /// # Security
    /// Returns a reference to the secure string. Use `expose()` to access
    /// the underlying value. Avoid storing or logging the exposed value.
    pub fn api_token(&self) -> &SecureString {
        &self.credentials.api_token
    }

    /// Get the HTTP request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the retry policy described by these settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.settings.max_retries)
            .with_min_wait(self.retry_min_wait)
            .with_multiplier(self.settings.retry_multiplier);
        match self.settings.retry_max_wait {
            Some(max) => policy.with_max_wait(Duration::from_secs(max)),
            None => policy,
        }
    }
}

fn whole_seconds_ceil(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Where the active credentials came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Environment,
    File(PathBuf),
}

/// Resolves MaskHub configuration from the environment and config files.
#[derive(Debug, Clone)]
pub struct MaskHubConfigManager {
    credentials: Option<MaskHubCredentials>,
    settings: MaskHubSettings,
    source: Option<ConfigSource>,
}

impl MaskHubConfigManager {
    /// Resolve configuration from the process environment and the standard file locations.
    pub fn load(config_path: Option<&Path>) -> Self {
        Self::load_with(config_path, &Self::default_config_paths(), |key| {
            std::env::var(key).ok()
        })
    }

    /// Resolve configuration with explicit search paths and variable lookup.
    pub fn load_with<F>(config_path: Option<&Path>, default_paths: &[PathBuf], lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut manager = Self {
            credentials: None,
            settings: MaskHubSettings::default(),
            source: None,
        };

        let candidates = config_path
            .map(Path::to_path_buf)
            .into_iter()
            .chain(default_paths.iter().cloned());

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match load_config_file(&path) {
                Ok((credentials, settings)) => {
                    info!(path = %path.display(), "Loaded MaskHub configuration");
                    manager.credentials = Some(credentials);
                    manager.settings = settings;
                    manager.source = Some(ConfigSource::File(path));
                    break;
                }
                Err(e) => error!(path = %path.display(), "Failed to load config: {}", e),
            }
        }

        if let Some(credentials) = MaskHubCredentials::from_lookup(&lookup) {
            info!("Loaded MaskHub credentials from environment variables");
            manager.credentials = Some(credentials);
            manager.source = Some(ConfigSource::Environment);
        }
        manager.settings.apply_overrides(&lookup);

        if manager.credentials.is_none() {
            warn!("No MaskHub configuration found");
        }
        manager
    }

    /// The standard config file locations, most specific first.
    pub fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(3);
        if let Some(dirs) = BaseDirs::new() {
            paths.push(dirs.home_dir().join(".edwa").join("maskhub_config.json"));
        }
        paths.push(Path::new("config").join("maskhub_config.json"));
        paths.push(PathBuf::from("maskhub_config.json"));
        paths
    }

    pub fn credentials(&self) -> Option<&MaskHubCredentials> {
        self.credentials.as_ref()
    }

    pub fn settings(&self) -> &MaskHubSettings {
        &self.settings
    }

    pub fn source(&self) -> Option<&ConfigSource> {
        self.source.as_ref()
    }

    /// Set credentials programmatically.
    pub fn set_credentials(&mut self, credentials: MaskHubCredentials) {
        self.credentials = Some(credentials);
    }

    pub fn update_settings(&mut self, settings: MaskHubSettings) {
        self.settings = settings;
    }

    /// The full connection config, if credentials were found.
    pub fn config(&self) -> Option<MaskHubConfig> {
        self.credentials
            .clone()
            .map(|c| MaskHubConfig::new(c).with_settings(self.settings.clone()))
    }

    /// Save the current credentials and settings as JSON.
    pub fn save_configuration(&self, path: &Path) -> MaskHubResult<()> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| MaskHubError::Configuration {
                message: "No credentials to save".to_string(),
            })?;

        let document = serde_json::json!({
            "credentials": credentials.to_file_block(),
            "settings": self.settings,
        });
        write_json(path, &document)?;
        info!(path = %path.display(), "Saved MaskHub configuration");
        Ok(())
    }

    /// Write an example configuration file with placeholder credentials.
    pub fn create_example_config(path: &Path) -> MaskHubResult<()> {
        let document = serde_json::json!({
            "credentials": {
                "api_url": "https://maskhub.example.com/api",
                "api_v3_url": "https://maskhub.example.com/api/v3",
                "api_token": "your-api-token-here",
            },
            "settings": MaskHubSettings::default(),
        });
        write_json(path, &document)?;
        info!(path = %path.display(), "Created example MaskHub configuration");
        Ok(())
    }
}

/// Parse a config file holding either `{credentials, settings}` or bare credentials.
fn load_config_file(path: &Path) -> MaskHubResult<(MaskHubCredentials, MaskHubSettings)> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| MaskHubError::storage(&format!("reading {}", path.display()), e))?;
    let mut value: serde_json::Value = serde_json::from_str(&raw)?;

    let settings = match value.get_mut("settings").map(serde_json::Value::take) {
        Some(s) => serde_json::from_value(s)?,
        None => MaskHubSettings::default(),
    };
    let block = match value.get_mut("credentials").map(serde_json::Value::take) {
        Some(c) => c,
        None => value,
    };
    let credentials: CredentialsFile =
        serde_json::from_value(block).map_err(|e| MaskHubError::Configuration {
            message: format!("invalid credentials in {}: {e}", path.display()),
        })?;

    Ok((MaskHubCredentials::from_file_block(credentials), settings))
}

fn write_json(path: &Path, document: &serde_json::Value) -> MaskHubResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| MaskHubError::storage("creating config directory", e))?;
    }
    let text = serde_json::to_string_pretty(document)?;
    std::fs::write(path, text)
        .map_err(|e| MaskHubError::storage(&format!("writing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const FULL_ENV: &[(&str, &str)] = &[
        ("MASKHUB_API", "https://env.example/api"),
        ("MASKHUB_API_V3", "https://env.example/api/v3"),
        ("MASKHUB_API_TOKEN", "env-token"),
    ];

    #[test]
    fn test_settings_defaults() {
        let settings = MaskHubSettings::default();
        assert_eq!(settings.timeout, 30);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.retry_multiplier, 2.0);
        assert_eq!(settings.retry_min_wait, 15);
    }

    #[test]
    fn test_credentials_from_lookup_requires_all_variables() {
        assert!(MaskHubCredentials::from_lookup(env(FULL_ENV)).is_some());
        assert!(MaskHubCredentials::from_lookup(env(&FULL_ENV[..2])).is_none());
        assert!(MaskHubCredentials::from_lookup(env(&[
            ("MASKHUB_API", "a"),
            ("MASKHUB_API_V3", "b"),
            ("MASKHUB_API_TOKEN", "  "),
        ]))
        .is_none());
    }

    #[test]
    fn test_no_configuration_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            MaskHubConfigManager::load_with(None, &[dir.path().join("missing.json")], env(&[]));
        assert!(manager.credentials().is_none());
        assert!(manager.config().is_none());
        assert!(manager.source().is_none());
    }

    #[test]
    fn test_load_nested_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maskhub_config.json");
        std::fs::write(
            &path,
            r#"{
                "credentials": {"api_url": "https://f/api", "api_v3_url": "https://f/api/v3", "api_token": "file-token"},
                "settings": {"timeout": 10, "max_retries": 3}
            }"#,
        )
        .unwrap();

        let manager = MaskHubConfigManager::load_with(Some(&path), &[], env(&[]));
        let credentials = manager.credentials().unwrap();
        assert_eq!(credentials.api_url, "https://f/api");
        assert_eq!(credentials.api_token.expose(), "file-token");
        assert_eq!(manager.settings().timeout, 10);
        assert_eq!(manager.settings().max_retries, 3);
        assert_eq!(manager.settings().retry_min_wait, 15);
        assert_eq!(manager.source(), Some(&ConfigSource::File(path)));
    }

    #[test]
    fn test_load_flat_credentials_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.json");
        std::fs::write(
            &path,
            r#"{"api_url": "https://f/api", "api_v3_url": "https://f/api/v3", "api_token": "t"}"#,
        )
        .unwrap();

        let manager = MaskHubConfigManager::load_with(None, &[path], env(&[]));
        assert!(manager.credentials().is_some());
        assert_eq!(manager.settings(), &MaskHubSettings::default());
    }

    #[test]
    fn test_invalid_file_falls_through_to_next_location() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.json");
        let good = dir.path().join("good.json");
        std::fs::write(&broken, "{not json").unwrap();
        std::fs::write(
            &good,
            r#"{"api_url": "u", "api_v3_url": "v", "api_token": "t"}"#,
        )
        .unwrap();

        let manager = MaskHubConfigManager::load_with(None, &[broken, good.clone()], env(&[]));
        assert_eq!(manager.source(), Some(&ConfigSource::File(good)));
    }

    #[test]
    fn test_environment_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maskhub_config.json");
        std::fs::write(
            &path,
            r#"{"credentials": {"api_url": "file", "api_v3_url": "file", "api_token": "file"},
                "settings": {"timeout": 10}}"#,
        )
        .unwrap();

        let mut pairs = FULL_ENV.to_vec();
        pairs.push(("MASKHUB_TIMEOUT", "45"));
        pairs.push(("MASKHUB_RETRY_MIN_WAIT", "not-a-number"));

        let manager = MaskHubConfigManager::load_with(Some(&path), &[], env(&pairs));
        assert_eq!(manager.credentials().unwrap().api_token.expose(), "env-token");
        assert_eq!(manager.source(), Some(&ConfigSource::Environment));
        assert_eq!(manager.settings().timeout, 45);
        assert_eq!(manager.settings().retry_min_wait, 15);
    }

    #[test]
    fn test_save_and_reload_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("saved.json");

        let mut manager = MaskHubConfigManager::load_with(None, &[], env(&[]));
        assert!(manager.save_configuration(&path).is_err());

        manager.set_credentials(MaskHubCredentials::new("u", "v", "secret"));
        manager.save_configuration(&path).unwrap();

        let reloaded = MaskHubConfigManager::load_with(Some(&path), &[], env(&[]));
        assert_eq!(reloaded.credentials().unwrap().api_token.expose(), "secret");
    }

    #[test]
    fn test_example_config_is_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maskhub_config.example.json");
        MaskHubConfigManager::create_example_config(&path).unwrap();

        let manager = MaskHubConfigManager::load_with(Some(&path), &[], env(&[]));
        assert_eq!(
            manager.credentials().unwrap().api_token.expose(),
            "your-api-token-here"
        );
    }

    #[test]
    fn test_config_urls_and_policy() {
        let config = MaskHubConfig::new(MaskHubCredentials::new(
            "https://h/api/",
            "https://h/api/v3/",
            "t",
        ))
        .with_timeout(Duration::from_secs(12))
        .with_max_retries(3)
        .with_backoff(Duration::from_secs(1), 3.0);

        assert_eq!(config.api_url(), "https://h/api");
        assert_eq!(config.api_v3_url(), "https://h/api/v3");
        assert_eq!(config.timeout(), Duration::from_secs(12));

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(3));
    }

    #[test]
    fn test_sub_second_durations_are_not_truncated() {
        let config = MaskHubConfig::new(MaskHubCredentials::new("u", "v", "t"))
            .with_timeout(Duration::from_millis(250))
            .with_backoff(Duration::from_millis(10), 2.0);

        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.settings().timeout, 1);
        assert_eq!(config.retry_policy().delay_for(1), Duration::from_millis(10));
        assert_eq!(config.settings().retry_min_wait, 1);
    }

    #[test]
    fn test_api_token_not_leaked_in_debug() {
        let config = MaskHubConfig::new(MaskHubCredentials::new("u", "v", "super-secret-token"));
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("super-secret-token"));
        assert!(debug_output.contains("SecureString(***)"));
    }
}
