//! Configuration handling for the chatlink client.
//!
//! Settings come from a YAML file, then `CHATLINK_*` environment variables,
//! then command line flags (applied in `main`), each layer overriding the
//! previous one.

use anyhow::{Context, Result};
use chatlink_session::{SelectorConfig, DEFAULT_RECONNECT_DELAY};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (`host:port`)
    pub server: String,
    /// Account to log in as
    pub account: String,
    /// Account password
    #[serde(skip_serializing)]
    pub password: String,
    /// TCP connect timeout
    #[serde(with = "humantime_duration")]
    pub connect_timeout: Duration,
    /// Timeout for request/response exchanges
    #[serde(with = "humantime_duration")]
    pub request_timeout: Duration,
    /// Reconnection policy
    pub selector: SelectorSection,
    /// Heartbeat settings
    pub heartbeat: HeartbeatSection,
    /// Session key refresh settings
    pub key_refresh: KeyRefreshSection,
    /// TLS settings
    pub tls: TlsSection,
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    /// Attempts per wait; unbounded when absent
    pub max_attempts: Option<u32>,
    /// Pause between reconnects
    #[serde(with = "humantime_duration")]
    pub reconnect_delay: Duration,
    /// Verbose selector logging
    pub logging: bool,
}

/// Heartbeat settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    /// Interval between pings
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
    /// How long to wait for a pong
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
}

/// Session key refresh settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyRefreshSection {
    /// Whether to refresh keys at all
    pub enabled: bool,
    /// Maximum time between refreshes
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
}

/// TLS settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to the CA certificate bundle (PEM)
    pub ca_file: String,
    /// Name to verify the server certificate against; defaults to the server host
    pub server_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:7070".to_string(),
            account: String::new(),
            password: String::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            selector: SelectorSection::default(),
            heartbeat: HeartbeatSection::default(),
            key_refresh: KeyRefreshSection::default(),
            tls: TlsSection::default(),
        }
    }
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            logging: false,
        }
    }
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for KeyRefreshSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
        }
    }
}

impl ClientConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: ClientConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply `CHATLINK_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server) = lookup("CHATLINK_SERVER") {
            info!("Server overridden by environment: {}", server);
            self.server = server;
        }

        if let Some(account) = lookup("CHATLINK_ACCOUNT") {
            info!("Account overridden by environment: {}", account);
            self.account = account;
        }

        if let Some(password) = lookup("CHATLINK_PASSWORD") {
            self.password = password;
        }

        if let Some(value) = lookup("CHATLINK_SELECTOR_MAX_ATTEMPTS") {
            match value.parse::<u32>() {
                Ok(attempts) if attempts > 0 => self.selector.max_attempts = Some(attempts),
                _ => warn!("Ignoring invalid CHATLINK_SELECTOR_MAX_ATTEMPTS: {}", value),
            }
        }

        if let Some(value) = lookup("CHATLINK_RECONNECT_DELAY_MS") {
            match value.parse::<u64>() {
                Ok(ms) => self.selector.reconnect_delay = Duration::from_millis(ms),
                Err(_) => warn!("Ignoring invalid CHATLINK_RECONNECT_DELAY_MS: {}", value),
            }
        }

        if let Some(value) = lookup("CHATLINK_SELECTOR_LOGGING") {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.selector.logging = true,
                "0" | "false" | "no" | "off" => self.selector.logging = false,
                _ => warn!("Ignoring invalid CHATLINK_SELECTOR_LOGGING: {}", value),
            }
        }
    }

    /// Reconnection policy for the session
    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            max_attempts: self.selector.max_attempts.unwrap_or(u32::MAX),
            reconnect_delay: self.selector.reconnect_delay,
            logging: self.selector.logging,
        }
    }

    /// Name for TLS verification: the configured one, else the host part of `server`
    pub fn tls_server_name(&self) -> String {
        if !self.tls.server_name.is_empty() {
            return self.tls.server_name.clone();
        }
        match self.server.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']').to_string(),
            None => self.server.clone(),
        }
    }

    /// Check that the configuration can be used to log in
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            anyhow::bail!("No server address configured");
        }
        if self.account.is_empty() {
            anyhow::bail!("No account configured (use --account or CHATLINK_ACCOUNT)");
        }
        if self.password.is_empty() {
            anyhow::bail!("No password configured (use --password or CHATLINK_PASSWORD)");
        }
        if self.tls.enabled && self.tls.ca_file.is_empty() {
            anyhow::bail!("TLS enabled but no CA file configured");
        }
        Ok(())
    }
}

/// Durations written as `30s`, `1m 30s`, `250ms`
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.server, "127.0.0.1:7070");
        assert_eq!(config.selector.reconnect_delay, Duration::from_millis(3000));
        assert_eq!(config.selector_config().max_attempts, u32::MAX);
        assert!(config.key_refresh.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
server: chat.example.org:7443
account: alice
password: hunter2
request_timeout: 5s
selector:
  max_attempts: 5
  reconnect_delay: 500ms
  logging: true
heartbeat:
  interval: 30s
tls:
  enabled: true
  ca_file: /etc/chatlink/ca.pem
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = ClientConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.server, "chat.example.org:7443");
        assert_eq!(config.account, "alice");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat.timeout, Duration::from_secs(10));
        assert_eq!(config.tls_server_name(), "chat.example.org");
        assert!(config.validate().is_ok());

        let selector = config.selector_config();
        assert_eq!(selector.max_attempts, 5);
        assert_eq!(selector.reconnect_delay, Duration::from_millis(500));
        assert!(selector.logging);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load_from_file(dir.path().join("missing.yaml")).unwrap();
        assert_eq!(config.server, ClientConfig::default().server);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"heartbeat:\n  interval: often\n").unwrap();
        assert!(ClientConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CHATLINK_SERVER", "10.0.0.5:7070"),
            ("CHATLINK_PASSWORD", "from-env"),
            ("CHATLINK_SELECTOR_MAX_ATTEMPTS", "0"),
            ("CHATLINK_RECONNECT_DELAY_MS", "100"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.server, "10.0.0.5:7070");
        assert_eq!(config.password, "from-env");
        assert_eq!(config.selector.max_attempts, None);
        assert_eq!(config.selector.reconnect_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_password_never_serialized() {
        let config = ClientConfig {
            password: "hunter2".into(),
            ..ClientConfig::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("hunter2"));
    }

    #[test]
    fn test_validate_requires_credentials() {
        let config = ClientConfig::default();
        assert!(config.validate().is_err());
    }
}
