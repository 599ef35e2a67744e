//! Messenger configuration: defaults, TOML file, environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Per-instance settings.
/// Env overrides: POSTBRIDGE_CLIENT_NAME, POSTBRIDGE_ENABLE_LOGGING,
/// POSTBRIDGE_USE_ENCRYPTION, POSTBRIDGE_MAX_RESPONSE_TIME_MS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessengerConfig {
    /// Name announced to peers and attached to log events (default "unknown").
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Emit tracing events for this instance (default false).
    #[serde(default)]
    pub enable_logging: bool,
    /// Encrypt every non-handshake message once connected (default true).
    #[serde(default = "default_use_encryption")]
    pub use_encryption: bool,
    /// Default deadline for a request's response, in milliseconds (default 10000).
    #[serde(default = "default_max_response_time_ms")]
    pub max_response_time_ms: u64,
}

fn default_client_name() -> String {
    "unknown".to_string()
}
fn default_use_encryption() -> bool {
    true
}
fn default_max_response_time_ms() -> u64 {
    10_000
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            enable_logging: false,
            use_encryption: default_use_encryption(),
            max_response_time_ms: default_max_response_time_ms(),
        }
    }
}

impl MessengerConfig {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            ..Self::default()
        }
    }

    pub fn with_encryption(mut self, use_encryption: bool) -> Self {
        self.use_encryption = use_encryption;
        self
    }

    pub fn with_logging(mut self, enable_logging: bool) -> Self {
        self.enable_logging = enable_logging;
        self
    }

    pub fn with_max_response_time(mut self, max: Duration) -> Self {
        self.max_response_time_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_response_time(&self) -> Duration {
        Duration::from_millis(self.max_response_time_ms)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::Parse)
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&s)
    }

    /// Apply POSTBRIDGE_* variables from the process environment. Unparsable values are ignored.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(name) = var("POSTBRIDGE_CLIENT_NAME") {
            if !name.is_empty() {
                self.client_name = name;
            }
        }
        if let Some(b) = var("POSTBRIDGE_ENABLE_LOGGING").and_then(|s| parse_bool(&s)) {
            self.enable_logging = b;
        }
        if let Some(b) = var("POSTBRIDGE_USE_ENCRYPTION").and_then(|s| parse_bool(&s)) {
            self.use_encryption = b;
        }
        if let Some(ms) = var("POSTBRIDGE_MAX_RESPONSE_TIME_MS").and_then(|s| s.parse::<u64>().ok()) {
            self.max_response_time_ms = ms;
        }
        self
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = MessengerConfig::default();
        assert_eq!(c.client_name, "unknown");
        assert!(!c.enable_logging);
        assert!(c.use_encryption);
        assert_eq!(c.max_response_time(), Duration::from_secs(10));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = MessengerConfig::from_toml_str("client_name = \"frame\"\nuse_encryption = false\n")
            .unwrap();
        assert_eq!(c.client_name, "frame");
        assert!(!c.use_encryption);
        assert_eq!(c.max_response_time_ms, 10_000);
    }

    #[test]
    fn oversized_response_time_saturates() {
        let c = MessengerConfig::default().with_max_response_time(Duration::MAX);
        assert_eq!(c.max_response_time_ms, u64::MAX);
        let c = c.with_max_response_time(Duration::from_millis(250));
        assert_eq!(c.max_response_time(), Duration::from_millis(250));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(matches!(
            MessengerConfig::from_toml_str("clientName = \"x\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            MessengerConfig::load_file("/nonexistent/postbridge.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("POSTBRIDGE_CLIENT_NAME", "page"),
            ("POSTBRIDGE_ENABLE_LOGGING", "yes"),
            ("POSTBRIDGE_USE_ENCRYPTION", "maybe"),
            ("POSTBRIDGE_MAX_RESPONSE_TIME_MS", "250"),
        ]
        .into_iter()
        .collect();
        let c = MessengerConfig::default()
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.client_name, "page");
        assert!(c.enable_logging);
        assert!(c.use_encryption);
        assert_eq!(c.max_response_time_ms, 250);
    }
}
