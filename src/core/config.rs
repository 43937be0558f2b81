use crate::core::kernel::framer::FramingMode;
use encoding_rs::Encoding;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::time::Duration;

/// QUIK sends its messages in the Windows Cyrillic codepage.
pub const DEFAULT_ENCODING: &str = "windows-1251";
pub const DEFAULT_BUFFER_SIZE: usize = 65_536;

#[derive(Debug, Clone)]
pub struct QuikConfig {
    pub host: String,
    pub port: u16,
    pub password: Secret<String>,
    pub account: String,
    pub client_code: Option<String>,
    pub encoding: String,
    pub buffer_size: usize,
    pub framing: FramingMode,
    pub connect_timeout: Option<Duration>,
    pub auth_timeout: Option<Duration>,
    pub transaction_ttl: Option<Duration>,
    pub log_level: String,
}

// Custom Serialize implementation - never expose secrets in serialization
impl Serialize for QuikConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("QuikConfig", 12)?;
        state.serialize_field("host", &self.host)?;
        state.serialize_field("port", &self.port)?;
        state.serialize_field("password", "[REDACTED]")?;
        state.serialize_field("account", &self.account)?;
        state.serialize_field("client_code", &self.client_code)?;
        state.serialize_field("encoding", &self.encoding)?;
        state.serialize_field("buffer_size", &self.buffer_size)?;
        state.serialize_field("framing", &self.framing)?;
        state.serialize_field("connect_timeout_ms", &duration_ms(self.connect_timeout))?;
        state.serialize_field("auth_timeout_ms", &duration_ms(self.auth_timeout))?;
        state.serialize_field("transaction_ttl_ms", &duration_ms(self.transaction_ttl))?;
        state.serialize_field("log_level", &self.log_level)?;
        state.end()
    }
}

// Custom Deserialize implementation
impl<'de> Deserialize<'de> for QuikConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct QuikConfigHelper {
            host: String,
            port: u16,
            password: String,
            account: String,
            #[serde(default)]
            client_code: Option<String>,
            #[serde(default)]
            encoding: Option<String>,
            #[serde(default)]
            buffer_size: Option<usize>,
            #[serde(default)]
            framing: Option<FramingMode>,
            #[serde(default)]
            connect_timeout_ms: Option<u64>,
            #[serde(default)]
            auth_timeout_ms: Option<u64>,
            #[serde(default)]
            transaction_ttl_ms: Option<u64>,
            #[serde(default)]
            log_level: Option<String>,
        }

        let helper = QuikConfigHelper::deserialize(deserializer)?;
        let mut config = Self::new(helper.host, helper.port, helper.password, helper.account);
        config.client_code = helper.client_code;
        if let Some(encoding) = helper.encoding {
            config.encoding = encoding;
        }
        if let Some(buffer_size) = helper.buffer_size {
            config.buffer_size = buffer_size;
        }
        if let Some(framing) = helper.framing {
            config.framing = framing;
        }
        config.connect_timeout = helper.connect_timeout_ms.map(Duration::from_millis);
        config.auth_timeout = helper.auth_timeout_ms.map(Duration::from_millis);
        config.transaction_ttl = helper.transaction_ttl_ms.map(Duration::from_millis);
        if let Some(log_level) = helper.log_level {
            config.log_level = log_level;
        }
        Ok(config)
    }
}

impl QuikConfig {
    /// Create a new configuration for one terminal endpoint and trading account
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            password: Secret::new(password.into()),
            account: account.into(),
            client_code: None,
            encoding: DEFAULT_ENCODING.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            framing: FramingMode::default(),
            connect_timeout: None,
            auth_timeout: None,
            transaction_ttl: None,
            log_level: "info".to_string(),
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_HOST`, `{PREFIX}_PORT`
    /// - `{PREFIX}_PASSWORD` - shared secret checked by the terminal script
    /// - `{PREFIX}_ACCOUNT`
    /// - `{PREFIX}_CLIENT_CODE` (optional, defaults to the account)
    /// - `{PREFIX}_ENCODING` (optional, defaults to `windows-1251`)
    /// - `{PREFIX}_CONNECT_TIMEOUT_MS`, `{PREFIX}_AUTH_TIMEOUT_MS`,
    ///   `{PREFIX}_TRANSACTION_TTL_MS` (optional, disabled when unset)
    /// - `{PREFIX}_LOG_LEVEL` (optional, defaults to `info`)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let var = |name: &str| format!("{}_{}", prefix, name);

        let host = required(&var("HOST"))?;
        let port_var = var("PORT");
        let port = required(&port_var)?
            .parse::<u16>()
            .map_err(|e| ConfigError::InvalidConfiguration(format!("{}: {}", port_var, e)))?;
        let password = required(&var("PASSWORD"))?;
        let account = required(&var("ACCOUNT"))?;

        let mut config = Self::new(host, port, password, account);
        config.client_code = env::var(var("CLIENT_CODE")).ok();
        if let Ok(encoding) = env::var(var("ENCODING")) {
            config.encoding = encoding;
        }
        config.connect_timeout = optional_millis(&var("CONNECT_TIMEOUT_MS"))?;
        config.auth_timeout = optional_millis(&var("AUTH_TIMEOUT_MS"))?;
        config.transaction_ttl = optional_millis(&var("TRANSACTION_TTL_MS"))?;
        if let Ok(level) = env::var(var("LOG_LEVEL")) {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Create configuration from .env file and environment variables
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    /// Create configuration from a specific .env file path
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(()) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // No file, fall back to the process environment
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    /// Check the values a connector cannot work without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "host cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "port cannot be 0".to_string(),
            ));
        }
        if self.account.trim().is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "account cannot be empty".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "buffer_size cannot be 0".to_string(),
            ));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("auth_timeout", self.auth_timeout),
            ("transaction_ttl", self.transaction_ttl),
        ] {
            if value == Some(Duration::ZERO) {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "{} cannot be 0",
                    name
                )));
            }
        }
        self.text_encoding()?;
        Ok(())
    }

    /// Resolve the configured codepage label
    pub fn text_encoding(&self) -> Result<&'static Encoding, ConfigError> {
        Encoding::for_label(self.encoding.as_bytes())
            .ok_or_else(|| ConfigError::UnknownEncoding(self.encoding.clone()))
    }

    /// Client code sent with transactions; QUIK accounts usually reuse the account id
    pub fn client_code(&self) -> &str {
        self.client_code.as_deref().unwrap_or(&self.account)
    }

    /// Get the terminal password (use carefully - exposes secret)
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn with_client_code(mut self, client_code: impl Into<String>) -> Self {
        self.client_code = Some(client_code.into());
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    #[must_use]
    pub const fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    #[must_use]
    pub const fn with_framing(mut self, framing: FramingMode) -> Self {
        self.framing = framing;
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_transaction_ttl(mut self, ttl: Duration) -> Self {
        self.transaction_ttl = Some(ttl);
        self
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvironmentVariable(name.to_string()))
}

fn optional_millis(name: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| ConfigError::InvalidConfiguration(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

fn duration_ms(duration: Option<Duration>) -> Option<u64> {
    duration.map(|d| d.as_millis() as u64)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown text encoding: {0}")]
    UnknownEncoding(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QuikConfig {
        QuikConfig::new("127.0.0.1", 1111, "secret", "SPBFUT00998")
    }

    #[test]
    fn test_defaults() {
        let config = config();
        assert_eq!(config.client_code(), "SPBFUT00998");
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.framing, FramingMode::CarryOver);
        assert!(config.connect_timeout.is_none());
        assert!(config.auth_timeout.is_none());
        assert!(config.transaction_ttl.is_none());
        assert_eq!(config.text_encoding().unwrap(), encoding_rs::WINDOWS_1251);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialization_redacts_password() {
        let json = serde_json::to_string(&config()).unwrap();
        assert!(json.contains("[REDACTED]"));
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_deserialize_wraps_password() {
        let config: QuikConfig = serde_json::from_str(
            r#"{"host":"10.0.0.5","port":34130,"password":"pw","account":"A1","auth_timeout_ms":500}"#,
        )
        .unwrap();
        assert_eq!(config.password(), "pw");
        assert_eq!(config.auth_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.encoding, DEFAULT_ENCODING);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(config().with_buffer_size(0).validate().is_err());
        assert!(matches!(
            config().with_encoding("klingon").validate(),
            Err(ConfigError::UnknownEncoding(_))
        ));
        assert!(QuikConfig::new("", 1, "p", "a").validate().is_err());
        assert!(QuikConfig::new("h", 0, "p", "a").validate().is_err());
        assert!(config()
            .with_transaction_ttl(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_client_code_override() {
        let config = config().with_client_code("CLIENT1");
        assert_eq!(config.client_code(), "CLIENT1");
    }
}
