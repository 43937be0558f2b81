use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuikError {
    #[error("Network error: {0}")]
    NetworkError(#[from] std::io::Error),

    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Not connected to terminal")]
    NotConnected,

    #[error("Connector is already running")]
    AlreadyRunning,

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Authentication response not received in time")]
    AuthTimeout,

    #[error("Validation error: {0}")]
    ValidationError(#[from] crate::core::types::TypesError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),
}

impl QuikError {
    /// Whether this error ends the current session.
    ///
    /// Decode failures of a single read or fragment are logged and skipped by
    /// the receive loop; everything transport- or auth-related tears it down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NetworkError(_)
            | Self::ConnectionTimeout(_)
            | Self::ConnectionClosed
            | Self::AuthError(_)
            | Self::AuthTimeout => true,
            Self::NotConnected
            | Self::AlreadyRunning
            | Self::EncodingError(_)
            | Self::JsonError(_)
            | Self::DeserializationError(_)
            | Self::ValidationError(_)
            | Self::ConfigError(_) => false,
        }
    }
}
