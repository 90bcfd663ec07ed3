use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur while configuring or running the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// A payload that failed validation. Nothing from the request is published.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", self.describe())]
pub struct ValidationError {
    /// Offending element of a batch submission, if any.
    pub index: Option<usize>,
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            index: None,
            message: message.into(),
        }
    }

    pub fn at(index: usize, message: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            message: message.into(),
        }
    }

    fn describe(&self) -> String {
        match self.index {
            Some(index) => format!("event at index {}: {}", index, self.message),
            None => self.message.clone(),
        }
    }
}

/// Failure to hand an event to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Broker unavailable, throttled or slow. Worth retrying.
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// Rejected outright, or retries exhausted.
    #[error("permanent publish failure: {0}")]
    Permanent(String),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

impl From<redis::RedisError> for PublishError {
    fn from(err: redis::RedisError) -> Self {
        let transient = err.is_io_error()
            || err.is_timeout()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || matches!(
                err.kind(),
                redis::ErrorKind::TryAgain
                    | redis::ErrorKind::BusyLoadingError
                    | redis::ErrorKind::ClusterDown
            );

        if transient {
            PublishError::Transient(err.to_string())
        } else {
            PublishError::Permanent(err.to_string())
        }
    }
}
