//! Process settings read from the environment.

use axum::http::HeaderValue;
use config::{Config, Environment};
use serde::Deserialize;
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::{
    broker::{Destination, RetryPolicy},
    error::{GatewayError, Result},
    redis::RedisConfig,
    service::MAX_REQUEST_TIMEOUT,
};

const MAX_PUBLISH_ATTEMPTS: u32 = 20;
const MAX_PUBLISH_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    Redis,
    Memory,
}

/// Origins allowed to call the gateway from a browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsOrigins {
    Any,
    List(Vec<HeaderValue>),
}

impl CorsOrigins {
    /// Parse `*` or a comma separated list of origins
    pub fn parse(value: &str) -> Result<Self> {
        let origins: Vec<&str> = value
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .collect();

        if origins.is_empty() {
            return Err(GatewayError::Config(
                "CORS_ALLOW_ORIGINS must be * or a list of origins".to_string(),
            ));
        }
        if origins.contains(&"*") {
            return Ok(CorsOrigins::Any);
        }

        origins
            .into_iter()
            .map(|origin| {
                HeaderValue::from_str(origin).map_err(|_| {
                    GatewayError::Config(format!("invalid CORS origin: {:?}", origin))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(CorsOrigins::List)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub policy_path: PathBuf,
    pub policy_reload_interval_secs: u64,
    pub broker_backend: BrokerBackend,
    pub redis_url: String,
    pub broker_queue_name: String,
    pub broker_topic_name: Option<String>,
    pub default_event_source: String,
    pub max_batch_size: usize,
    pub publish_max_attempts: u32,
    pub publish_base_delay_ms: u64,
    pub publish_backoff_multiplier: f64,
    pub publish_max_delay_ms: u64,
    pub publish_attempt_timeout_ms: u64,
    pub request_timeout_ms: Option<u64>,
    pub trust_forwarded_for: bool,
    pub cors_allow_origins: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::load(Environment::default())
    }

    fn load(environment: Environment) -> Result<Self> {
        let settings: Settings = Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 8000)?
            .set_default("log_level", "info")?
            .set_default("policy_path", "config/policy.yaml")?
            .set_default("policy_reload_interval_secs", 30)?
            .set_default("broker_backend", "redis")?
            .set_default("redis_url", "redis://localhost:6379")?
            .set_default("broker_queue_name", "events")?
            .set_default("default_event_source", crate::event::DEFAULT_EVENT_SOURCE)?
            .set_default("max_batch_size", crate::event::DEFAULT_MAX_BATCH_SIZE as i64)?
            .set_default("publish_max_attempts", 3)?
            .set_default("publish_base_delay_ms", 100)?
            .set_default("publish_backoff_multiplier", 2.0)?
            .set_default("publish_max_delay_ms", 2000)?
            .set_default("publish_attempt_timeout_ms", 2000)?
            .set_default("trust_forwarded_for", false)?
            .set_default("cors_allow_origins", "*")?
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.publish_max_attempts == 0 {
            return Err(GatewayError::Config(
                "PUBLISH_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.publish_max_attempts > MAX_PUBLISH_ATTEMPTS {
            return Err(GatewayError::Config(format!(
                "PUBLISH_MAX_ATTEMPTS must be at most {}",
                MAX_PUBLISH_ATTEMPTS
            )));
        }
        for (name, value) in [
            ("PUBLISH_BASE_DELAY_MS", self.publish_base_delay_ms),
            ("PUBLISH_MAX_DELAY_MS", self.publish_max_delay_ms),
            ("PUBLISH_ATTEMPT_TIMEOUT_MS", self.publish_attempt_timeout_ms),
        ] {
            if value > MAX_PUBLISH_DELAY_MS {
                return Err(GatewayError::Config(format!(
                    "{} must be at most {}",
                    name, MAX_PUBLISH_DELAY_MS
                )));
            }
        }
        if !self.publish_backoff_multiplier.is_finite() || self.publish_backoff_multiplier < 1.0 {
            return Err(GatewayError::Config(
                "PUBLISH_BACKOFF_MULTIPLIER must be a finite number >= 1".to_string(),
            ));
        }
        if let Some(ms) = self.request_timeout_ms {
            if ms == 0 || ms > MAX_REQUEST_TIMEOUT.as_millis() as u64 {
                return Err(GatewayError::Config(format!(
                    "REQUEST_TIMEOUT_MS must be between 1 and {}",
                    MAX_REQUEST_TIMEOUT.as_millis()
                )));
            }
        }
        if self.max_batch_size == 0 {
            return Err(GatewayError::Config(
                "MAX_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        if self.broker_queue_name.trim().is_empty() && self.broker_topic_name.is_none() {
            return Err(GatewayError::Config(
                "a broker queue or topic name is required".to_string(),
            ));
        }
        self.cors_origins()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| GatewayError::Config(format!("invalid listen address: {}", e)))
    }

    pub fn destination(&self) -> Destination {
        Destination::from_names(&self.broker_queue_name, self.broker_topic_name.as_deref())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.publish_max_attempts,
            base_delay: Duration::from_millis(self.publish_base_delay_ms),
            multiplier: self.publish_backoff_multiplier,
            max_delay: Duration::from_millis(self.publish_max_delay_ms),
            attempt_timeout: Duration::from_millis(self.publish_attempt_timeout_ms),
        }
    }

    /// Ceiling on one request's total latency
    pub fn request_timeout(&self) -> Duration {
        match self.request_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.retry_policy().total_budget(),
        }
    }

    /// `None` disables hot reload
    pub fn policy_reload_interval(&self) -> Option<Duration> {
        (self.policy_reload_interval_secs > 0)
            .then(|| Duration::from_secs(self.policy_reload_interval_secs))
    }

    pub fn cors_origins(&self) -> Result<CorsOrigins> {
        CorsOrigins::parse(&self.cors_allow_origins)
    }

    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            url: self.redis_url.clone(),
            ..Default::default()
        }
    }
}
