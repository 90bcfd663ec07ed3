use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    broker::{Destination, EventPublisher, MessageProperties, PublishReceipt},
    error::{GatewayError, PublishError, Result},
    event::EventRecord,
};

const CONTENT_TYPE_JSON: &str = "application/json";

/// Redis broker configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
    /// Approximate cap on topic stream length (`XADD ... MAXLEN ~`)
    pub stream_max_len: usize,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Some(Duration::from_secs(5)),
            command_timeout: Some(Duration::from_secs(1)),
            stream_max_len: 100_000,
            key_prefix: String::new(),
        }
    }
}

/// What is written to a queue: the event plus its message properties
#[derive(Debug, Serialize)]
struct QueueEnvelope<'a> {
    content_type: &'static str,
    properties: MessageProperties,
    body: &'a EventRecord,
}

/// Broker backed by Redis.
///
/// Queues are lists (`LPUSH`), topics are streams (`XADD`).
#[derive(Clone)]
pub struct RedisBroker {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisBroker {
    /// Connect and verify the server answers `PING`
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis broker for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            GatewayError::Redis(e)
        })?;

        let connect_timeout = config.connection_timeout.unwrap_or(Duration::from_secs(10));
        let connection = match tokio::time::timeout(connect_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(GatewayError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}s)",
                    connect_timeout.as_secs()
                );
                return Err(GatewayError::Broker(
                    "Timeout while creating Redis connection manager".to_string(),
                ));
            }
        };

        let broker = Self { connection, config };
        broker.health_check().await.map_err(|e| {
            warn!("Redis PING failed: {}", e);
            GatewayError::Broker(e.to_string())
        })?;

        info!("Redis broker initialized successfully");
        Ok(broker)
    }

    fn key_for(&self, destination: &Destination) -> String {
        format!("{}{}", self.config.key_prefix, destination.name())
    }

    async fn push_to_queue(&self, key: &str, record: &EventRecord) -> std::result::Result<PublishReceipt, PublishError> {
        let envelope = QueueEnvelope {
            content_type: CONTENT_TYPE_JSON,
            properties: MessageProperties::from_record(record),
            body: record,
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| PublishError::Permanent(format!("failed to encode event: {}", e)))?;

        let mut conn = self.connection.clone();
        let depth: i64 = conn.lpush(key, payload).await?;
        debug!(queue = key, depth, event_id = %record.event_id, "Pushed event to queue");

        Ok(PublishReceipt {
            broker_message_id: None,
        })
    }

    async fn add_to_stream(&self, key: &str, record: &EventRecord) -> std::result::Result<PublishReceipt, PublishError> {
        let properties = MessageProperties::from_record(record);
        let payload = serde_json::to_vec(record)
            .map_err(|e| PublishError::Permanent(format!("failed to encode event: {}", e)))?;

        let mut conn = self.connection.clone();
        let stream_id: String = redis::cmd("XADD")
            .arg(key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.stream_max_len as i64)
            .arg("*")
            .arg("event_id")
            .arg(&record.event_id)
            .arg("event_type")
            .arg(&properties.event_type)
            .arg("source")
            .arg(&properties.source)
            .arg("correlation_id")
            .arg(&properties.correlation_id)
            .arg("timestamp")
            .arg(&properties.timestamp)
            .arg("content_type")
            .arg(CONTENT_TYPE_JSON)
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        debug!(stream = key, stream_id = %stream_id, event_id = %record.event_id, "Added event to stream");
        Ok(PublishReceipt {
            broker_message_id: Some(stream_id),
        })
    }
}

#[async_trait]
impl EventPublisher for RedisBroker {
    async fn publish(
        &self,
        destination: &Destination,
        record: &EventRecord,
    ) -> std::result::Result<PublishReceipt, PublishError> {
        let key = self.key_for(destination);
        match destination {
            Destination::Queue(_) => self.push_to_queue(&key, record).await,
            Destination::Topic(_) => self.add_to_stream(&key, record).await,
        }
    }

    async fn health_check(&self) -> std::result::Result<(), PublishError> {
        let mut conn = self.connection.clone();
        let timeout = self.config.command_timeout.unwrap_or(Duration::from_secs(5));
        match tokio::time::timeout(timeout, redis::cmd("PING").query_async::<_, ()>(&mut conn)).await {
            Ok(result) => result.map_err(PublishError::from),
            Err(_) => Err(PublishError::Transient(format!(
                "Redis PING timeout ({}ms)",
                timeout.as_millis()
            ))),
        }
    }
}
