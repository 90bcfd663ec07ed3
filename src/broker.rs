//! Broker publishing: the [`EventPublisher`] seam, bounded retry, and an
//! in-process backend.

use async_trait::async_trait;
use serde::Serialize;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{error::PublishError, event::EventRecord, metrics::Metrics};

/// Where accepted events go. A deployment uses either a queue or a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    /// A configured topic takes precedence over the queue name.
    pub fn from_names(queue: &str, topic: Option<&str>) -> Self {
        match topic.map(str::trim).filter(|t| !t.is_empty()) {
            Some(topic) => Destination::Topic(topic.to_string()),
            None => Destination::Queue(queue.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Destination::Queue(_) => "queue",
            Destination::Topic(_) => "topic",
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

/// Message properties carried alongside the body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageProperties {
    pub event_type: String,
    pub source: String,
    pub correlation_id: String,
    pub timestamp: String,
}

impl MessageProperties {
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            event_type: record.event_type.clone(),
            source: record.source.clone(),
            correlation_id: record.correlation_id.clone(),
            timestamp: record.timestamp.unwrap_or(record.received_at).to_rfc3339(),
        }
    }
}

/// Broker acknowledgement for one published event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Broker-assigned message identifier, when the broker provides one.
    pub broker_message_id: Option<String>,
}

/// Publish one event to a named destination
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        destination: &Destination,
        record: &EventRecord,
    ) -> Result<PublishReceipt, PublishError>;

    /// Whether the broker is currently reachable
    async fn health_check(&self) -> Result<(), PublishError>;
}

/// Bounded exponential backoff for transient publish failures
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// An attempt running longer than this counts as a transient failure.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, for `attempt` starting at 1
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let delay_ms = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms.round() as u64)
    }

    /// Worst-case time spent publishing one event
    pub fn total_budget(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let waits = (1..attempts)
            .map(|a| self.delay_after(a))
            .fold(Duration::ZERO, Duration::saturating_add);
        self.attempt_timeout.saturating_mul(attempts).saturating_add(waits)
    }
}

/// Wraps a publisher with per-attempt timeouts and bounded retries.
///
/// Transient failures are retried until `max_attempts` is reached, then
/// surfaced as [`PublishError::Permanent`]. Permanent failures are returned
/// immediately.
pub struct RetryingPublisher {
    inner: Arc<dyn EventPublisher>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl RetryingPublisher {
    pub fn new(inner: Arc<dyn EventPublisher>, policy: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            inner,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl EventPublisher for RetryingPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        record: &EventRecord,
    ) -> Result<PublishReceipt, PublishError> {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let outcome =
                match tokio::time::timeout(self.policy.attempt_timeout, self.inner.publish(destination, record)).await {
                    Ok(result) => result,
                    Err(_) => Err(PublishError::Transient(format!(
                        "publish attempt timed out after {}ms",
                        self.policy.attempt_timeout.as_millis()
                    ))),
                };

            match outcome {
                Ok(receipt) => {
                    self.metrics.record_publish_attempt("success");
                    if attempt > 1 {
                        info!(
                            destination = %destination,
                            correlation_id = %record.correlation_id,
                            attempt,
                            "Publish succeeded after retry"
                        );
                    }
                    return Ok(receipt);
                }
                Err(PublishError::Permanent(reason)) => {
                    self.metrics.record_publish_attempt("permanent_error");
                    error!(
                        destination = %destination,
                        correlation_id = %record.correlation_id,
                        error = %reason,
                        "Broker rejected event"
                    );
                    return Err(PublishError::Permanent(reason));
                }
                Err(PublishError::Transient(reason)) => {
                    self.metrics.record_publish_attempt("transient_error");
                    if attempt == max_attempts {
                        error!(
                            destination = %destination,
                            correlation_id = %record.correlation_id,
                            attempts = max_attempts,
                            error = %reason,
                            "Publish failed, retries exhausted"
                        );
                        return Err(PublishError::Permanent(format!(
                            "gave up after {} attempts: {}",
                            max_attempts, reason
                        )));
                    }

                    let backoff = self.policy.delay_after(attempt);
                    warn!(
                        destination = %destination,
                        correlation_id = %record.correlation_id,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %reason,
                        "Publish failed, will retry"
                    );
                    self.metrics.record_publish_retry();
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        Err(PublishError::Permanent("no publish attempt was made".to_string()))
    }

    async fn health_check(&self) -> Result<(), PublishError> {
        match tokio::time::timeout(self.policy.attempt_timeout, self.inner.health_check()).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Transient("health check timed out".to_string())),
        }
    }
}

/// In-process broker that records what it is given.
///
/// Used for local development (`BROKER_BACKEND=memory`) and tests; failures
/// and latency can be scripted.
#[derive(Default)]
pub struct InMemoryBroker {
    published: Mutex<Vec<(Destination, EventRecord)>>,
    scripted_failures: Mutex<VecDeque<PublishError>>,
    latency: Mutex<Option<Duration>>,
    unavailable: Mutex<bool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next publish calls, in order, with these errors
    pub async fn fail_next(&self, errors: impl IntoIterator<Item = PublishError>) {
        self.scripted_failures.lock().await.extend(errors);
    }

    /// Make every publish take at least `latency`
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().await = latency;
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().await = unavailable;
    }

    pub async fn published(&self) -> Vec<(Destination, EventRecord)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(
        &self,
        destination: &Destination,
        record: &EventRecord,
    ) -> Result<PublishReceipt, PublishError> {
        let latency = *self.latency.lock().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self.scripted_failures.lock().await.pop_front() {
            return Err(err);
        }

        let mut published = self.published.lock().await;
        published.push((destination.clone(), record.clone()));
        Ok(PublishReceipt {
            broker_message_id: Some(published.len().to_string()),
        })
    }

    async fn health_check(&self) -> Result<(), PublishError> {
        if *self.unavailable.lock().await {
            Err(PublishError::Transient("broker marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}
