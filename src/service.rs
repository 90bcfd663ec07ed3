use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::RwLock, time::Instant};
use tracing::{error, info, warn};

use crate::{
    admission::{AdmissionController, AdmissionDecision, AdmissionRequest},
    broker::{Destination, EventPublisher},
    error::{PublishError, ValidationError},
    event::{EventNormalizer, EventRecord},
    metrics::Metrics,
    utils::TimeSource,
};

/// Why an admitted submission was not (fully) accepted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("broker connection not available")]
    BrokerUnavailable,

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("request deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

/// A single accepted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedEvent {
    pub event_id: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub success: bool,
    pub event_id: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-item outcome of a batch submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub results: Vec<BatchItemResult>,
}

impl BatchReport {
    pub fn total_count(&self) -> usize {
        self.results.len()
    }

    pub fn successful_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.total_count() - self.successful_count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub broker_connected: bool,
    pub policy_version: u64,
}

/// Longest deadline a single request may be given
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(3_600);

/// Orchestrates admission, normalization and publishing for the HTTP layer
pub struct GatewayService {
    admission: AdmissionController,
    normalizer: EventNormalizer,
    publisher: RwLock<Option<Arc<dyn EventPublisher>>>,
    destination: Destination,
    metrics: Arc<Metrics>,
    request_timeout: Duration,
    time_source: TimeSource,
}

impl GatewayService {
    pub fn new(
        admission: AdmissionController,
        normalizer: EventNormalizer,
        destination: Destination,
        metrics: Arc<Metrics>,
        request_timeout: Duration,
        time_source: TimeSource,
    ) -> Self {
        Self {
            admission,
            normalizer,
            publisher: RwLock::new(None),
            destination,
            metrics,
            request_timeout: request_timeout.min(MAX_REQUEST_TIMEOUT),
            time_source,
        }
    }

    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.request_timeout).unwrap_or(now)
    }

    /// Attach (or replace) the broker publisher
    pub async fn set_publisher(&self, publisher: Arc<dyn EventPublisher>) {
        *self.publisher.write().await = Some(publisher);
        info!(destination = %self.destination, "Broker publisher attached");
    }

    pub async fn has_publisher(&self) -> bool {
        self.publisher.read().await.is_some()
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub async fn admit(&self, request: &AdmissionRequest<'_>) -> AdmissionDecision {
        self.admission.admit(request).await
    }

    /// Body size ceiling for `route` under the current policy
    pub async fn max_payload_bytes(&self, route: &str) -> usize {
        let policy = self.admission.policy_store().snapshot().await;
        policy.route(route).max_payload_bytes
    }

    /// Validate and publish a single event
    pub async fn ingest_event(&self, raw: &[u8]) -> Result<PublishedEvent, IngestError> {
        let deadline = self.deadline();
        let mut records = self.normalizer.normalize(raw, false)?;
        let record = records
            .pop()
            .ok_or_else(|| ValidationError::new("no event in request body"))?;
        let publisher = self.current_publisher().await?;

        info!(
            event_type = %record.event_type,
            source = %record.source,
            correlation_id = %record.correlation_id,
            "Publishing event"
        );
        self.publish_before(publisher.as_ref(), &record, deadline).await?;

        Ok(PublishedEvent {
            event_id: record.event_id,
            correlation_id: record.correlation_id,
        })
    }

    /// Validate a whole batch, then publish its events one by one.
    ///
    /// Validation is all-or-nothing. Publishing is not: each item reports its
    /// own result.
    pub async fn ingest_batch(&self, raw: &[u8]) -> Result<BatchReport, IngestError> {
        let deadline = self.deadline();
        let records = self.normalizer.normalize(raw, true)?;
        let publisher = self.current_publisher().await?;

        info!(count = records.len(), destination = %self.destination, "Publishing event batch");

        let mut results = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let error = self
                .publish_before(publisher.as_ref(), &record, deadline)
                .await
                .err()
                .map(|e| e.to_string());
            results.push(BatchItemResult {
                index,
                success: error.is_none(),
                event_id: record.event_id,
                correlation_id: record.correlation_id,
                error,
            });
        }

        let report = BatchReport { results };
        if !report.all_succeeded() {
            warn!(
                total = report.total_count(),
                failed = report.failed_count(),
                "Batch partially failed"
            );
        }
        Ok(report)
    }

    pub async fn health(&self) -> HealthReport {
        let publisher = self.publisher.read().await.clone();
        let broker_connected = match publisher {
            Some(publisher) => publisher.health_check().await.is_ok(),
            None => false,
        };

        HealthReport {
            status: if broker_connected {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            timestamp: self.time_source.utc_now(),
            broker_connected,
            policy_version: self.admission.policy_store().version().await,
        }
    }

    /// The lock is released before the caller starts publishing.
    async fn current_publisher(&self) -> Result<Arc<dyn EventPublisher>, IngestError> {
        self.publisher
            .read()
            .await
            .clone()
            .ok_or(IngestError::BrokerUnavailable)
    }

    async fn publish_before(
        &self,
        publisher: &dyn EventPublisher,
        record: &EventRecord,
        deadline: Instant,
    ) -> Result<(), IngestError> {
        let outcome = tokio::time::timeout_at(deadline, publisher.publish(&self.destination, record)).await;

        match outcome {
            Ok(Ok(_receipt)) => {
                self.metrics
                    .record_event_published(self.destination.kind(), "success");
                Ok(())
            }
            Ok(Err(e)) => {
                self.metrics
                    .record_event_published(self.destination.kind(), "failure");
                Err(IngestError::Publish(e))
            }
            Err(_) => {
                self.metrics
                    .record_event_published(self.destination.kind(), "deadline_exceeded");
                error!(
                    correlation_id = %record.correlation_id,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Request deadline exceeded while publishing"
                );
                Err(IngestError::DeadlineExceeded(self.request_timeout))
            }
        }
    }
}
