//! Inbound payload validation and canonical event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{error::ValidationError, utils::TimeSource};

pub const DEFAULT_EVENT_SOURCE: &str = "api";
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// The canonical unit handed to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: String,
    pub data: Value,
    pub source: String,
    pub correlation_id: String,
    /// When the client says the event happened, if it said.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// Validates raw request bodies and turns them into [`EventRecord`]s.
///
/// Batches are all-or-nothing: the first invalid element fails the whole
/// submission and no record is produced.
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    default_source: String,
    max_batch_size: usize,
    time_source: TimeSource,
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_SOURCE, DEFAULT_MAX_BATCH_SIZE, TimeSource::system())
    }
}

impl EventNormalizer {
    pub fn new(default_source: impl Into<String>, max_batch_size: usize, time_source: TimeSource) -> Self {
        Self {
            default_source: default_source.into(),
            max_batch_size,
            time_source,
        }
    }

    pub fn normalize(&self, raw: &[u8], is_batch: bool) -> Result<Vec<EventRecord>, ValidationError> {
        let payload: Value = serde_json::from_slice(raw)
            .map_err(|e| ValidationError::new(format!("request body is not valid JSON: {}", e)))?;
        let received_at = self.time_source.utc_now();

        if !is_batch {
            return Ok(vec![self.normalize_one(payload, None, received_at)?]);
        }

        let Value::Array(items) = payload else {
            return Err(ValidationError::new("batch submission must be a JSON array"));
        };
        if items.is_empty() {
            return Err(ValidationError::new("batch submission must contain at least one event"));
        }
        if items.len() > self.max_batch_size {
            return Err(ValidationError::new(format!(
                "batch of {} events exceeds the maximum of {}",
                items.len(),
                self.max_batch_size
            )));
        }

        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| self.normalize_one(item, Some(index), received_at))
            .collect()
    }

    fn normalize_one(
        &self,
        value: Value,
        index: Option<usize>,
        received_at: DateTime<Utc>,
    ) -> Result<EventRecord, ValidationError> {
        let fail = |message: String| match index {
            Some(i) => ValidationError::at(i, message),
            None => ValidationError::new(message),
        };

        let Value::Object(mut fields) = value else {
            return Err(fail("event must be a JSON object".to_string()));
        };

        let event_type = match fields.remove("event_type") {
            Some(Value::String(s)) if !s.trim().is_empty() => s,
            Some(Value::String(_)) => return Err(fail("'event_type' must not be empty".to_string())),
            Some(Value::Null) | None => {
                return Err(fail("missing required field 'event_type'".to_string()))
            }
            Some(_) => return Err(fail("'event_type' must be a string".to_string())),
        };

        let data = match fields.remove("data") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(data) => data,
        };

        let source = optional_string(&mut fields, "source")
            .map_err(fail)?
            .unwrap_or_else(|| self.default_source.clone());

        let correlation_id = optional_string(&mut fields, "correlation_id")
            .map_err(fail)?
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let timestamp = match optional_string(&mut fields, "timestamp").map_err(fail)? {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| fail(format!("'timestamp' is not RFC 3339: {}", e)))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        Ok(EventRecord {
            event_id: new_event_id(),
            event_type,
            data,
            source,
            correlation_id,
            timestamp,
            received_at,
        })
    }
}

/// String field that may be absent, null or empty (all treated as absent).
fn optional_string(fields: &mut Map<String, Value>, name: &str) -> Result<Option<String>, String> {
    match fields.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(format!("'{}' must be a string", name)),
    }
}

fn new_event_id() -> String {
    format!("evt_{}", Uuid::new_v4().simple())
}
