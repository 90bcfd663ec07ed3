//! Event Ingestion Gateway
//!
//! An HTTP front door for an event broker. Every request passes admission
//! control (IP filtering, rate limiting and API key authentication) against a
//! hot-reloadable policy; accepted events are normalized and published to a
//! queue or topic with bounded retries.

pub mod admission;
pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod ip_filter;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod redis;
pub mod service;
pub mod settings;
pub mod utils;

// Re-export main types
pub use admission::{AdmissionController, AdmissionDecision, DecisionReason};
pub use broker::{Destination, EventPublisher, InMemoryBroker, RetryPolicy, RetryingPublisher};
pub use config::{PolicyConfig, PolicyDocument};
pub use error::{GatewayError, PublishError, Result, ValidationError};
pub use event::{EventNormalizer, EventRecord};
pub use policy::PolicyStore;
pub use service::GatewayService;
