//! Per-request admission control.
//!
//! The controller evaluates a request against one policy snapshot in a fixed
//! order: IP filter, then rate limiter, then API key authentication. The first
//! denial ends evaluation.

use serde::Serialize;
use std::{net::IpAddr, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    auth::ApiKeyAuthenticator,
    config::PolicyConfig,
    ip_filter::IpFilter,
    limiter::{Identity, RateLimiter},
    metrics::Metrics,
    policy::PolicyStore,
    utils::TimeSource,
};

/// Why a request was (not) admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    None,
    RateLimited,
    IpBlocked,
    Unauthorized,
    ForbiddenRoute,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionReason::None => "none",
            DecisionReason::RateLimited => "rate_limited",
            DecisionReason::IpBlocked => "ip_blocked",
            DecisionReason::Unauthorized => "unauthorized",
            DecisionReason::ForbiddenRoute => "forbidden_route",
        }
    }

    /// Whether this denial counts toward automatic IP blocking
    pub fn is_violation(self) -> bool {
        matches!(self, DecisionReason::RateLimited | DecisionReason::Unauthorized)
    }
}

/// Outcome of admission control for a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: DecisionReason,
    pub retry_after: Option<Duration>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::None,
            retry_after: None,
        }
    }

    pub fn deny(reason: DecisionReason) -> Self {
        Self {
            allowed: false,
            reason,
            retry_after: None,
        }
    }

    pub fn deny_with_retry(reason: DecisionReason, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            reason,
            retry_after: Some(retry_after),
        }
    }
}

/// What admission control needs to know about a request
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub route: &'a str,
    pub client_ip: IpAddr,
    pub api_key: Option<&'a str>,
}

pub struct AdmissionController {
    policy: Arc<PolicyStore>,
    ip_filter: IpFilter,
    rate_limiter: RateLimiter,
    authenticator: ApiKeyAuthenticator,
    metrics: Arc<Metrics>,
}

impl AdmissionController {
    pub fn new(policy: Arc<PolicyStore>, metrics: Arc<Metrics>, time_source: TimeSource) -> Self {
        Self {
            policy,
            ip_filter: IpFilter::new(time_source.clone()),
            rate_limiter: RateLimiter::new(time_source),
            authenticator: ApiKeyAuthenticator::new(),
            metrics,
        }
    }

    pub fn policy_store(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    /// Decide whether `request` may proceed.
    pub async fn admit(&self, request: &AdmissionRequest<'_>) -> AdmissionDecision {
        let policy = self.policy.snapshot().await;
        let decision = self.evaluate(&policy, request).await;

        let route_label = if policy.has_route(request.route) {
            request.route
        } else {
            "default"
        };
        self.metrics
            .record_admission(route_label, decision.reason.as_str());

        if !decision.allowed {
            debug!(
                route = request.route,
                client_ip = %request.client_ip,
                reason = decision.reason.as_str(),
                "Request rejected by admission control"
            );
        }
        decision
    }

    async fn evaluate(&self, policy: &PolicyConfig, request: &AdmissionRequest<'_>) -> AdmissionDecision {
        let decision = self.ip_filter.check(policy, request.client_ip).await;
        if !decision.allowed {
            return decision;
        }

        let identity = Self::identity(policy, request);
        let decision = self.rate_limiter.check(policy, request.route, &identity).await;
        if !decision.allowed {
            self.note_violation(policy, request, decision.reason).await;
            return decision;
        }

        let decision = self
            .authenticator
            .authenticate(policy, request.api_key, request.route);
        if !decision.allowed {
            self.note_violation(policy, request, decision.reason).await;
        }
        decision
    }

    /// Requests are counted against their API key only when the key is one the
    /// policy knows and has enabled. Guessed keys are counted against the source.
    fn identity(policy: &PolicyConfig, request: &AdmissionRequest<'_>) -> Identity {
        match request.api_key {
            Some(key) if policy.api_key(key).is_some_and(|entry| entry.enabled) => {
                Identity::ApiKey(key.to_string())
            }
            _ => Identity::Ip(crate::utils::canonical_ip(request.client_ip)),
        }
    }

    async fn note_violation(
        &self,
        policy: &PolicyConfig,
        request: &AdmissionRequest<'_>,
        reason: DecisionReason,
    ) {
        if !reason.is_violation() {
            return;
        }
        if self.ip_filter.record_violation(policy, request.client_ip).await {
            self.metrics.record_auto_block();
            warn!(
                client_ip = %request.client_ip,
                route = request.route,
                reason = reason.as_str(),
                "Auto-block triggered"
            );
        }
    }
}
