//! API key authentication against the current policy snapshot.
//!
//! Keys arrive in `X-API-Key`, or as `Authorization: Bearer <key>`.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use tracing::debug;

use crate::{
    admission::{AdmissionDecision, DecisionReason},
    config::PolicyConfig,
};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Pull the presented key out of the request headers
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(key.to_string());
    }

    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Validates presented keys and their route permissions
#[derive(Debug, Default, Clone, Copy)]
pub struct ApiKeyAuthenticator;

impl ApiKeyAuthenticator {
    pub fn new() -> Self {
        Self
    }

    /// Missing, unknown and disabled keys are `unauthorized`; a valid key
    /// without permission for `route` is `forbidden_route`.
    pub fn authenticate(
        &self,
        policy: &PolicyConfig,
        presented_key: Option<&str>,
        route: &str,
    ) -> AdmissionDecision {
        if !policy.route(route).auth_required {
            return AdmissionDecision::allow();
        }

        let Some(key) = presented_key else {
            debug!(route, "Missing API key");
            return AdmissionDecision::deny(DecisionReason::Unauthorized);
        };

        match policy.api_key(key) {
            Some(entry) if entry.enabled => {
                if entry.permits(route) {
                    AdmissionDecision::allow()
                } else {
                    debug!(route, "API key lacks permission for route");
                    AdmissionDecision::deny(DecisionReason::ForbiddenRoute)
                }
            }
            Some(_) => {
                debug!(route, "Disabled API key presented");
                AdmissionDecision::deny(DecisionReason::Unauthorized)
            }
            None => {
                debug!(route, "Unknown API key presented");
                AdmissionDecision::deny(DecisionReason::Unauthorized)
            }
        }
    }
}
