use std::{net::IpAddr, time::Duration};
use tracing::debug;

use crate::{
    admission::{AdmissionDecision, DecisionReason},
    cache::StateTable,
    config::PolicyConfig,
    utils::{calculate_reset, window_index, TimeSource, Unit},
};

/// How long an idle counter outlives its window before eviction.
const COUNTER_GRACE: Duration = Duration::from_secs(60);

/// Who a request is counted against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    ApiKey(String),
    Ip(IpAddr),
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // never log key material
            Identity::ApiKey(key) => {
                let visible: String = key.chars().take(4).collect();
                write!(f, "key:{}…", visible)
            }
            Identity::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    route: String,
    identity: Identity,
}

/// Fixed-window counter for one (route, identity) pair
#[derive(Debug)]
struct RateCounter {
    unit: Unit,
    window_index: i64,
    count: u32,
}

/// Per-route, per-identity fixed-window rate limiter
pub struct RateLimiter {
    counters: StateTable<CounterKey, RateCounter>,
    time_source: TimeSource,
}

impl RateLimiter {
    pub fn new(time_source: TimeSource) -> Self {
        Self {
            counters: StateTable::new(),
            time_source,
        }
    }

    /// Count one request from `identity` on `route`, or deny it if the current
    /// window is already full. A denied request is not counted.
    pub async fn check(
        &self,
        policy: &PolicyConfig,
        route: &str,
        identity: &Identity,
    ) -> AdmissionDecision {
        let key_entry = match identity {
            Identity::ApiKey(key) => policy.api_key(key),
            Identity::Ip(_) => None,
        };
        let limit = policy.rate_limit_for(route, key_entry);
        if limit.unlimited {
            return AdmissionDecision::allow();
        }

        let now_millis = self.time_source.unix_millis();
        let current_window = window_index(limit.unit, now_millis.div_euclid(1000));
        let retention = limit.unit.as_duration() + COUNTER_GRACE;

        let key = CounterKey {
            route: route.to_string(),
            identity: identity.clone(),
        };
        let slot = self
            .counters
            .slot(key, retention, || RateCounter {
                unit: limit.unit,
                window_index: current_window,
                count: 0,
            })
            .await;

        let mut counter = slot.lock().await;
        if counter.window_index != current_window || counter.unit != limit.unit {
            counter.unit = limit.unit;
            counter.window_index = current_window;
            counter.count = 0;
        }

        if counter.count >= limit.requests_per_unit {
            let retry_after = calculate_reset(&limit.unit, now_millis);
            debug!(
                route,
                identity = %identity,
                limit = limit.requests_per_unit,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            return AdmissionDecision::deny_with_retry(DecisionReason::RateLimited, retry_after);
        }

        counter.count += 1;
        AdmissionDecision::allow()
    }

    /// Number of live counters
    pub async fn tracked_counters(&self) -> u64 {
        self.counters.len().await
    }
}
