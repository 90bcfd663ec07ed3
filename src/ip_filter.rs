use std::{net::IpAddr, time::Duration};
use tracing::{debug, warn};

use crate::{
    admission::{AdmissionDecision, DecisionReason},
    cache::StateTable,
    config::PolicyConfig,
    utils::{canonical_ip, TimeSource},
};

/// How long an idle entry outlives its violation window or block.
const ENTRY_GRACE: Duration = Duration::from_secs(60);

/// Violation history and temporary block for one source address
#[derive(Debug, Default)]
struct BlockEntry {
    violations: u32,
    window_started_millis: i64,
    blocked_until_millis: Option<i64>,
}

impl BlockEntry {
    fn active_block(&self, now_millis: i64) -> Option<Duration> {
        self.blocked_until_millis
            .filter(|until| *until > now_millis)
            .map(|until| Duration::from_millis((until - now_millis) as u64))
    }
}

/// Allow/deny list evaluation plus automatic temporary blocking
pub struct IpFilter {
    entries: StateTable<IpAddr, BlockEntry>,
    time_source: TimeSource,
}

impl IpFilter {
    pub fn new(time_source: TimeSource) -> Self {
        Self {
            entries: StateTable::new(),
            time_source,
        }
    }

    /// Deny ranges and active blocks first, then the allow list if one is set.
    pub async fn check(&self, policy: &PolicyConfig, ip: IpAddr) -> AdmissionDecision {
        let ip = canonical_ip(ip);
        let rules = policy.ip_rules();

        if rules.deny.iter().any(|net| net.contains(&ip)) {
            debug!(client_ip = %ip, "Source address in deny list");
            return AdmissionDecision::deny(DecisionReason::IpBlocked);
        }

        if let Some(slot) = self.entries.get(&ip).await {
            let entry = slot.lock().await;
            if let Some(remaining) = entry.active_block(self.time_source.unix_millis()) {
                debug!(client_ip = %ip, remaining_secs = remaining.as_secs(), "Source address is blocked");
                return AdmissionDecision::deny_with_retry(DecisionReason::IpBlocked, remaining);
            }
        }

        if !rules.allow.is_empty() && !rules.allow.iter().any(|net| net.contains(&ip)) {
            debug!(client_ip = %ip, "Source address not in allow list");
            return AdmissionDecision::deny(DecisionReason::IpBlocked);
        }

        AdmissionDecision::allow()
    }

    /// Record a policy violation from `ip`.
    ///
    /// Returns `true` when this violation starts a block. Without an
    /// `auto_block` policy violations are not tracked.
    pub async fn record_violation(&self, policy: &PolicyConfig, ip: IpAddr) -> bool {
        let Some(auto_block) = policy.ip_rules().auto_block else {
            return false;
        };
        let ip = canonical_ip(ip);
        let now = self.time_source.unix_millis();
        let retention = auto_block.violation_window.max(auto_block.block_duration) + ENTRY_GRACE;

        let slot = self
            .entries
            .slot(ip, retention, || BlockEntry {
                window_started_millis: now,
                ..BlockEntry::default()
            })
            .await;
        let mut entry = slot.lock().await;

        if entry.active_block(now).is_some() {
            return false;
        }
        entry.blocked_until_millis = None;

        let window_millis = auto_block.violation_window.as_millis() as i64;
        if now - entry.window_started_millis >= window_millis {
            entry.violations = 0;
            entry.window_started_millis = now;
        }

        entry.violations += 1;
        if entry.violations < auto_block.threshold {
            return false;
        }

        entry.violations = 0;
        entry.window_started_millis = now;
        entry.blocked_until_millis = Some(now + auto_block.block_duration.as_millis() as i64);
        warn!(
            client_ip = %ip,
            threshold = auto_block.threshold,
            block_secs = auto_block.block_duration.as_secs(),
            "Source address temporarily blocked after repeated violations"
        );
        true
    }

    /// Lift a temporary block early
    pub async fn unblock(&self, ip: IpAddr) {
        self.entries.remove(&canonical_ip(ip)).await;
    }
}
