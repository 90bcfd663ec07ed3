use chrono::{DateTime, TimeZone, Utc};
use std::{
    net::{IpAddr, Ipv4Addr},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Time source for window and block calculations.
///
/// Production code uses [`TimeSource::system`]. Tests use
/// [`TimeSource::manual`] and move time forward explicitly; all clones of a
/// manual source share the same instant.
#[derive(Debug, Clone, Default)]
pub struct TimeSource {
    manual_millis: Option<Arc<AtomicI64>>,
}

impl TimeSource {
    pub fn system() -> Self {
        Self { manual_millis: None }
    }

    /// A controllable clock starting at `start_unix_secs`.
    pub fn manual(start_unix_secs: i64) -> Self {
        Self {
            manual_millis: Some(Arc::new(AtomicI64::new(start_unix_secs * 1000))),
        }
    }

    /// Move a manual clock forward. No effect on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Some(millis) = &self.manual_millis {
            millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
        }
    }

    /// Current Unix time in milliseconds
    pub fn unix_millis(&self) -> i64 {
        match &self.manual_millis {
            Some(millis) => millis.load(Ordering::SeqCst),
            None => Utc::now().timestamp_millis(),
        }
    }

    /// Current Unix timestamp in seconds
    pub fn unix_now(&self) -> i64 {
        self.unix_millis().div_euclid(1000)
    }

    pub fn utc_now(&self) -> DateTime<Utc> {
        match &self.manual_millis {
            Some(_) => Utc
                .timestamp_millis_opt(self.unix_millis())
                .single()
                .unwrap_or_else(Utc::now),
            None => Utc::now(),
        }
    }
}

/// Rate limit time units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Second,
    Minute,
    Hour,
    Day,
}

impl Unit {
    pub fn to_seconds(self) -> u64 {
        match self {
            Unit::Second => 1,
            Unit::Minute => 60,
            Unit::Hour => 3600,
            Unit::Day => 86400,
        }
    }

    pub fn to_divisor(self) -> i64 {
        self.to_seconds() as i64
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.to_seconds())
    }
}

/// Index of the fixed window containing `now`. Windows are aligned to the epoch.
pub fn window_index(unit: Unit, now_secs: i64) -> i64 {
    now_secs.div_euclid(unit.to_divisor())
}

/// Time remaining until the window containing `now_millis` closes.
pub fn calculate_reset(unit: &Unit, now_millis: i64) -> Duration {
    let window_millis = unit.to_divisor() * 1000;
    let next_window_start = (now_millis.div_euclid(window_millis) + 1) * window_millis;
    Duration::from_millis((next_window_start - now_millis) as u64)
}

/// Round a duration up to whole seconds for `Retry-After`, never below one.
pub fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// Parse an `X-Forwarded-For` value, returning the original client address.
pub fn first_forwarded_ip(value: &str) -> Option<IpAddr> {
    value
        .split(',')
        .next()
        .map(str::trim)
        .and_then(|ip| ip.parse().ok())
}

/// Normalize IPv4-mapped IPv6 addresses so `::ffff:10.0.0.1` matches `10.0.0.0/8`.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

pub const UNKNOWN_CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
