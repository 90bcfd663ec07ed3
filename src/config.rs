use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    time::Duration,
};

use crate::{
    error::{GatewayError, Result},
    utils::Unit,
};

/// Body size limit for routes that do not set `max_payload_bytes` (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Admission policy document as written by operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Policy applied to any path not listed under `routes`.
    pub default_route: RoutePolicy,
    #[serde(default)]
    pub routes: HashMap<String, RoutePolicy>,
    #[serde(default)]
    pub api_keys: HashMap<String, ApiKey>,
    #[serde(default)]
    pub ip_rules: IpRules,
}

/// Per-route admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicy {
    #[serde(default = "default_true")]
    pub auth_required: bool,
    pub rate_limit: RateLimit,
    pub max_payload_bytes: Option<usize>,
}

/// Rate limit specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub requests_per_unit: u32,
    pub unit: RateLimitUnit,
    pub unlimited: Option<bool>,
    pub name: Option<String>,
}

/// Time units for rate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl From<RateLimitUnit> for Unit {
    fn from(unit: RateLimitUnit) -> Self {
        match unit {
            RateLimitUnit::Second => Unit::Second,
            RateLimitUnit::Minute => Unit::Minute,
            RateLimitUnit::Hour => Unit::Hour,
            RateLimitUnit::Day => Unit::Day,
        }
    }
}

/// An API key entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Routes this key may call.
    #[serde(default)]
    pub routes: Vec<String>,
    pub description: Option<String>,
    /// Per-route limits replacing the route's own limit for this key.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimit>,
}

/// Source address rules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    pub auto_block: Option<AutoBlock>,
}

/// Temporary blocking of sources that keep violating policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoBlock {
    pub threshold: u32,
    pub violation_window_secs: u64,
    pub block_duration_secs: u64,
}

fn default_true() -> bool {
    true
}

/// Immutable, compiled policy snapshot.
///
/// Snapshots are never modified after compilation; a reload builds a new one
/// and swaps it in whole.
#[derive(Debug)]
pub struct PolicyConfig {
    version: u64,
    default_route: CompiledRoutePolicy,
    routes: HashMap<String, CompiledRoutePolicy>,
    api_keys: HashMap<String, CompiledApiKey>,
    ip_rules: CompiledIpRules,
}

#[derive(Debug, Clone)]
pub struct CompiledRateLimit {
    pub requests_per_unit: u32,
    pub unit: Unit,
    pub unlimited: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompiledRoutePolicy {
    pub auth_required: bool,
    pub rate_limit: CompiledRateLimit,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct CompiledApiKey {
    pub enabled: bool,
    pub routes: HashSet<String>,
    pub description: Option<String>,
    pub rate_limits: HashMap<String, CompiledRateLimit>,
}

impl CompiledApiKey {
    pub fn permits(&self, route: &str) -> bool {
        self.routes.contains(route)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompiledIpRules {
    pub allow: Vec<IpNet>,
    pub deny: Vec<IpNet>,
    pub auto_block: Option<AutoBlockPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoBlockPolicy {
    pub threshold: u32,
    pub violation_window: Duration,
    pub block_duration: Duration,
}

impl PolicyConfig {
    /// Compile a policy document for fast lookups, rejecting anything ambiguous
    pub fn compile(document: PolicyDocument) -> Result<Self> {
        let default_route = compile_route("default_route", document.default_route)?;

        let mut routes = HashMap::with_capacity(document.routes.len());
        for (path, route) in document.routes {
            if !path.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "route '{}' must start with '/'",
                    path
                )));
            }
            let compiled = compile_route(&path, route)?;
            routes.insert(path, compiled);
        }

        let mut api_keys = HashMap::with_capacity(document.api_keys.len());
        for (key, entry) in document.api_keys {
            if key.trim().is_empty() {
                return Err(GatewayError::Config("API keys must not be empty".to_string()));
            }
            let mut rate_limits = HashMap::with_capacity(entry.rate_limits.len());
            for (route, limit) in entry.rate_limits {
                let compiled = compile_rate_limit(&route, limit)?;
                rate_limits.insert(route, compiled);
            }
            api_keys.insert(
                key,
                CompiledApiKey {
                    enabled: entry.enabled,
                    routes: entry.routes.into_iter().collect(),
                    description: entry.description,
                    rate_limits,
                },
            );
        }

        let ip_rules = compile_ip_rules(document.ip_rules)?;

        Ok(Self {
            version: 0,
            default_route,
            routes,
            api_keys,
            ip_rules,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Policy for a route, falling back to the explicit default
    pub fn route(&self, path: &str) -> &CompiledRoutePolicy {
        self.routes.get(path).unwrap_or(&self.default_route)
    }

    pub fn has_route(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    pub fn api_key(&self, key: &str) -> Option<&CompiledApiKey> {
        self.api_keys.get(key)
    }

    pub fn ip_rules(&self) -> &CompiledIpRules {
        &self.ip_rules
    }

    /// Limit applying to `route` for the given identity.
    pub fn rate_limit_for<'a>(
        &'a self,
        route: &str,
        key: Option<&'a CompiledApiKey>,
    ) -> &'a CompiledRateLimit {
        key.and_then(|k| k.rate_limits.get(route))
            .unwrap_or(&self.route(route).rate_limit)
    }
}

fn compile_route(path: &str, route: RoutePolicy) -> Result<CompiledRoutePolicy> {
    let max_payload_bytes = route.max_payload_bytes.unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES);
    if max_payload_bytes == 0 {
        return Err(GatewayError::Config(format!(
            "route '{}': max_payload_bytes must be greater than zero",
            path
        )));
    }

    Ok(CompiledRoutePolicy {
        auth_required: route.auth_required,
        rate_limit: compile_rate_limit(path, route.rate_limit)?,
        max_payload_bytes,
    })
}

fn compile_rate_limit(path: &str, limit: RateLimit) -> Result<CompiledRateLimit> {
    let unlimited = limit.unlimited.unwrap_or(false);
    if !unlimited && limit.requests_per_unit == 0 {
        return Err(GatewayError::Config(format!(
            "route '{}': requests_per_unit must be positive unless the limit is marked unlimited",
            path
        )));
    }

    Ok(CompiledRateLimit {
        requests_per_unit: limit.requests_per_unit,
        unit: limit.unit.into(),
        unlimited,
        name: limit.name,
    })
}

fn compile_ip_rules(rules: IpRules) -> Result<CompiledIpRules> {
    let allow = rules
        .allow
        .iter()
        .map(|s| parse_network(s))
        .collect::<Result<Vec<_>>>()?;
    let deny = rules
        .deny
        .iter()
        .map(|s| parse_network(s))
        .collect::<Result<Vec<_>>>()?;

    let auto_block = match rules.auto_block {
        Some(block) => {
            if block.threshold == 0 {
                return Err(GatewayError::Config(
                    "auto_block.threshold must be greater than zero".to_string(),
                ));
            }
            if block.violation_window_secs == 0 || block.block_duration_secs == 0 {
                return Err(GatewayError::Config(
                    "auto_block windows must be greater than zero".to_string(),
                ));
            }
            Some(AutoBlockPolicy {
                threshold: block.threshold,
                violation_window: Duration::from_secs(block.violation_window_secs),
                block_duration: Duration::from_secs(block.block_duration_secs),
            })
        }
        None => None,
    };

    Ok(CompiledIpRules {
        allow,
        deny,
        auto_block,
    })
}

/// Parse a CIDR range; a bare address becomes a single-host range.
pub fn parse_network(value: &str) -> Result<IpNet> {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net.trunc());
    }

    let addr = value
        .parse::<IpAddr>()
        .map_err(|_| GatewayError::Config(format!("invalid IP range '{}'", value)))?;
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, prefix).map_err(|e| GatewayError::Config(format!("invalid IP range '{}': {}", value, e)))
}

/// Load a policy document from YAML
pub fn load_policy_from_yaml(yaml: &str) -> Result<PolicyDocument> {
    serde_yaml::from_str(yaml)
        .map_err(|e| GatewayError::Config(format!("Failed to parse policy YAML: {}", e)))
}

/// Load a policy document from a YAML file
pub fn load_policy_from_file(path: &str) -> Result<PolicyDocument> {
    let content = std::fs::read_to_string(path)?;
    load_policy_from_yaml(&content)
}
