//! Agent configuration read from the environment.

use crate::allocator::AllocatorSettings;
use crate::error::AgentError;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Pool used when `POOL_NAME` is unset
pub const DEFAULT_POOL_NAME: &str = "default";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9384";
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9385";
pub const DEFAULT_STATE_PATH: &str = "/run/ipamd/allocations.json";

/// Settings of one `ipamd` process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// This node's name, written as block owner (`NODE_NAME`)
    pub node_name: String,
    /// Pool new blocks are requested from (`POOL_NAME`)
    pub pool_name: String,
    /// Address of the allocation API (`LISTEN_ADDR`)
    pub listen_addr: SocketAddr,
    /// Address of the Prometheus listener (`METRICS_ADDR`)
    pub metrics_addr: SocketAddr,
    /// Bound on waiting for a block grant (`REQUEST_TIMEOUT_SECS`)
    pub request_timeout: Duration,
    /// BlockRequest poll period (`REQUEST_POLL_MILLIS`)
    pub poll_interval: Duration,
    /// Allocation table file (`STATE_PATH`)
    pub state_path: PathBuf,
    /// Period of the idle block sweep (`IDLE_BLOCK_SWEEP_SECS`)
    pub idle_block_sweep: Duration,
}

impl AgentConfig {
    /// Reads configuration from process environment variables.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| env::var(key).ok())
    }
    
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        let node_name = lookup("NODE_NAME")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AgentError::InvalidConfig("NODE_NAME must be set".to_string()))?;
        
        let pool_name = lookup("POOL_NAME")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_POOL_NAME.to_string());
        object_name("NODE_NAME", &node_name)?;
        object_name("POOL_NAME", &pool_name)?;
        
        Ok(Self {
            node_name,
            pool_name,
            listen_addr: parse(&lookup, "LISTEN_ADDR", DEFAULT_LISTEN_ADDR)?,
            metrics_addr: parse(&lookup, "METRICS_ADDR", DEFAULT_METRICS_ADDR)?,
            request_timeout: Duration::from_secs(positive(&lookup, "REQUEST_TIMEOUT_SECS", 30)?),
            poll_interval: Duration::from_millis(positive(&lookup, "REQUEST_POLL_MILLIS", 250)?),
            state_path: lookup("STATE_PATH")
                .filter(|v| !v.trim().is_empty())
                .map_or_else(|| PathBuf::from(DEFAULT_STATE_PATH), PathBuf::from),
            idle_block_sweep: Duration::from_secs(positive(&lookup, "IDLE_BLOCK_SWEEP_SECS", 300)?),
        })
    }
    
    /// The subset of settings the allocator needs.
    pub fn allocator_settings(&self) -> AllocatorSettings {
        AllocatorSettings {
            node_name: self.node_name.clone(),
            pool_name: self.pool_name.clone(),
            request_timeout: self.request_timeout,
            poll_interval: self.poll_interval,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<T, AgentError> {
    let value = lookup(key).unwrap_or_else(|| default.to_string());
    value
        .trim()
        .parse()
        .map_err(|_| AgentError::InvalidConfig(format!("{key} is not valid: '{value}'")))
}

/// Checks that `value` can name a Kubernetes object (DNS-1123 subdomain).
fn object_name(key: &str, value: &str) -> Result<(), AgentError> {
    let valid = value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    if valid {
        Ok(())
    } else {
        Err(AgentError::InvalidConfig(format!(
            "{key} must be a lowercase DNS subdomain, got '{value}'"
        )))
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64, AgentError> {
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| AgentError::InvalidConfig(format!(
            "{} must be a positive integer, got '{}'",
            key, value
        )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_lookup(lookup(&[("NODE_NAME", "node1")])).unwrap();
        assert_eq!(config.node_name, "node1");
        assert_eq!(config.pool_name, "default");
        assert_eq!(config.listen_addr, "127.0.0.1:9384".parse().unwrap());
        assert_eq!(config.metrics_addr, "0.0.0.0:9385".parse().unwrap());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.state_path, PathBuf::from("/run/ipamd/allocations.json"));
        assert_eq!(config.idle_block_sweep, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("NODE_NAME", "worker-7"),
            ("POOL_NAME", "pods"),
            ("LISTEN_ADDR", "0.0.0.0:8080"),
            ("REQUEST_TIMEOUT_SECS", "5"),
            ("STATE_PATH", "/var/lib/ipamd/state.json"),
        ]))
        .unwrap();
        assert_eq!(config.pool_name, "pods");
        assert_eq!(config.listen_addr.port(), 8080);

        let settings = config.allocator_settings();
        assert_eq!(settings.node_name, "worker-7");
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(config.state_path, PathBuf::from("/var/lib/ipamd/state.json"));
    }

    #[test]
    fn test_node_name_is_required() {
        assert!(matches!(AgentConfig::from_lookup(lookup(&[])), Err(AgentError::InvalidConfig(_))));
        assert!(matches!(
            AgentConfig::from_lookup(lookup(&[("NODE_NAME", "  ")])),
            Err(AgentError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_bad_values() {
        let addr = AgentConfig::from_lookup(lookup(&[("NODE_NAME", "n"), ("LISTEN_ADDR", "localhost")]));
        assert!(matches!(addr, Err(AgentError::InvalidConfig(_))));

        let timeout = AgentConfig::from_lookup(lookup(&[("NODE_NAME", "n"), ("REQUEST_TIMEOUT_SECS", "0")]));
        assert!(matches!(timeout, Err(AgentError::InvalidConfig(_))));
    }

    #[test]
    fn test_names_must_be_object_names() {
        let long_node = format!("{}.compute.internal", "ip-10-0-0-1".repeat(8));
        let config = AgentConfig::from_lookup(lookup(&[("NODE_NAME", long_node.as_str())])).unwrap();
        assert_eq!(config.node_name, long_node);

        for pool in ["Pods", "pods_v4", "-pods", "pods..v4", "pods/v4"] {
            let config = AgentConfig::from_lookup(lookup(&[("NODE_NAME", "n"), ("POOL_NAME", pool)]));
            assert!(matches!(config, Err(AgentError::InvalidConfig(_))), "{pool}");
        }
        let node = AgentConfig::from_lookup(lookup(&[("NODE_NAME", "Worker 1")]));
        assert!(matches!(node, Err(AgentError::InvalidConfig(_))));
    }
}
