//! Controller settings read from the environment.

use crate::error::ControllerError;
use std::env;
use std::time::Duration;

/// Default number of concurrent reconciles per resource kind
pub const DEFAULT_RECONCILE_CONCURRENCY: u16 = 4;

/// Default period of the reclaim sweep
pub const DEFAULT_RECLAIM_SWEEP_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Concurrent reconciles per resource kind (`RECONCILE_CONCURRENCY`)
    pub reconcile_concurrency: u16,
    /// Release blocks of vanished nodes before watching (`STARTUP_SWEEP`)
    pub startup_sweep: bool,
    /// Period of the reclaim sweep that retries failed releases (`RECLAIM_SWEEP_SECS`)
    pub reclaim_sweep_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            reconcile_concurrency: DEFAULT_RECONCILE_CONCURRENCY,
            startup_sweep: true,
            reclaim_sweep_interval: Duration::from_secs(DEFAULT_RECLAIM_SWEEP_SECS),
        }
    }
}

impl ControllerSettings {
    /// Reads settings from process environment variables.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }
    
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let mut settings = Self::default();
        
        if let Some(value) = lookup("RECONCILE_CONCURRENCY") {
            settings.reconcile_concurrency = value
                .trim()
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ControllerError::InvalidConfig(format!(
                    "RECONCILE_CONCURRENCY must be a positive integer, got '{}'",
                    value
                )))?;
        }
        
        if let Some(value) = lookup("STARTUP_SWEEP") {
            settings.startup_sweep = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(ControllerError::InvalidConfig(format!(
                        "STARTUP_SWEEP must be true or false, got '{}'",
                        other
                    )));
                }
            };
        }
        
        if let Some(value) = lookup("RECLAIM_SWEEP_SECS") {
            let secs: u64 = value
                .trim()
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ControllerError::InvalidConfig(format!(
                    "RECLAIM_SWEEP_SECS must be a positive integer, got '{}'",
                    value
                )))?;
            settings.reclaim_sweep_interval = Duration::from_secs(secs);
        }
        
        Ok(settings)
    }
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
        let settings = ControllerSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, ControllerSettings::default());
        assert_eq!(settings.reconcile_concurrency, 4);
        assert!(settings.startup_sweep);
        assert_eq!(settings.reclaim_sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_overrides() {
        let settings = ControllerSettings::from_lookup(lookup(&[
            ("RECONCILE_CONCURRENCY", "8"),
            ("STARTUP_SWEEP", "False"),
            ("RECLAIM_SWEEP_SECS", "15"),
        ]))
        .unwrap();
        assert_eq!(settings.reconcile_concurrency, 8);
        assert!(!settings.startup_sweep);
        assert_eq!(settings.reclaim_sweep_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_rejects_bad_values() {
        let zero = ControllerSettings::from_lookup(lookup(&[("RECONCILE_CONCURRENCY", "0")]));
        assert!(matches!(zero, Err(ControllerError::InvalidConfig(_))));
        
        let sweep = ControllerSettings::from_lookup(lookup(&[("STARTUP_SWEEP", "sometimes")]));
        assert!(matches!(sweep, Err(ControllerError::InvalidConfig(_))));
        
        let period = ControllerSettings::from_lookup(lookup(&[("RECLAIM_SWEEP_SECS", "0")]));
        assert!(matches!(period, Err(ControllerError::InvalidConfig(_))));
    }
}
