//! Rebalancer configuration
//!
//! Configuration loaded from environment variables and command line.

use crate::scanner::EligibilityPolicy;
use std::collections::BTreeSet;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Default location of the weekly lock dumps
pub const DEFAULT_DUMPS_LOCATION: &str = "http://localhost:8080/LOCKS/";

/// Rebalancer configuration
#[derive(Debug, Clone)]
pub struct RebalancerConfig {
    /// PostgreSQL database URL
    pub database_url: String,

    /// Base URL of the lock dump service (decommission mode)
    pub dumps_location: String,

    /// Local directory holding lock dumps, preferred over `dumps_location`
    pub dumps_dir: Option<PathBuf>,

    /// Accounts whose rules may be rebalanced
    pub privileged_accounts: BTreeSet<String>,

    /// Minimum age of a rule before it may be moved, in days
    pub min_rule_age_days: i64,

    /// Minimum remaining lifetime of an expiring rule, in days
    pub min_remaining_days: i64,

    /// Seed for the weighted endpoint selector
    pub selector_seed: Option<u64>,

    /// Activity stamped on derived rules instead of the parent's
    pub activity: Option<String>,
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        let policy = EligibilityPolicy::default();
        Self {
            database_url: String::new(),
            dumps_location: DEFAULT_DUMPS_LOCATION.to_string(),
            dumps_dir: None,
            privileged_accounts: policy.privileged_accounts,
            min_rule_age_days: policy.min_rule_age.num_days(),
            min_remaining_days: policy.min_remaining_lifetime.num_days(),
            selector_seed: None,
            activity: None,
        }
    }
}

impl RebalancerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        let dumps_location = lookup("REPLIX_DUMPS_LOCATION").unwrap_or(defaults.dumps_location);

        let dumps_dir = lookup("REPLIX_DUMPS_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let privileged_accounts = lookup("REPLIX_PRIVILEGED_ACCOUNTS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or(defaults.privileged_accounts);

        let min_rule_age_days = lookup("REPLIX_MIN_RULE_AGE_DAYS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.min_rule_age_days);

        let min_remaining_days = lookup("REPLIX_MIN_REMAINING_DAYS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.min_remaining_days);

        let selector_seed = match lookup("REPLIX_SELECTOR_SEED") {
            Some(v) => Some(v.parse().map_err(|_| {
                ConfigError::InvalidValue("REPLIX_SELECTOR_SEED".to_string(), v.clone())
            })?),
            None => None,
        };

        let activity = lookup("REPLIX_ACTIVITY").filter(|v| !v.is_empty());

        Ok(Self {
            database_url,
            dumps_location,
            dumps_dir,
            privileged_accounts,
            min_rule_age_days,
            min_remaining_days,
            selector_seed,
            activity,
        })
    }

    /// Scanner eligibility policy derived from this configuration
    pub fn eligibility_policy(&self) -> EligibilityPolicy {
        EligibilityPolicy {
            min_rule_age: chrono::Duration::days(self.min_rule_age_days),
            min_remaining_lifetime: chrono::Duration::days(self.min_remaining_days),
            privileged_accounts: self.privileged_accounts.clone(),
        }
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
    fn test_default_config() {
        let config = RebalancerConfig::default();
        assert_eq!(config.dumps_location, DEFAULT_DUMPS_LOCATION);
        assert_eq!(config.min_rule_age_days, 60);
        assert_eq!(config.min_remaining_days, 60);
        assert!(config.privileged_accounts.contains("ddmadmin"));
        assert!(config.selector_seed.is_none());
    }

    #[test]
    fn test_database_url_required() {
        let err = RebalancerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "DATABASE_URL"));
    }

    #[test]
    fn test_overrides() {
        let config = RebalancerConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/replix"),
            ("REPLIX_PRIVILEGED_ACCOUNTS", "root, prod ,"),
            ("REPLIX_MIN_RULE_AGE_DAYS", "30"),
            ("REPLIX_SELECTOR_SEED", "42"),
            ("REPLIX_ACTIVITY", "Data rebalancing"),
            ("REPLIX_DUMPS_DIR", "/var/dumps"),
        ]))
        .unwrap();

        assert_eq!(config.database_url, "postgres://db/replix");
        assert_eq!(
            config.privileged_accounts.iter().cloned().collect::<Vec<_>>(),
            vec!["prod".to_string(), "root".to_string()]
        );
        assert_eq!(config.min_rule_age_days, 30);
        assert_eq!(config.min_remaining_days, 60);
        assert_eq!(config.selector_seed, Some(42));
        assert_eq!(config.activity.as_deref(), Some("Data rebalancing"));
        assert_eq!(config.dumps_dir, Some(PathBuf::from("/var/dumps")));

        let policy = config.eligibility_policy();
        assert_eq!(policy.min_rule_age, chrono::Duration::days(30));
    }

    #[test]
    fn test_invalid_seed_rejected() {
        let err = RebalancerConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/replix"),
            ("REPLIX_SELECTOR_SEED", "lucky"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(..)));
    }
}
