//! Greeter configuration
//!
//! Environment variables:
//! - `DATABASE_URL`: PostgreSQL journal (credential `database_url`); in-memory when unset
//! - `DURABLE_MAX_ATTEMPTS`: attempts per greeting (default: 10)
//! - `DURABLE_INITIAL_BACKOFF_MS`: first retry delay (default: 200)
//! - `DURABLE_MAX_BACKOFF_MS`: retry delay cap (default: 5000)
//! - `DURABLE_USER_ERROR_POLICY`: `terminal`, `transient` or `retryable-flag` (default)
//! - `DURABLE_LEASE_TTL_SECS`: exclusivity lease TTL (default: 60)
//! - `GREETER_FAILURE_RATE`: simulated send failure probability (default: 0.7)
//! - `GREETER_FLAKY_NAMES`: comma-separated recipients whose sends may fail (default: Alice)
//! - `GREETER_REMINDER_DELAY_MS`: wait between notification and reminder (default: 1000)

use std::str::FromStr;
use std::time::Duration;

use hammond_durable::{DriverConfig, FailureClassifier, RetryPolicy, UserErrorPolicy};

use crate::credentials::{CredentialError, Credentials};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Everything the greeter binary needs
#[derive(Debug, Clone)]
pub struct GreeterConfig {
    /// PostgreSQL URL for the journal; in-memory when absent
    pub database_url: Option<String>,
    /// Probability that a send to a flaky recipient fails
    pub failure_rate: f64,
    /// Recipients whose sends may fail
    pub flaky_names: Vec<String>,
    /// Wait between notification and reminder
    pub reminder_delay: Duration,
    /// Driver settings (retries, classification, lease)
    pub driver: DriverConfig,
}

impl Default for GreeterConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            failure_rate: 0.7,
            flaky_names: vec!["Alice".to_string()],
            reminder_delay: Duration::from_secs(1),
            driver: default_driver_config(),
        }
    }
}

/// Simulated failures are retryable, so greetings retry them by default
fn default_driver_config() -> DriverConfig {
    DriverConfig::default()
        .with_retry_policy(
            RetryPolicy::exponential()
                .with_max_attempts(10)
                .with_initial_interval(Duration::from_millis(200))
                .with_max_interval(Duration::from_secs(5)),
        )
        .with_classifier(FailureClassifier::new(UserErrorPolicy::RetryableFlag))
}

impl GreeterConfig {
    /// Create configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.database_url = Credentials::global()
            .get_optional("database_url")?
            .filter(|url| !url.is_empty());
        Ok(config)
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut driver = defaults.driver;

        if let Some(max_attempts) = parse_var::<u32>(&lookup, "DURABLE_MAX_ATTEMPTS")? {
            if max_attempts == 0 {
                return Err(ConfigError::Invalid {
                    var: "DURABLE_MAX_ATTEMPTS",
                    value: max_attempts.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            driver.retry_policy = driver.retry_policy.with_max_attempts(max_attempts);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "DURABLE_INITIAL_BACKOFF_MS")? {
            driver.retry_policy = driver
                .retry_policy
                .with_initial_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "DURABLE_MAX_BACKOFF_MS")? {
            driver.retry_policy = driver
                .retry_policy
                .with_max_interval(Duration::from_millis(ms));
        }
        if let Some(policy) = parse_var::<UserErrorPolicy>(&lookup, "DURABLE_USER_ERROR_POLICY")? {
            driver.classifier = driver.classifier.with_user_error_policy(policy);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "DURABLE_LEASE_TTL_SECS")? {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: "DURABLE_LEASE_TTL_SECS",
                    value: secs.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            driver.lease_ttl = Duration::from_secs(secs);
        }

        let failure_rate = match parse_var::<f64>(&lookup, "GREETER_FAILURE_RATE")? {
            Some(rate) if !(0.0..=1.0).contains(&rate) => {
                return Err(ConfigError::Invalid {
                    var: "GREETER_FAILURE_RATE",
                    value: rate.to_string(),
                    reason: "must be between 0 and 1".to_string(),
                });
            }
            Some(rate) => rate,
            None => defaults.failure_rate,
        };

        let flaky_names = lookup("GREETER_FLAKY_NAMES")
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or(defaults.flaky_names);

        let reminder_delay = parse_var::<u64>(&lookup, "GREETER_REMINDER_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.reminder_delay);

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            failure_rate,
            flaky_names,
            reminder_delay,
            driver,
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GreeterConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_url, None);
        assert_eq!(config.failure_rate, 0.7);
        assert_eq!(config.flaky_names, vec!["Alice"]);
        assert_eq!(config.reminder_delay, Duration::from_secs(1));
        assert_eq!(config.driver.retry_policy.max_attempts, 10);
        assert_eq!(
            config.driver.classifier.user_errors,
            UserErrorPolicy::RetryableFlag
        );
    }

    #[test]
    fn test_overrides() {
        let config = GreeterConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/hammond"),
            ("DURABLE_MAX_ATTEMPTS", "3"),
            ("DURABLE_INITIAL_BACKOFF_MS", "50"),
            ("DURABLE_USER_ERROR_POLICY", "terminal"),
            ("DURABLE_LEASE_TTL_SECS", "5"),
            ("GREETER_FAILURE_RATE", "0.25"),
            ("GREETER_FLAKY_NAMES", "Alice, Carol,,"),
            ("GREETER_REMINDER_DELAY_MS", "10"),
        ]))
        .unwrap();

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/hammond")
        );
        assert_eq!(config.driver.retry_policy.max_attempts, 3);
        assert_eq!(
            config.driver.retry_policy.initial_interval,
            Duration::from_millis(50)
        );
        assert_eq!(config.driver.classifier.user_errors, UserErrorPolicy::Terminal);
        assert_eq!(config.driver.lease_ttl, Duration::from_secs(5));
        assert_eq!(config.failure_rate, 0.25);
        assert_eq!(config.flaky_names, vec!["Alice", "Carol"]);
        assert_eq!(config.reminder_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for vars in [
            [("DURABLE_MAX_ATTEMPTS", "many")],
            [("DURABLE_MAX_ATTEMPTS", "0")],
            [("DURABLE_USER_ERROR_POLICY", "sometimes")],
            [("DURABLE_LEASE_TTL_SECS", "0")],
            [("GREETER_FAILURE_RATE", "1.5")],
        ] {
            let err = GreeterConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{vars:?}: {err}");
        }
    }
}
