//! Delivery settings loaded from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cmis_webhooks::config::{MAX_TIMEOUT_SECS, RegistrationRules};
use cmis_webhooks::policy::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use cmis_webhooks::protocol::DEFAULT_USER_AGENT;
use cmis_webhooks::{RetryPolicy, WebhookError};

pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RETRY_BATCH_SIZE: usize = 100;
pub const DEFAULT_RESPONSE_BODY_LIMIT: usize = 1000;
pub const DEFAULT_MAX_CONFIGS_PER_ORG: usize = 10;
pub const DEFAULT_STALE_PENDING_SECS: u64 = 300;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("missing required environment variable {var}")]
    Missing { var: String },

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Tunables for delivery, retries and registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: Option<u64>,
    /// Fraction of the delay added or removed at random, in `[0, 1]`.
    pub jitter: f64,
    pub retry_interval_secs: u64,
    pub retry_batch_size: usize,
    /// A PENDING entry untouched for this long lost its attempt result and is
    /// requeued. Must exceed the longest request timeout.
    pub stale_pending_secs: u64,
    pub user_agent: String,
    /// Stored response bodies are truncated to this many characters.
    pub response_body_limit: usize,
    pub max_configs_per_org: usize,
    pub allow_http: bool,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_secs: DEFAULT_BASE_DELAY.as_secs(),
            max_delay_secs: None,
            jitter: 0.0,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            retry_batch_size: DEFAULT_RETRY_BATCH_SIZE,
            stale_pending_secs: DEFAULT_STALE_PENDING_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            response_body_limit: DEFAULT_RESPONSE_BODY_LIMIT,
            max_configs_per_org: DEFAULT_MAX_CONFIGS_PER_ORG,
            allow_http: false,
        }
    }
}

impl DeliverySettings {
    /// Load settings from the process environment.
    ///
    /// Optional (defaults in parentheses):
    /// - `WEBHOOK_MAX_ATTEMPTS` (5)
    /// - `WEBHOOK_BASE_DELAY_SECS` (60)
    /// - `WEBHOOK_MAX_DELAY_SECS` (no cap)
    /// - `WEBHOOK_JITTER` (0.0)
    /// - `WEBHOOK_RETRY_INTERVAL_SECS` (60)
    /// - `WEBHOOK_RETRY_BATCH_SIZE` (100)
    /// - `WEBHOOK_STALE_PENDING_SECS` (300, must exceed 60)
    /// - `WEBHOOK_USER_AGENT` (`CMIS-Webhook/1.0`)
    /// - `WEBHOOK_RESPONSE_BODY_LIMIT` (1000)
    /// - `WEBHOOK_MAX_CONFIGS_PER_ORG` (10)
    /// - `WEBHOOK_ALLOW_HTTP` (false)
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let settings = Self {
            max_attempts: parse_or(&lookup, "WEBHOOK_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay_secs: parse_or(
                &lookup,
                "WEBHOOK_BASE_DELAY_SECS",
                defaults.base_delay_secs,
            )?,
            max_delay_secs: parse_opt(&lookup, "WEBHOOK_MAX_DELAY_SECS")?,
            jitter: parse_or(&lookup, "WEBHOOK_JITTER", defaults.jitter)?,
            retry_interval_secs: parse_or(
                &lookup,
                "WEBHOOK_RETRY_INTERVAL_SECS",
                defaults.retry_interval_secs,
            )?,
            retry_batch_size: parse_or(
                &lookup,
                "WEBHOOK_RETRY_BATCH_SIZE",
                defaults.retry_batch_size,
            )?,
            stale_pending_secs: parse_or(
                &lookup,
                "WEBHOOK_STALE_PENDING_SECS",
                defaults.stale_pending_secs,
            )?,
            user_agent: lookup("WEBHOOK_USER_AGENT")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.user_agent),
            response_body_limit: parse_or(
                &lookup,
                "WEBHOOK_RESPONSE_BODY_LIMIT",
                defaults.response_body_limit,
            )?,
            max_configs_per_org: parse_or(
                &lookup,
                "WEBHOOK_MAX_CONFIGS_PER_ORG",
                defaults.max_configs_per_org,
            )?,
            allow_http: parse_bool(&lookup, "WEBHOOK_ALLOW_HTTP", defaults.allow_http)?,
        };

        settings.retry_policy().map_err(|e| SettingsError::Invalid {
            var: "WEBHOOK_*".to_string(),
            reason: e.to_string(),
        })?;
        if settings.retry_interval_secs == 0 {
            return Err(SettingsError::Invalid {
                var: "WEBHOOK_RETRY_INTERVAL_SECS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if settings.stale_pending_secs <= u64::from(MAX_TIMEOUT_SECS) {
            return Err(SettingsError::Invalid {
                var: "WEBHOOK_STALE_PENDING_SECS".to_string(),
                reason: format!("must be greater than {MAX_TIMEOUT_SECS}"),
            });
        }
        Ok(settings)
    }

    /// Build and validate the retry policy described by these settings.
    pub fn retry_policy(&self) -> Result<RetryPolicy, WebhookError> {
        let mut policy = RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_secs(self.base_delay_secs),
        )
        .with_jitter(self.jitter);
        if let Some(cap) = self.max_delay_secs {
            policy = policy.with_max_delay(Duration::from_secs(cap));
        }
        policy.validate()?;
        Ok(policy)
    }

    pub fn registration_rules(&self) -> RegistrationRules {
        RegistrationRules {
            allow_http: self.allow_http,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn stale_pending_after(&self) -> Duration {
        Duration::from_secs(self.stale_pending_secs)
    }
}

/// Read a required variable (e.g. `DATABASE_URL`).
pub fn required(var: &str) -> Result<String, SettingsError> {
    env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| SettingsError::Missing {
            var: var.to_string(),
        })
}

fn parse_opt<T, F>(lookup: &F, var: &str) -> Result<Option<T>, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SettingsError::Invalid {
                var: var.to_string(),
                reason: format!("{raw:?}: {e}"),
            }),
        _ => Ok(None),
    }
}

fn parse_or<T, F>(lookup: &F, var: &str, default: T) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, var)?.unwrap_or(default))
}

fn parse_bool<F>(lookup: &F, var: &str, default: bool) -> Result<bool, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SettingsError::Invalid {
            var: var.to_string(),
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<DeliverySettings, SettingsError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DeliverySettings::from_lookup(|k| vars.get(k).cloned())
    }

    fn invalid_var(err: SettingsError) -> String {
        match err {
            SettingsError::Invalid { var, .. } => var,
            other => panic!("expected an invalid value, got {other:?}"),
        }
    }

    #[test]
    fn defaults_when_unset() {
        let settings = load(&[]).unwrap();
        assert_eq!(settings, DeliverySettings::default());

        let policy = settings.retry_policy().unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(60));
        assert_eq!(policy.max_delay, None);
    }

    #[test]
    fn overrides_are_parsed() {
        let settings = load(&[
            ("WEBHOOK_MAX_ATTEMPTS", "3"),
            ("WEBHOOK_BASE_DELAY_SECS", "10"),
            ("WEBHOOK_MAX_DELAY_SECS", "600"),
            ("WEBHOOK_ALLOW_HTTP", "true"),
            ("WEBHOOK_USER_AGENT", "Acme/2.0"),
        ])
        .unwrap();

        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.max_delay_secs, Some(600));
        assert!(settings.registration_rules().allow_http);
        assert_eq!(settings.user_agent, "Acme/2.0");
    }

    #[test]
    fn malformed_value_names_the_variable() {
        let err = load(&[("WEBHOOK_RETRY_BATCH_SIZE", "lots")]).unwrap_err();
        assert_eq!(invalid_var(err), "WEBHOOK_RETRY_BATCH_SIZE");

        let err = load(&[("WEBHOOK_ALLOW_HTTP", "maybe")]).unwrap_err();
        assert_eq!(invalid_var(err), "WEBHOOK_ALLOW_HTTP");
    }

    #[test]
    fn invalid_policy_is_rejected() {
        assert!(load(&[("WEBHOOK_MAX_ATTEMPTS", "0")]).is_err());
        assert!(load(&[("WEBHOOK_JITTER", "1.5")]).is_err());
        assert!(load(&[("WEBHOOK_RETRY_INTERVAL_SECS", "0")]).is_err());
    }

    #[test]
    fn stale_threshold_must_outlast_request_timeouts() {
        assert_eq!(load(&[]).unwrap().stale_pending_after(), Duration::from_secs(300));
        assert_eq!(
            load(&[("WEBHOOK_STALE_PENDING_SECS", "61")]).unwrap().stale_pending_secs,
            61
        );

        let err = load(&[("WEBHOOK_STALE_PENDING_SECS", "60")]).unwrap_err();
        assert_eq!(invalid_var(err), "WEBHOOK_STALE_PENDING_SECS");
    }
}
