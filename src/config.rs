//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::queue::RedeliveryPolicy;

/// Fleet controller configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Redelivery policy applied to the subscription when it is created.
    pub redelivery: RedeliveryPolicy,
    /// Retry policy for control calls against the broker.
    pub retry: RetryPolicy,
    /// Entry point every worker instance runs, whatever the image default is.
    pub worker_command: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redelivery: RedeliveryPolicy::default(),
            retry: RetryPolicy::default(),
            worker_command: vec!["turbine".to_string(), "worker".to_string()],
        }
    }
}

/// Per-instance worker agent configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a single pull may block waiting for a message.
    pub pull_wait: Duration,
    /// How often the lease keeper extends the current lease.
    pub lease_extension_interval: Duration,
    /// How far each extension pushes the lease deadline.
    pub lease_extension: Duration,
    /// Upper bound on a single script run.
    pub script_timeout: Duration,
    /// Upper bound on a single object transfer.
    pub transfer_timeout: Duration,
    /// Parent directory for per-attempt working directories.
    pub scratch_root: PathBuf,
    /// Empty-queue self-termination policy.
    pub termination: TerminationPolicy,
    /// Retry policy for pull/ack/extend calls.
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pull_wait: Duration::from_secs(10),
            lease_extension_interval: Duration::from_secs(20),
            lease_extension: Duration::from_secs(60),
            script_timeout: Duration::from_secs(6 * 3600),
            transfer_timeout: Duration::from_secs(600),
            scratch_root: std::env::temp_dir().join("turbine"),
            termination: TerminationPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Build from `TURBINE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            pull_wait: env_secs("TURBINE_PULL_WAIT_SECS").unwrap_or(defaults.pull_wait),
            lease_extension_interval: env_secs("TURBINE_LEASE_EXTEND_EVERY_SECS")
                .unwrap_or(defaults.lease_extension_interval),
            lease_extension: env_secs("TURBINE_LEASE_EXTEND_SECS")
                .unwrap_or(defaults.lease_extension),
            script_timeout: env_secs("TURBINE_SCRIPT_TIMEOUT_SECS")
                .unwrap_or(defaults.script_timeout),
            transfer_timeout: env_secs("TURBINE_TRANSFER_TIMEOUT_SECS")
                .unwrap_or(defaults.transfer_timeout),
            scratch_root: std::env::var("TURBINE_SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_root),
            termination: TerminationPolicy {
                grace_interval: env_secs("TURBINE_GRACE_SECS")
                    .unwrap_or(defaults.termination.grace_interval),
                confirmations: std::env::var("TURBINE_GRACE_CHECKS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.termination.confirmations),
            },
            retry: defaults.retry,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject timings the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("lease_extension_interval", self.lease_extension_interval),
            ("lease_extension", self.lease_extension),
            ("script_timeout", self.script_timeout),
            ("transfer_timeout", self.transfer_timeout),
        ];
        for (key, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.lease_extension_interval >= self.lease_extension {
            return Err(ConfigError::InvalidValue {
                key: "lease_extension_interval".to_string(),
                message: format!(
                    "{:?} must be shorter than the extension of {:?}",
                    self.lease_extension_interval, self.lease_extension
                ),
            });
        }
        Ok(())
    }
}

/// How cautiously an idle worker decides the queue is drained.
///
/// After an empty pull the worker waits `grace_interval` and re-checks, and
/// only self-terminates after `confirmations` consecutive empty checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub grace_interval: Duration,
    pub confirmations: u32,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace_interval: Duration::from_secs(30),
            confirmations: 3,
        }
    }
}

/// Exponential backoff for transient broker errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once).
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based), with up to 20% jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 5;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::random::<u64>() % jitter_ms)
        } else {
            Duration::ZERO
        };
        base + jitter
    }
}

pub(crate) fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
