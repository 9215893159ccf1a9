//! Retry-by-redelivery policy.

use std::time::Duration;

/// How the broker treats messages whose leases lapse.
///
/// A message is offered at most `max_attempts` times. When the last lease
/// expires without an acknowledgement the message is exhausted: forwarded
/// to `dead_letter_topic` if one is set, dropped otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub max_attempts: u32,
    /// Initial lease length granted on every pull.
    pub ack_deadline: Duration,
    pub dead_letter_topic: Option<String>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            ack_deadline: Duration::from_secs(60),
            dead_letter_topic: None,
        }
    }
}

impl RedeliveryPolicy {
    /// No further delivery is allowed after `attempts` deliveries.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts.max(1)
    }

    /// The delivery numbered `attempt` is the final one.
    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        self.is_exhausted(attempt)
    }
}
