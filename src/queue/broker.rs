//! Message broker interface.
//!
//! The broker owns topics, subscriptions and lease bookkeeping. Everything
//! the core knows about task ownership comes through this trait.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::QueueError;
use crate::queue::RedeliveryPolicy;

/// A message handed out by `pull`, together with its lease.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Handle used to ack or extend this particular delivery.
    pub ack_id: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented by the broker on each redelivery.
    pub delivery_attempt: u32,
    pub deadline: Instant,
}

/// Backend-agnostic broker trait covering provisioning and delivery.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a topic. Returns `false` if it already existed.
    async fn create_topic(&self, topic: &str) -> Result<bool, QueueError>;

    /// Create a subscription bound to `topic`. Returns `false` if it already existed.
    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        policy: &RedeliveryPolicy,
    ) -> Result<bool, QueueError>;

    async fn delete_subscription(&self, subscription: &str) -> Result<(), QueueError>;

    /// Fails with `TopicInUse` while a subscription is still attached.
    async fn delete_topic(&self, topic: &str) -> Result<(), QueueError>;

    /// Publish a payload, returning the broker-assigned message id.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, QueueError>;

    /// Wait up to `max_wait` for a message and lease it.
    async fn pull(
        &self,
        subscription: &str,
        max_wait: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    async fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), QueueError>;

    /// Push the lease deadline to `now + extension`. Returns the new deadline.
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_id: &str,
        extension: Duration,
    ) -> Result<Instant, QueueError>;

    /// Messages neither acknowledged nor exhausted, leased ones included.
    /// Eventually consistent on real brokers.
    async fn approximate_depth(&self, subscription: &str) -> Result<u64, QueueError>;
}
