//! Task queue — broker interface, redelivery policy, and the queue client.
//!
//! - `broker` — `Broker` trait the rest of the crate talks to
//! - `memory` — in-memory broker enforcing lease semantics
//! - `policy` — `RedeliveryPolicy` (max attempts, ack deadline, dead letter)
//!
//! `QueueClient` binds a broker handle to one topic/subscription pair and
//! retries transient broker errors with backoff.

pub mod broker;
pub mod memory;
pub mod policy;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::{EnvelopeError, QueueError};
use crate::task::TaskEnvelope;

pub use broker::{Broker, ReceivedMessage};
pub use memory::{DeadLetter, InMemoryBroker};
pub use policy::RedeliveryPolicy;

/// Topic and subscription names owned by one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueResource {
    pub topic: String,
    pub subscription: String,
}

impl QueueResource {
    /// Derive resource names from the user-supplied engine name.
    pub fn for_name(name: &str) -> Self {
        Self {
            topic: format!("{name}-topic"),
            subscription: format!("{name}-sub"),
        }
    }
}

/// A claim on one delivered message.
#[derive(Debug, Clone)]
pub struct Lease {
    pub message_id: String,
    pub ack_id: String,
    pub delivery_attempt: u32,
    pub deadline: Instant,
}

/// A leased message whose payload has not been decoded yet.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub lease: Lease,
    payload: Vec<u8>,
}

impl Delivery {
    /// Decode and validate the envelope. A malformed payload is the
    /// caller's problem to handle; the lease is unaffected.
    pub fn envelope(&self) -> Result<TaskEnvelope, EnvelopeError> {
        TaskEnvelope::decode(&self.payload)
    }
}

impl From<ReceivedMessage> for Delivery {
    fn from(message: ReceivedMessage) -> Self {
        Self {
            lease: Lease {
                message_id: message.message_id,
                ack_id: message.ack_id,
                delivery_attempt: message.delivery_attempt,
                deadline: message.deadline,
            },
            payload: message.payload,
        }
    }
}

/// Queue operations bound to one topic/subscription.
#[derive(Clone)]
pub struct QueueClient {
    broker: Arc<dyn Broker>,
    resource: QueueResource,
    retry: RetryPolicy,
}

impl QueueClient {
    pub fn new(broker: Arc<dyn Broker>, resource: QueueResource, retry: RetryPolicy) -> Self {
        Self {
            broker,
            resource,
            retry,
        }
    }

    pub fn resource(&self) -> &QueueResource {
        &self.resource
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Create the topic and its subscription if they do not exist yet.
    pub async fn provision(&self, policy: &RedeliveryPolicy) -> Result<(), QueueError> {
        let topic = &self.resource.topic;
        let subscription = &self.resource.subscription;

        let created = self
            .with_retry("create_topic", || self.broker.create_topic(topic))
            .await?;
        if created {
            info!(topic = %topic, "Created topic");
        } else {
            debug!(topic = %topic, "Topic already exists");
        }

        let created = self
            .with_retry("create_subscription", || {
                self.broker.create_subscription(topic, subscription, policy)
            })
            .await?;
        if created {
            info!(
                subscription = %subscription,
                max_attempts = policy.max_attempts,
                ack_deadline_secs = policy.ack_deadline.as_secs(),
                "Created subscription"
            );
        } else {
            debug!(subscription = %subscription, "Subscription already exists");
        }
        Ok(())
    }

    /// Delete the subscription, then the topic. Missing resources are skipped.
    pub async fn teardown(&self) -> Result<(), QueueError> {
        let subscription = &self.resource.subscription;
        match self
            .with_retry("delete_subscription", || {
                self.broker.delete_subscription(subscription)
            })
            .await
        {
            Ok(()) => info!(subscription = %subscription, "Deleted subscription"),
            Err(QueueError::SubscriptionNotFound(_)) => {
                debug!(subscription = %subscription, "Subscription already gone")
            }
            Err(e) => return Err(e),
        }

        let topic = &self.resource.topic;
        match self
            .with_retry("delete_topic", || self.broker.delete_topic(topic))
            .await
        {
            Ok(()) => info!(topic = %topic, "Deleted topic"),
            Err(QueueError::TopicNotFound(_)) => debug!(topic = %topic, "Topic already gone"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Publish one envelope. Returns the broker message id.
    pub async fn publish(&self, envelope: &TaskEnvelope) -> Result<String, QueueError> {
        let payload = envelope.encode()?;
        let topic = &self.resource.topic;
        self.with_retry("publish", || self.broker.publish(topic, payload.clone()))
            .await
    }

    /// Wait up to `max_wait` for a message. `None` means the wait window
    /// passed with nothing to do.
    pub async fn pull(&self, max_wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let subscription = &self.resource.subscription;
        let received = self
            .with_retry("pull", || self.broker.pull(subscription, max_wait))
            .await?;
        Ok(received.map(Delivery::from))
    }

    pub async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let subscription = &self.resource.subscription;
        self.with_retry("ack", || self.broker.ack(subscription, &lease.ack_id))
            .await
    }

    /// Push the lease deadline out by `extension` from now.
    pub async fn extend(&self, lease: &Lease, extension: Duration) -> Result<Instant, QueueError> {
        let subscription = &self.resource.subscription;
        self.with_retry("extend", || {
            self.broker
                .modify_ack_deadline(subscription, &lease.ack_id, extension)
        })
        .await
    }

    /// Approximate number of unsettled messages. Never sufficient on its own
    /// for an irreversible decision.
    pub async fn approximate_depth(&self) -> Result<u64, QueueError> {
        let subscription = &self.resource.subscription;
        self.with_retry("approximate_depth", || {
            self.broker.approximate_depth(subscription)
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.retry.max_retries => {
                    retry += 1;
                    let backoff = self.retry.backoff(retry);
                    warn!(
                        op,
                        retry,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient broker error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(QueueError::RetriesExhausted {
                        attempts: retry + 1,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        }
    }

    async fn client(max_retries: u32) -> (Arc<InMemoryBroker>, QueueClient) {
        let broker = Arc::new(InMemoryBroker::new());
        let client = QueueClient::new(
            broker.clone(),
            QueueResource::for_name("demo"),
            fast_retry(max_retries),
        );
        client.provision(&RedeliveryPolicy::default()).await.unwrap();
        (broker, client)
    }

    #[test]
    fn resource_names_derive_from_engine_name() {
        let resource = QueueResource::for_name("sat");
        assert_eq!(resource.topic, "sat-topic");
        assert_eq!(resource.subscription, "sat-sub");
    }

    #[tokio::test]
    async fn publish_pull_ack_roundtrip() {
        let (broker, client) = client(0).await;
        let envelope = TaskEnvelope::new("echo hi").with_output("out.txt", "mem://b/out.txt");
        let id = client.publish(&envelope).await.unwrap();

        let delivery = client.pull(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.lease.message_id, id);
        assert_eq!(delivery.lease.delivery_attempt, 1);
        assert_eq!(delivery.envelope().unwrap(), envelope);

        client.ack(&delivery.lease).await.unwrap();
        assert_eq!(broker.ack_count(&id).await, 1);
        assert_eq!(client.approximate_depth().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let (broker, client) = client(3).await;
        broker.fail_next(2).await;
        client.publish(&TaskEnvelope::new("true")).await.unwrap();
        assert_eq!(client.approximate_depth().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_loudly() {
        let (broker, client) = client(1).await;
        broker.fail_next(5).await;
        let err = client.publish(&TaskEnvelope::new("true")).await.unwrap_err();
        assert!(matches!(err, QueueError::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = QueueClient::new(broker, QueueResource::for_name("nope"), fast_retry(5));
        let err = client.publish(&TaskEnvelope::new("true")).await.unwrap_err();
        assert!(matches!(err, QueueError::TopicNotFound(_)));
    }

    #[tokio::test]
    async fn provision_twice_then_teardown() {
        let (broker, client) = client(0).await;
        client.provision(&RedeliveryPolicy::default()).await.unwrap();
        assert_eq!(broker.topic_count().await, 1);

        client.teardown().await.unwrap();
        assert!(!broker.has_subscription("demo-sub").await);
        assert!(!broker.has_topic("demo-topic").await);
        client.teardown().await.unwrap();
    }
}
