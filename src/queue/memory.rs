//! In-memory broker with lease expiry and redelivery.
//!
//! Each message holds at most one lease at a time; a lease that lapses puts
//! the message back at the end of the ready queue, or exhausts it once the
//! subscription's `RedeliveryPolicy` allows no further attempts. Also keeps
//! an acknowledgement ledger and a dead-letter record for inspection.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::RedeliveryPolicy;
use crate::queue::broker::{Broker, ReceivedMessage};

/// A message that ran out of delivery attempts.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub subscription: String,
    pub message_id: String,
    pub payload: Vec<u8>,
    pub attempts: u32,
    /// Dead-letter topic the payload was forwarded to, if any.
    pub forwarded_to: Option<String>,
}

struct ActiveLease {
    ack_id: String,
    deadline: Instant,
}

struct StoredMessage {
    payload: Vec<u8>,
    attempts: u32,
    lease: Option<ActiveLease>,
}

struct SubscriptionState {
    topic: String,
    policy: RedeliveryPolicy,
    messages: HashMap<String, StoredMessage>,
    ready: VecDeque<String>,
    /// ack_id -> message_id for every unexpired or not yet reclaimed lease.
    leases: HashMap<String, String>,
}

impl SubscriptionState {
    fn new(topic: &str, policy: &RedeliveryPolicy) -> Self {
        Self {
            topic: topic.to_string(),
            policy: policy.clone(),
            messages: HashMap::new(),
            ready: VecDeque::new(),
            leases: HashMap::new(),
        }
    }

    fn lease_next(&mut self, now: Instant) -> Option<ReceivedMessage> {
        while let Some(message_id) = self.ready.pop_front() {
            let Some(message) = self.messages.get_mut(&message_id) else {
                continue;
            };
            if message.lease.is_some() {
                continue;
            }

            message.attempts += 1;
            let ack_id = Uuid::new_v4().to_string();
            let deadline = now + self.policy.ack_deadline;
            message.lease = Some(ActiveLease {
                ack_id: ack_id.clone(),
                deadline,
            });
            self.leases.insert(ack_id.clone(), message_id.clone());
            if self.policy.is_last_attempt(message.attempts) {
                debug!(message_id = %message_id, attempt = message.attempts, "Final delivery attempt");
            }

            return Some(ReceivedMessage {
                message_id,
                ack_id,
                payload: message.payload.clone(),
                delivery_attempt: message.attempts,
                deadline,
            });
        }
        None
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.messages
            .values()
            .filter_map(|m| m.lease.as_ref().map(|l| l.deadline))
            .min()
    }

    /// Resolve a live lease to its message id.
    fn live_lease(&self, ack_id: &str, now: Instant) -> Result<String, QueueError> {
        let message_id = self
            .leases
            .get(ack_id)
            .ok_or_else(|| QueueError::UnknownLease {
                ack_id: ack_id.to_string(),
            })?;
        let expired = self
            .messages
            .get(message_id)
            .and_then(|m| m.lease.as_ref())
            .is_none_or(|l| l.deadline <= now);
        if expired {
            return Err(QueueError::LeaseExpired {
                ack_id: ack_id.to_string(),
            });
        }
        Ok(message_id.clone())
    }
}

#[derive(Default)]
struct BrokerState {
    /// topic -> attached subscriptions
    topics: HashMap<String, Vec<String>>,
    subscriptions: HashMap<String, SubscriptionState>,
    ack_ledger: HashMap<String, u32>,
    dead_letters: Vec<DeadLetter>,
    injected_failures: u32,
    next_message_id: u64,
}

impl BrokerState {
    fn take_injected_failure(&mut self) -> Result<(), QueueError> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(QueueError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn deliver(&mut self, topic: &str, payload: Vec<u8>) -> Result<String, QueueError> {
        let subscriptions = self
            .topics
            .get(topic)
            .ok_or_else(|| QueueError::TopicNotFound(topic.to_string()))?
            .clone();

        self.next_message_id += 1;
        let message_id = self.next_message_id.to_string();

        for name in subscriptions {
            if let Some(sub) = self.subscriptions.get_mut(&name) {
                sub.messages.insert(
                    message_id.clone(),
                    StoredMessage {
                        payload: payload.clone(),
                        attempts: 0,
                        lease: None,
                    },
                );
                sub.ready.push_back(message_id.clone());
            }
        }
        Ok(message_id)
    }

    /// Release lapsed leases, requeueing or exhausting their messages.
    fn reclaim_expired(&mut self, subscription: &str, now: Instant) {
        let Some(sub) = self.subscriptions.get_mut(subscription) else {
            return;
        };

        let lapsed: Vec<String> = sub
            .messages
            .iter()
            .filter(|(_, m)| m.lease.as_ref().is_some_and(|l| l.deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut exhausted = Vec::new();
        for message_id in lapsed {
            let Some(message) = sub.messages.get_mut(&message_id) else {
                continue;
            };
            if let Some(lease) = message.lease.take() {
                sub.leases.remove(&lease.ack_id);
            }
            if sub.policy.is_exhausted(message.attempts) {
                if let Some(message) = sub.messages.remove(&message_id) {
                    exhausted.push((message_id, message));
                }
            } else {
                debug!(subscription, message_id = %message_id, "Lease lapsed, message requeued");
                sub.ready.push_back(message_id);
            }
        }

        let dead_letter_topic = sub.policy.dead_letter_topic.clone();
        for (message_id, message) in exhausted {
            let forwarded_to = match &dead_letter_topic {
                Some(topic) => match self.deliver(topic, message.payload.clone()) {
                    Ok(_) => Some(topic.clone()),
                    Err(e) => {
                        warn!(subscription, message_id = %message_id, error = %e, "Dead-letter forward failed");
                        None
                    }
                },
                None => None,
            };
            if forwarded_to.is_none() {
                warn!(
                    subscription,
                    message_id = %message_id,
                    attempts = message.attempts,
                    "Delivery attempts exhausted, message dropped"
                );
            }
            self.dead_letters.push(DeadLetter {
                subscription: subscription.to_string(),
                message_id,
                payload: message.payload,
                attempts: message.attempts,
                forwarded_to,
            });
        }
    }
}

/// Process-local broker used by tests and the local runner.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` broker calls fail with a transient error.
    pub async fn fail_next(&self, count: u32) {
        self.state.lock().await.injected_failures = count;
    }

    /// How many times `message_id` was successfully acknowledged.
    pub async fn ack_count(&self, message_id: &str) -> u32 {
        self.state
            .lock()
            .await
            .ack_ledger
            .get(message_id)
            .copied()
            .unwrap_or(0)
    }

    /// Total successful acknowledgements across all messages.
    pub async fn total_acks(&self) -> u32 {
        self.state.lock().await.ack_ledger.values().sum()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Leases currently held on `subscription`, lapsed-but-unreclaimed included.
    pub async fn outstanding_leases(&self, subscription: &str) -> usize {
        self.state
            .lock()
            .await
            .subscriptions
            .get(subscription)
            .map(|s| s.leases.len())
            .unwrap_or(0)
    }

    pub async fn has_topic(&self, topic: &str) -> bool {
        self.state.lock().await.topics.contains_key(topic)
    }

    pub async fn has_subscription(&self, subscription: &str) -> bool {
        self.state
            .lock()
            .await
            .subscriptions
            .contains_key(subscription)
    }

    pub async fn topic_count(&self) -> usize {
        self.state.lock().await.topics.len()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn create_topic(&self, topic: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        state.take_injected_failure()?;
        if state.topics.contains_key(topic) {
            return Ok(false);
        }
        state.topics.insert(topic.to_string(), Vec::new());
        Ok(true)
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        policy: &RedeliveryPolicy,
    ) -> Result<bool, QueueError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.take_injected_failure()?;
        if state.subscriptions.contains_key(subscription) {
            return Ok(false);
        }
        let attached = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| QueueError::TopicNotFound(topic.to_string()))?;
        attached.push(subscription.to_string());
        state
            .subscriptions
            .insert(subscription.to_string(), SubscriptionState::new(topic, policy));
        Ok(true)
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.take_injected_failure()?;
        let removed = state
            .subscriptions
            .remove(subscription)
            .ok_or_else(|| QueueError::SubscriptionNotFound(subscription.to_string()))?;
        if let Some(attached) = state.topics.get_mut(&removed.topic) {
            attached.retain(|s| s != subscription);
        }
        Ok(())
    }

    async fn delete_topic(&self, topic: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.take_injected_failure()?;
        let attached = state
            .topics
            .get(topic)
            .ok_or_else(|| QueueError::TopicNotFound(topic.to_string()))?;
        if let Some(subscription) = attached.first() {
            return Err(QueueError::TopicInUse {
                topic: topic.to_string(),
                subscription: subscription.clone(),
            });
        }
        state.topics.remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<String, QueueError> {
        let message_id = {
            let mut state = self.state.lock().await;
            state.take_injected_failure()?;
            state.deliver(topic, payload)?
        };
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn pull(
        &self,
        subscription: &str,
        max_wait: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let wait_until = Instant::now() + max_wait;
        self.state.lock().await.take_injected_failure()?;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(subscription, now);
                let sub = state
                    .subscriptions
                    .get_mut(subscription)
                    .ok_or_else(|| QueueError::SubscriptionNotFound(subscription.to_string()))?;
                if let Some(message) = sub.lease_next(now) {
                    return Ok(Some(message));
                }
                if now >= wait_until {
                    return Ok(None);
                }
                sub.next_deadline()
                    .map_or(wait_until, |deadline| deadline.min(wait_until))
            };

            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), QueueError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.take_injected_failure()?;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| QueueError::SubscriptionNotFound(subscription.to_string()))?;
        let message_id = sub.live_lease(ack_id, Instant::now())?;
        sub.leases.remove(ack_id);
        sub.messages.remove(&message_id);
        *state.ack_ledger.entry(message_id).or_default() += 1;
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_id: &str,
        extension: Duration,
    ) -> Result<Instant, QueueError> {
        let mut state = self.state.lock().await;
        state.take_injected_failure()?;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| QueueError::SubscriptionNotFound(subscription.to_string()))?;
        let now = Instant::now();
        let message_id = sub.live_lease(ack_id, now)?;
        let deadline = now + extension;
        if let Some(lease) = sub
            .messages
            .get_mut(&message_id)
            .and_then(|m| m.lease.as_mut())
        {
            lease.deadline = deadline;
        }
        Ok(deadline)
    }

    async fn approximate_depth(&self, subscription: &str) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        state.take_injected_failure()?;
        state.reclaim_expired(subscription, Instant::now());
        let sub = state
            .subscriptions
            .get(subscription)
            .ok_or_else(|| QueueError::SubscriptionNotFound(subscription.to_string()))?;
        Ok(sub.messages.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "demo-topic";
    const SUB: &str = "demo-sub";

    async fn broker_with(policy: RedeliveryPolicy) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_topic(TOPIC).await.unwrap();
        broker.create_subscription(TOPIC, SUB, &policy).await.unwrap();
        broker
    }

    fn short_lease(max_attempts: u32) -> RedeliveryPolicy {
        RedeliveryPolicy {
            max_attempts,
            ack_deadline: Duration::from_secs(10),
            dead_letter_topic: None,
        }
    }

    #[tokio::test]
    async fn provisioning_is_idempotent() {
        let broker = broker_with(RedeliveryPolicy::default()).await;
        assert!(!broker.create_topic(TOPIC).await.unwrap());
        assert!(
            !broker
                .create_subscription(TOPIC, SUB, &RedeliveryPolicy::default())
                .await
                .unwrap()
        );
        assert_eq!(broker.topic_count().await, 1);
    }

    #[tokio::test]
    async fn subscription_requires_topic() {
        let broker = InMemoryBroker::new();
        let err = broker
            .create_subscription("missing", SUB, &RedeliveryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::TopicNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pull_waits_then_returns_none() {
        let broker = broker_with(RedeliveryPolicy::default()).await;
        let start = Instant::now();
        let pulled = broker.pull(SUB, Duration::from_secs(5)).await.unwrap();
        assert!(pulled.is_none());
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn pull_wakes_on_publish() {
        let broker = std::sync::Arc::new(broker_with(RedeliveryPolicy::default()).await);
        let puller = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.pull(SUB, Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        broker.publish(TOPIC, b"hi".to_vec()).await.unwrap();

        let message = puller.await.unwrap().unwrap().unwrap();
        assert_eq!(message.payload, b"hi");
        assert_eq!(message.delivery_attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leased_message_is_not_handed_out_twice() {
        let broker = broker_with(short_lease(5)).await;
        broker.publish(TOPIC, b"one".to_vec()).await.unwrap();

        let first = broker.pull(SUB, Duration::ZERO).await.unwrap();
        assert!(first.is_some());
        let second = broker.pull(SUB, Duration::from_secs(5)).await.unwrap();
        assert!(second.is_none(), "lease still live, no second owner");
        assert_eq!(broker.outstanding_leases(SUB).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered_with_new_attempt() {
        let broker = broker_with(short_lease(5)).await;
        let id = broker.publish(TOPIC, b"one".to_vec()).await.unwrap();

        let first = broker.pull(SUB, Duration::ZERO).await.unwrap().unwrap();
        let second = broker
            .pull(SUB, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message_id, id);
        assert_eq!(second.delivery_attempt, 2);
        assert_ne!(first.ack_id, second.ack_id);

        let err = broker.ack(SUB, &first.ack_id).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownLease { .. }));
        broker.ack(SUB, &second.ack_id).await.unwrap();
        assert_eq!(broker.ack_count(&id).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn extension_keeps_lease_alive() {
        let broker = broker_with(short_lease(5)).await;
        broker.publish(TOPIC, b"one".to_vec()).await.unwrap();
        let msg = broker.pull(SUB, Duration::ZERO).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(8)).await;
        broker
            .modify_ack_deadline(SUB, &msg.ack_id, Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(8)).await;

        assert!(broker.pull(SUB, Duration::ZERO).await.unwrap().is_none());
        broker.ack(SUB, &msg.ack_id).await.unwrap();
        assert_eq!(broker.approximate_depth(SUB).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_after_deadline_is_rejected() {
        let broker = broker_with(short_lease(5)).await;
        broker.publish(TOPIC, b"one".to_vec()).await.unwrap();
        let msg = broker.pull(SUB, Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let err = broker.ack(SUB, &msg.ack_id).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseExpired { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_message_is_dead_lettered() {
        let policy = RedeliveryPolicy {
            dead_letter_topic: Some("dead".to_string()),
            ..short_lease(2)
        };
        let broker = broker_with(policy).await;
        broker.create_topic("dead").await.unwrap();
        broker
            .create_subscription("dead", "dead-sub", &RedeliveryPolicy::default())
            .await
            .unwrap();
        let id = broker.publish(TOPIC, b"doomed".to_vec()).await.unwrap();

        assert!(broker.pull(SUB, Duration::ZERO).await.unwrap().is_some());
        let again = broker.pull(SUB, Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(again.delivery_attempt, 2);
        assert!(broker.pull(SUB, Duration::from_secs(30)).await.unwrap().is_none());

        let dead = broker.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, id);
        assert_eq!(dead[0].forwarded_to.as_deref(), Some("dead"));
        assert_eq!(broker.approximate_depth(SUB).await.unwrap(), 0);
        assert_eq!(broker.approximate_depth("dead-sub").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn depth_counts_leased_messages() {
        let broker = broker_with(RedeliveryPolicy::default()).await;
        broker.publish(TOPIC, b"a".to_vec()).await.unwrap();
        broker.publish(TOPIC, b"b".to_vec()).await.unwrap();
        let _lease = broker.pull(SUB, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(broker.approximate_depth(SUB).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn topic_with_subscription_cannot_be_deleted() {
        let broker = broker_with(RedeliveryPolicy::default()).await;
        let err = broker.delete_topic(TOPIC).await.unwrap_err();
        assert!(matches!(err, QueueError::TopicInUse { .. }));

        broker.delete_subscription(SUB).await.unwrap();
        broker.delete_topic(TOPIC).await.unwrap();
        assert!(!broker.has_topic(TOPIC).await);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let broker = broker_with(RedeliveryPolicy::default()).await;
        broker.fail_next(1).await;
        let err = broker.publish(TOPIC, b"x".to_vec()).await.unwrap_err();
        assert!(err.is_transient());
        broker.publish(TOPIC, b"x".to_vec()).await.unwrap();
    }
}
