//! Background lease extension while a task attempt is in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::queue::{Lease, QueueClient};

/// Periodically extends one lease until dropped.
///
/// Dropping the keeper stops extension, so an agent that dies mid-attempt
/// lets the lease lapse and the broker redelivers the message.
pub struct LeaseKeeper {
    handle: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl LeaseKeeper {
    pub fn spawn(queue: QueueClient, lease: Lease, every: Duration, extension: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match queue.extend(&lease, extension).await {
                    Ok(_) => debug!(message_id = %lease.message_id, "Lease extended"),
                    Err(e) if e.is_outage() => {
                        warn!(message_id = %lease.message_id, error = %e, "Lease extension failed, retrying next tick");
                    }
                    Err(e) => {
                        warn!(message_id = %lease.message_id, error = %e, "Lease lost");
                        flag.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        });

        Self { handle, lost }
    }

    /// The broker refused an extension; another worker may own the message now.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::queue::{InMemoryBroker, QueueResource, RedeliveryPolicy};
    use crate::task::TaskEnvelope;

    async fn queue(ack_deadline: Duration) -> (Arc<InMemoryBroker>, QueueClient) {
        queue_with_retry(ack_deadline, RetryPolicy::default()).await
    }

    async fn queue_with_retry(
        ack_deadline: Duration,
        retry: RetryPolicy,
    ) -> (Arc<InMemoryBroker>, QueueClient) {
        let broker = Arc::new(InMemoryBroker::new());
        let client = QueueClient::new(broker.clone(), QueueResource::for_name("keeper"), retry);
        client
            .provision(&RedeliveryPolicy {
                ack_deadline,
                ..Default::default()
            })
            .await
            .unwrap();
        client.publish(&TaskEnvelope::new("true")).await.unwrap();
        (broker, client)
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_lease_past_original_deadline() {
        let (_broker, client) = queue(Duration::from_secs(10)).await;
        let delivery = client.pull(Duration::ZERO).await.unwrap().unwrap();
        let keeper = LeaseKeeper::spawn(
            client.clone(),
            delivery.lease.clone(),
            Duration::from_secs(4),
            Duration::from_secs(10),
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!keeper.is_lost());
        assert!(client.pull(Duration::ZERO).await.unwrap().is_none());
        client.ack(&delivery.lease).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn brief_outage_does_not_drop_the_lease() {
        let retry = RetryPolicy {
            max_retries: 1,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
        };
        let (broker, client) = queue_with_retry(Duration::from_secs(10), retry).await;
        let delivery = client.pull(Duration::ZERO).await.unwrap().unwrap();
        let keeper = LeaseKeeper::spawn(
            client.clone(),
            delivery.lease.clone(),
            Duration::from_secs(4),
            Duration::from_secs(10),
        );

        // Both the first extension and its single retry fail.
        broker.fail_next(2).await;
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert!(!keeper.is_lost());
        assert!(client.pull(Duration::ZERO).await.unwrap().is_none());
        client.ack(&delivery.lease).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_keeper_lets_lease_lapse() {
        let (_broker, client) = queue(Duration::from_secs(10)).await;
        let delivery = client.pull(Duration::ZERO).await.unwrap().unwrap();
        let keeper = LeaseKeeper::spawn(
            client.clone(),
            delivery.lease.clone(),
            Duration::from_secs(4),
            Duration::from_secs(10),
        );
        drop(keeper);

        let again = client
            .pull(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.lease.message_id, delivery.lease.message_id);
        assert_eq!(again.lease.delivery_attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn extension_after_expiry_marks_lost() {
        let (_broker, client) = queue(Duration::from_secs(2)).await;
        let delivery = client.pull(Duration::ZERO).await.unwrap().unwrap();
        let keeper = LeaseKeeper::spawn(
            client.clone(),
            delivery.lease.clone(),
            Duration::from_secs(5),
            Duration::from_secs(10),
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(keeper.is_lost());
    }
}
