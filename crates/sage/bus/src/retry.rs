//! Background retry wrapper for bus publishers
//!
//! Governance decisions are durable in the store before anything is
//! published, so a broker hiccup must not fail the operation. The wrapper
//! hands failed publishes to a background task that retries with
//! exponential backoff and logs if the attempts run out.

use crate::message::BusMessage;
use crate::GovernanceBus;
use async_trait::async_trait;
use sage_types::BusResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Wraps a bus so transient publish failures retry in the background
pub struct RetryingPublisher<B: ?Sized> {
    inner: Arc<B>,
    retries: u32,
    backoff: Duration,
}

impl<B: GovernanceBus + ?Sized + 'static> RetryingPublisher<B> {
    /// `retries` further attempts are made after a failed publish, the
    /// first one after `backoff`, doubling each time.
    pub fn new(inner: Arc<B>, retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            retries,
            backoff,
        }
    }
}

#[async_trait]
impl<B: GovernanceBus + ?Sized + 'static> GovernanceBus for RetryingPublisher<B> {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        let first = self.inner.publish(message.clone()).await;
        let Err(err) = first else {
            return Ok(());
        };

        warn!(
            topic = %message.topic(),
            kind = message.kind(),
            error = %err,
            "publish failed, retrying in background"
        );

        let inner = Arc::clone(&self.inner);
        let retries = self.retries;
        let mut backoff = self.backoff;
        tokio::spawn(async move {
            for attempt in 1..=retries {
                tokio::time::sleep(backoff).await;
                match inner.publish(message.clone()).await {
                    Ok(()) => return,
                    Err(err) => {
                        if attempt == retries {
                            error!(
                                topic = %message.topic(),
                                kind = message.kind(),
                                error = %err,
                                attempts = retries + 1,
                                "publish retries exhausted, message dropped"
                            );
                        }
                    }
                }
                backoff *= 2;
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_types::{BusError, ChangeId};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` publishes, then delivers.
    struct FlakyBus {
        failures: u32,
        attempts: AtomicU32,
    }

    impl FlakyBus {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl GovernanceBus for FlakyBus {
        async fn publish(&self, _message: BusMessage) -> BusResult<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(BusError::PublishFailed("broker unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    fn test_message() -> BusMessage {
        BusMessage::ChangeRejected {
            change_id: ChangeId::new("c1"),
        }
    }

    #[tokio::test]
    async fn publish_succeeds_without_retries_when_bus_is_healthy() {
        let inner = Arc::new(FlakyBus::new(0));
        let publisher = RetryingPublisher::new(Arc::clone(&inner), 3, Duration::from_millis(1));
        publisher.publish(test_message()).await.unwrap();
        assert_eq!(inner.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_publish_is_retried_until_delivered() {
        let inner = Arc::new(FlakyBus::new(2));
        let publisher = RetryingPublisher::new(Arc::clone(&inner), 5, Duration::from_millis(1));
        publisher.publish(test_message()).await.unwrap();

        // The background task needs a few backoff periods.
        for _ in 0..50 {
            if inner.attempts.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(inner.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_after_the_configured_attempts() {
        let inner = Arc::new(FlakyBus::new(u32::MAX));
        let publisher = RetryingPublisher::new(Arc::clone(&inner), 2, Duration::from_millis(1));
        publisher.publish(test_message()).await.unwrap();

        for _ in 0..50 {
            if inner.attempts.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        // One initial attempt plus two retries.
        assert_eq!(inner.attempts.load(Ordering::SeqCst), 3);
    }
}
