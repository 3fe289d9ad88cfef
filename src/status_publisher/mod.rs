//! StatusPublisher - Verified status republish
//!
//! ## Responsibilities
//!
//! - Serialize `VerifiedStatus` and publish it on the status topic
//! - Bounded attempts with a hard timeout per attempt
//!
//! A failed publish is reported once and not retried later: the verdict
//! would be stale by then.

use crate::call_guard::{run_bounded, RetryPolicy};
use crate::error::{Error, Result};
use crate::models::VerifiedStatus;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outbound broker seam
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// rumqttc-backed publisher sharing the subscriber's connection
#[derive(Clone)]
pub struct MqttBroker {
    client: AsyncClient,
}

impl MqttBroker {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BrokerPublisher for MqttBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Broker(e.to_string()))
    }
}

/// Status Publisher
pub struct StatusPublisher {
    broker: Arc<dyn BrokerPublisher>,
    topic: String,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    /// Never cancelled: verdicts are published even during forced shutdown
    detached: CancellationToken,
}

impl StatusPublisher {
    /// Create new StatusPublisher (2 attempts, 1s apart, 5s per attempt)
    pub fn new(broker: Arc<dyn BrokerPublisher>, topic: impl Into<String>) -> Self {
        Self::with_policy(
            broker,
            topic,
            RetryPolicy::new(2, Duration::from_secs(1)),
            Duration::from_secs(5),
        )
    }

    pub fn with_policy(
        broker: Arc<dyn BrokerPublisher>,
        topic: impl Into<String>,
        retry: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            retry,
            attempt_timeout,
            detached: CancellationToken::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish one verified status
    pub async fn publish(&self, status: &VerifiedStatus) -> Result<()> {
        let payload = status.to_payload()?;

        let result = self
            .retry
            .retry("status publish", &self.detached, |_| {
                run_bounded(
                    "status publish",
                    self.attempt_timeout,
                    &self.detached,
                    self.broker.publish(&self.topic, payload.clone()),
                )
            })
            .await;

        match &result {
            Ok(()) => {
                tracing::info!(
                    topic = %self.topic,
                    wildfire_detected = status.wildfire_detected(),
                    verified = status.verification().is_some(),
                    "Status published"
                );
            }
            Err(e) => {
                tracing::error!(
                    topic = %self.topic,
                    wildfire_detected = status.wildfire_detected(),
                    error = %e,
                    "Status publish failed"
                );
            }
        }
        result
    }
}
