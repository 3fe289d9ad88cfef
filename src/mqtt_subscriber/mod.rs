//! MqttSubscriber - Long-lived broker subscription
//!
//! ## Responsibilities
//!
//! - Build the broker connection (credentials, TLS, keep-alive)
//! - (Re)subscribe on every ConnAck
//! - Hand each inbound publish to the `AlertRouter`, serially
//! - Graceful drain: stop routing on shutdown, keep the connection alive
//!   for in-flight sessions until the drain token fires

use crate::alert_router::AlertRouter;
use crate::state::MqttConfig;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause after a failed poll before reconnecting
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
/// Time allowed to flush DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
/// Request channel capacity between client and event loop
const REQUEST_CAPACITY: usize = 10;

/// Broker options from config
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let client_id = format!("{}-{}", config.client_id_prefix, &suffix[..8]);

    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    if config.use_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Create client + event loop pair
pub fn connect(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    tracing::info!(
        host = %config.host,
        port = config.port,
        tls = config.use_tls,
        "Connecting to MQTT broker"
    );
    AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY)
}

/// MqttSubscriber instance
pub struct MqttSubscriber {
    client: AsyncClient,
    eventloop: EventLoop,
    router: Arc<AlertRouter>,
}

impl MqttSubscriber {
    /// Create new MqttSubscriber
    pub fn new(client: AsyncClient, eventloop: EventLoop, router: Arc<AlertRouter>) -> Self {
        Self {
            client,
            eventloop,
            router,
        }
    }

    fn subscribe_all(&self) {
        for topic in self.router.topics() {
            match self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                Ok(()) => tracing::info!(topic = %topic, "Subscribed"),
                Err(e) => tracing::error!(topic = %topic, error = %e, "Subscribe failed"),
            }
        }
    }

    fn unsubscribe_all(&self) {
        for topic in self.router.topics() {
            if let Err(e) = self.client.try_unsubscribe(topic) {
                tracing::warn!(topic = %topic, error = %e, "Unsubscribe failed");
            }
        }
    }

    /// Drive the connection until `drained` fires
    ///
    /// `shutdown` stops routing immediately; publishes of running sessions
    /// keep flowing until `drained`.
    pub async fn run(mut self, shutdown: CancellationToken, drained: CancellationToken) {
        let mut accepting = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled(), if accepting => {
                    accepting = false;
                    tracing::info!("Shutdown requested, no longer accepting alerts");
                    self.unsubscribe_all();
                }
                _ = drained.cancelled() => {
                    break;
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        tracing::info!(code = ?ack.code, "Connected to MQTT broker");
                        if accepting {
                            self.subscribe_all();
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if accepting {
                            let outcome = self.router.route(&publish.topic, &publish.payload);
                            tracing::debug!(topic = %publish.topic, outcome = ?outcome, "Message routed");
                        } else {
                            tracing::debug!(topic = %publish.topic, "Message ignored during shutdown");
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        tracing::debug!(pkid = ack.pkid, "Subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            retry_in_secs = RECONNECT_BACKOFF.as_secs(),
                            "MQTT connection error"
                        );
                        tokio::select! {
                            _ = drained.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        }
                    }
                }
            }
        }

        self.disconnect().await;
    }

    async fn disconnect(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
            tracing::warn!("MQTT disconnect not flushed in time");
        }
        tracing::info!("MQTT subscriber stopped");
    }
}
