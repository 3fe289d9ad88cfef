//! AlertRouter - Inbound message dispatch
//!
//! ## Responsibilities
//!
//! - Map topic to alert kind and parse the payload
//! - Hazard sensor reading: register + spawn a verification session
//! - Calm sensor reading: publish `wildfire_detected=false` directly
//! - Legacy alert: spawn a best-effort capture loop
//! - Drop malformed input with a log line
//!
//! `route` never waits on a session; it returns as soon as work is handed
//! off.

use crate::models::{Alert, AlertKind, VerifiedStatus};
use crate::session_registry::SessionRegistry;
use crate::session_store::SessionStore;
use crate::verification_session::{SessionContext, SessionMode, VerificationSession};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::task::TaskTracker;

/// What `route` did with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Hazard reading, verification session spawned under its final id
    VerificationStarted { session_id: String },
    /// Legacy alert, capture loop spawned
    LegacyCaptureStarted { session_id: String },
    /// Calm reading forwarded without capture
    Passthrough,
    /// Legacy alert without hazard flag
    Ignored,
    /// Unknown topic or malformed payload
    Dropped,
}

/// Alert Router
pub struct AlertRouter {
    sensor_topic: String,
    legacy_alert_topic: String,
    registry: Arc<SessionRegistry>,
    sessions: Arc<SessionContext>,
    tasks: TaskTracker,
}

impl AlertRouter {
    /// Create new AlertRouter
    pub fn new(
        sensor_topic: impl Into<String>,
        legacy_alert_topic: impl Into<String>,
        registry: Arc<SessionRegistry>,
        sessions: Arc<SessionContext>,
    ) -> Self {
        Self {
            sensor_topic: sensor_topic.into(),
            legacy_alert_topic: legacy_alert_topic.into(),
            registry,
            sessions,
            tasks: TaskTracker::new(),
        }
    }

    /// Topics to subscribe to
    pub fn topics(&self) -> [&str; 2] {
        [self.sensor_topic.as_str(), self.legacy_alert_topic.as_str()]
    }

    /// Every task spawned by the router (sessions and passthroughs)
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    fn kind_for(&self, topic: &str) -> Option<AlertKind> {
        if topic == self.sensor_topic {
            Some(AlertKind::SensorReading)
        } else if topic == self.legacy_alert_topic {
            Some(AlertKind::LegacyAlert)
        } else {
            None
        }
    }

    /// Route one broker message
    pub fn route(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let Some(kind) = self.kind_for(topic) else {
            tracing::warn!(topic = %topic, "Message on unexpected topic dropped");
            return RouteOutcome::Dropped;
        };

        let alert = match Alert::parse(kind, payload) {
            Ok(alert) => alert,
            Err(e) => {
                tracing::warn!(
                    topic = %topic,
                    kind = kind.as_str(),
                    error = %e,
                    "Malformed alert dropped"
                );
                return RouteOutcome::Dropped;
            }
        };

        match (kind, alert.hazard_flag()) {
            (AlertKind::SensorReading, true) => {
                let session_id = self.spawn_session(SessionMode::Verification, alert);
                RouteOutcome::VerificationStarted { session_id }
            }
            (AlertKind::SensorReading, false) => {
                self.spawn_passthrough(alert);
                RouteOutcome::Passthrough
            }
            (AlertKind::LegacyAlert, true) => {
                let session_id = self.spawn_session(SessionMode::LegacyCapture, alert);
                RouteOutcome::LegacyCaptureStarted { session_id }
            }
            (AlertKind::LegacyAlert, false) => {
                tracing::debug!(topic = %topic, "Legacy alert without hazard ignored");
                RouteOutcome::Ignored
            }
        }
    }

    fn spawn_session(&self, mode: SessionMode, alert: Alert) -> String {
        let guard = self
            .registry
            .register(SessionStore::session_id_for(Utc::now()));
        let session_id = guard.session_id().to_string();

        tracing::info!(
            session_id = %session_id,
            mode = ?mode,
            active_sessions = self.registry.active_count(),
            readings = ?alert.readings(),
            "Potential wildfire, starting session"
        );

        let session = VerificationSession::new(mode, alert, Some(guard), Arc::clone(&self.sessions));
        self.tasks.spawn(async move {
            session.run().await;
        });
        session_id
    }

    fn spawn_passthrough(&self, alert: Alert) {
        let publisher = Arc::clone(&self.sessions.publisher);
        let status = VerifiedStatus::passthrough(&alert);
        tracing::debug!(readings = ?alert.readings(), "No hazard flag, forwarding status");

        self.tasks.spawn(async move {
            // Logged by the publisher
            let _ = publisher.publish(&status).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_client::{DetectionResult, Detector};
    use crate::error::{Error, Result};
    use crate::notifier::Notifier;
    use crate::snapshot_service::{Camera, FrameSize};
    use crate::state::SessionPolicy;
    use crate::status_publisher::{BrokerPublisher, StatusPublisher};
    use crate::verdict_log::VerdictLog;
    use crate::verification_session::SessionBounds;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct CountingCamera(AtomicU32);

    #[async_trait]
    impl Camera for CountingCamera {
        async fn capture(&self, _: Option<FrameSize>, _: &CancellationToken) -> Result<Vec<u8>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::Camera("offline".into()))
        }
    }

    struct IdleDetector;

    #[async_trait]
    impl Detector for IdleDetector {
        async fn ensure_ready(&self, _: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn classify(&self, _: Vec<u8>, _: &CancellationToken) -> Result<DetectionResult> {
            Ok(DetectionResult::default())
        }
    }

    #[derive(Default)]
    struct RecordingBroker(Mutex<Vec<serde_json::Value>>);

    #[async_trait]
    impl BrokerPublisher for RecordingBroker {
        async fn publish(&self, _: &str, payload: Vec<u8>) -> Result<()> {
            self.0.lock().unwrap().push(serde_json::from_slice(&payload).unwrap());
            Ok(())
        }
    }

    struct Fixture {
        router: AlertRouter,
        registry: Arc<SessionRegistry>,
        camera: Arc<CountingCamera>,
        broker: Arc<RecordingBroker>,
        verdicts: Arc<VerdictLog>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let camera = Arc::new(CountingCamera(AtomicU32::new(0)));
        let broker = Arc::new(RecordingBroker::default());
        let verdicts = Arc::new(VerdictLog::new(10));
        let ctx = Arc::new(SessionContext {
            camera: camera.clone(),
            detector: Arc::new(IdleDetector),
            store: Arc::new(SessionStore::new(dir.path())),
            publisher: Arc::new(StatusPublisher::new(broker.clone(), "status")),
            notifier: Arc::new(Notifier::disabled()),
            verdicts: verdicts.clone(),
            policy: SessionPolicy {
                window: Duration::from_secs(10),
                capture_interval: Duration::from_secs(5),
                hazard_ratio_threshold: 0.2,
                legacy_window: Duration::from_secs(10),
            },
            bounds: SessionBounds {
                capture: Duration::from_secs(1),
                classify: Duration::from_secs(1),
                ready: Duration::from_secs(1),
            },
            frame_size: None,
            abort: CancellationToken::new(),
        });
        let router = AlertRouter::new("sensors", "alerts", registry.clone(), ctx);
        Fixture {
            router,
            registry,
            camera,
            broker,
            verdicts,
            _dir: dir,
        }
    }

    async fn drain(router: &AlertRouter) {
        router.tasks().close();
        router.tasks().wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_calm_reading_is_forwarded_without_session() {
        let f = fixture();

        let outcome = f
            .router
            .route("sensors", br#"{"temperature": 20.5, "potential_wildfire": false}"#);
        assert_eq!(outcome, RouteOutcome::Passthrough);
        assert_eq!(f.registry.active_count(), 0);

        drain(&f.router).await;
        let sent = f.broker.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["wildfire_detected"], false);
        assert_eq!(f.registry.total_started(), 0);
        assert_eq!(f.camera.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hazard_reading_registers_before_returning() {
        let f = fixture();

        let outcome = f.router.route("sensors", br#"{"potential_wildfire": true}"#);
        assert!(matches!(outcome, RouteOutcome::VerificationStarted { .. }));
        assert_eq!(f.registry.active_count(), 1);

        drain(&f.router).await;
        assert_eq!(f.registry.active_count(), 0);
        assert_eq!(f.camera.0.load(Ordering::SeqCst), 2);

        let sent = f.broker.0.lock().unwrap();
        assert_eq!(sent[0]["wildfire_detected"], true);
        assert_eq!(sent[0]["verification_images"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returned_id_is_the_reported_id() {
        let f = fixture();

        let mut started = Vec::new();
        for _ in 0..3 {
            match f.router.route("sensors", br#"{"potential_wildfire": true}"#) {
                RouteOutcome::VerificationStarted { session_id } => started.push(session_id),
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        drain(&f.router).await;
        let mut reported: Vec<String> = f
            .verdicts
            .latest(10)
            .await
            .into_iter()
            .map(|r| r.session_id)
            .collect();
        reported.sort();
        started.sort();
        started.dedup();
        assert_eq!(started.len(), 3);
        assert_eq!(reported, started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_alerts() {
        let f = fixture();

        assert_eq!(
            f.router.route("alerts", br#"{"wildfire_detected": false}"#),
            RouteOutcome::Ignored
        );
        let outcome = f.router.route("alerts", br#"{"wildfire_detected": true}"#);
        assert!(matches!(outcome, RouteOutcome::LegacyCaptureStarted { .. }));

        drain(&f.router).await;
        assert!(f.broker.0.lock().unwrap().is_empty());
        assert_eq!(f.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_are_dropped() {
        let f = fixture();

        assert_eq!(f.router.route("sensors", b"{oops"), RouteOutcome::Dropped);
        assert_eq!(f.router.route("sensors", b"42"), RouteOutcome::Dropped);
        assert_eq!(
            f.router.route("other/topic", br#"{"potential_wildfire": true}"#),
            RouteOutcome::Dropped
        );
        assert_eq!(f.registry.total_started(), 0);
        assert!(f.router.tasks().is_empty());
    }
}
