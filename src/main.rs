//! FireShield Relay - Wildfire alert verification
//!
//! Main entry point: wires broker, camera, detection engine and status API,
//! then runs until a shutdown signal drains all sessions.

use anyhow::Context;
use fireshield_relay::{
    ai_client::AiClient,
    alert_router::AlertRouter,
    mqtt_subscriber::{self, MqttSubscriber},
    notifier::Notifier,
    session_registry::SessionRegistry,
    session_store::SessionStore,
    snapshot_service::SnapshotService,
    state::{AppConfig, AppState},
    status_publisher::{MqttBroker, StatusPublisher},
    verdict_log::VerdictLog,
    verification_session::{SessionBounds, SessionContext},
    web_api,
};
use std::future::IntoFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fireshield_relay=debug,fireshield=warn,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting FireShield Relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Arc::new(AppConfig::from_env().context("invalid configuration")?);
    tracing::info!(
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        sensor_topic = %config.mqtt.sensor_topic,
        legacy_alert_topic = %config.mqtt.legacy_alert_topic,
        status_topic = %config.mqtt.status_topic,
        camera_url = %config.camera.base_url,
        detection_url = %config.detection.base_url,
        image_dir = %config.image_dir.display(),
        window_secs = config.session.window.as_secs(),
        interval_secs = config.session.capture_interval.as_secs(),
        hazard_ratio_threshold = config.session.hazard_ratio_threshold,
        "Configuration loaded"
    );

    // Shutdown tokens: first signal stops intake, second ends capture windows
    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();
    let drained = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone(), abort.clone());

    // Initialize components
    let camera = Arc::new(SnapshotService::new(&config.camera)?);
    let detector = Arc::new(AiClient::new(&config.detection)?);
    if detector.health_check(&shutdown).await.unwrap_or(false) {
        tracing::info!(url = %detector.base_url(), "Detection engine reachable");
    } else {
        tracing::warn!(
            url = %detector.base_url(),
            "Detection engine not reachable yet, sessions will fall back to sensor flag"
        );
    }

    let (client, eventloop) = mqtt_subscriber::connect(&config.mqtt);
    let publisher = Arc::new(StatusPublisher::new(
        Arc::new(MqttBroker::new(client.clone())),
        config.mqtt.status_topic.clone(),
    ));
    let notifier = Arc::new(Notifier::from_config(&config.notify)?);
    let registry = SessionRegistry::new();
    let verdicts = Arc::new(VerdictLog::new(config.verdict_log_capacity));

    let sessions = Arc::new(SessionContext {
        camera,
        detector,
        store: Arc::new(SessionStore::new(config.image_dir.clone())),
        publisher,
        notifier: notifier.clone(),
        verdicts: verdicts.clone(),
        policy: config.session.clone(),
        bounds: SessionBounds::from_config(&config),
        frame_size: config.camera.frame_size,
        abort,
    });

    let router = Arc::new(AlertRouter::new(
        config.mqtt.sensor_topic.clone(),
        config.mqtt.legacy_alert_topic.clone(),
        registry.clone(),
        sessions,
    ));

    // Broker subscription
    let subscriber = MqttSubscriber::new(client, eventloop, router.clone());
    let subscriber_handle = tokio::spawn(subscriber.run(shutdown.clone(), drained.clone()));

    // Status API
    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        verdicts,
        started_at: chrono::Utc::now(),
    };
    let app = web_api::create_router(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let server_handle = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(drained.clone().cancelled_owned())
            .into_future(),
    );

    // Run until the first signal
    shutdown.cancelled().await;
    tracing::info!(
        active_sessions = registry.active_count(),
        "Shutdown requested, waiting for verification sessions"
    );

    registry.wait_idle(config.shutdown_heartbeat).await;
    router.tasks().close();
    router.tasks().wait().await;
    // Verdict messages of the last sessions
    notifier.tasks().close();
    notifier.tasks().wait().await;
    drained.cancel();

    subscriber_handle.await.context("subscriber task panicked")?;
    server_handle.await.context("server task panicked")??;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// First Ctrl-C / SIGTERM cancels `shutdown`, the second cancels `abort`
fn spawn_signal_watcher(shutdown: CancellationToken, abort: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();

        wait_for_signal().await;
        tracing::warn!("Second signal, ending capture windows early");
        abort.cancel();
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
