//! VerificationSession - Timed capture / classify / aggregate cycle
//!
//! ## Responsibilities
//!
//! - Run one session per hazard alert: `STARTING → CAPTURING →
//!   AGGREGATING → PUBLISHING → DONE`
//! - Contain every per-iteration failure (capture, classify, store)
//! - Decide the verdict from the detection ratio, or fall back to the
//!   sensor flag when nothing was classified
//! - Run the legacy (non-verifying) capture loop with the same mechanics
//!
//! ## Invariants
//!
//! - `images_with_hazard <= images_captured` at every observation
//! - state only moves forward
//! - the registry guard is released exactly once, on entering `DONE`
//! - the session id is fixed at construction

use crate::ai_client::{DetectionResult, Detector};
use crate::call_guard::run_bounded;
use crate::models::{Alert, VerificationSummary, VerifiedStatus};
use crate::notifier::Notifier;
use crate::session_registry::SessionGuard;
use crate::session_store::{CaptureRecord, SessionFolder, SessionStore};
use crate::snapshot_service::{Camera, FrameSize};
use crate::state::{AppConfig, SessionPolicy, MAX_WINDOW};
use crate::status_publisher::StatusPublisher;
use crate::verdict_log::{SessionReport, VerdictLog};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Session lifecycle states (ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Starting,
    Capturing,
    Aggregating,
    Publishing,
    Done,
}

impl SessionState {
    /// Transitions are strictly forward; states may be skipped
    pub fn can_advance_to(self, next: SessionState) -> bool {
        next > self
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Done
    }
}

/// Verifying run or legacy best-effort capture loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Verification,
    LegacyCapture,
}

impl SessionMode {
    /// Whether the run aggregates and publishes a verdict
    pub fn aggregates(self) -> bool {
        matches!(self, SessionMode::Verification)
    }
}

/// Per-session image counters (single writer: the session)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    images_captured: u32,
    images_with_hazard: u32,
}

impl SessionCounters {
    /// Count one classified image
    pub fn record(&mut self, hazard: bool) {
        self.images_captured += 1;
        if hazard {
            self.images_with_hazard += 1;
        }
    }

    pub fn images_captured(&self) -> u32 {
        self.images_captured
    }

    pub fn images_with_hazard(&self) -> u32 {
        self.images_with_hazard
    }

    /// `None` when no image was classified
    pub fn detection_ratio(&self) -> Option<f64> {
        if self.images_captured == 0 {
            None
        } else {
            Some(self.images_with_hazard as f64 / self.images_captured as f64)
        }
    }

    pub fn summary(&self) -> VerificationSummary {
        VerificationSummary {
            verification_images: self.images_captured,
            fire_detected_images: self.images_with_hazard,
            detection_ratio: self.detection_ratio(),
        }
    }
}

/// `ratio >= threshold` with images, the sensor's own flag without
pub fn aggregate_verdict(counters: &SessionCounters, sensor_flag: bool, threshold: f64) -> bool {
    match counters.detection_ratio() {
        Some(ratio) => ratio >= threshold,
        None => sensor_flag,
    }
}

/// Hard bounds applied to every adapter call a session makes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBounds {
    /// One capture including its retries and resolution change
    pub capture: Duration,
    /// One classification including a lazy model load
    pub classify: Duration,
    /// Model readiness at session start
    pub ready: Duration,
}

impl SessionBounds {
    pub fn from_config(config: &AppConfig) -> Self {
        let camera = &config.camera;
        let per_call = |attempts: u32, backoff: Duration| {
            camera
                .request_timeout
                .saturating_add(backoff)
                .saturating_mul(attempts)
        };
        Self {
            capture: per_call(camera.capture_retry.attempts, camera.capture_retry.backoff)
                .saturating_add(per_call(
                    camera.resolution_retry.attempts,
                    camera.resolution_retry.backoff,
                )),
            classify: config
                .detection
                .load_timeout
                .saturating_add(config.detection.infer_timeout),
            ready: config.detection.load_timeout,
        }
    }
}

/// Collaborators shared by all sessions
pub struct SessionContext {
    pub camera: Arc<dyn Camera>,
    pub detector: Arc<dyn Detector>,
    pub store: Arc<SessionStore>,
    pub publisher: Arc<StatusPublisher>,
    pub notifier: Arc<Notifier>,
    pub verdicts: Arc<VerdictLog>,
    pub policy: SessionPolicy,
    pub bounds: SessionBounds,
    pub frame_size: Option<FrameSize>,
    /// Forced shutdown: end capture early, still aggregate and publish
    pub abort: CancellationToken,
}

/// One verification (or legacy capture) run
pub struct VerificationSession {
    session_id: String,
    mode: SessionMode,
    alert: Alert,
    started_at: DateTime<Utc>,
    deadline: Instant,
    state: SessionState,
    counters: SessionCounters,
    frames_captured: u32,
    folder: Option<SessionFolder>,
    guard: Option<SessionGuard>,
    ctx: Arc<SessionContext>,
}

impl VerificationSession {
    /// Create new session; the deadline starts counting now
    ///
    /// The id comes from the registry guard, or the start time without one.
    pub fn new(
        mode: SessionMode,
        alert: Alert,
        guard: Option<SessionGuard>,
        ctx: Arc<SessionContext>,
    ) -> Self {
        let started_at = Utc::now();
        let window = match mode {
            SessionMode::Verification => ctx.policy.window,
            SessionMode::LegacyCapture => ctx.policy.legacy_window,
        };
        let session_id = guard
            .as_ref()
            .map(|g| g.session_id().to_string())
            .unwrap_or_else(|| SessionStore::session_id_for(started_at));

        let now = Instant::now();
        Self {
            session_id,
            mode,
            alert,
            started_at,
            deadline: now.checked_add(window).unwrap_or(now + MAX_WINDOW),
            state: SessionState::Starting,
            counters: SessionCounters::default(),
            frames_captured: 0,
            folder: None,
            guard,
            ctx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_advance_to(next) {
            tracing::error!(
                session_id = %self.session_id,
                from = ?self.state,
                to = ?next,
                "Rejected backward session transition"
            );
            return;
        }
        tracing::debug!(session_id = %self.session_id, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }

    /// Drive the session to `DONE` and return its report
    pub async fn run(mut self) -> SessionReport {
        tracing::info!(
            session_id = %self.session_id,
            mode = ?self.mode,
            sensor_flag = self.alert.hazard_flag(),
            "Session started"
        );

        // STARTING
        self.allocate_folder().await;
        self.ctx.notifier.alert_started(&self.session_id, &self.alert);
        let detector_ready = self.ready_detector().await;

        // Legacy runs capture even without an engine
        if detector_ready || !self.mode.aggregates() {
            self.transition(SessionState::Capturing);
            self.capture_loop(detector_ready).await;
        }

        let mut verdict = None;
        let mut published = false;

        if self.mode.aggregates() {
            self.transition(SessionState::Aggregating);
            let decided = self.aggregate();
            verdict = Some(decided);

            self.transition(SessionState::Publishing);
            published = self.publish(decided).await;
        }

        self.transition(SessionState::Done);
        // DONE: deregister
        self.guard.take();

        let report = SessionReport {
            session_id: self.session_id.clone(),
            mode: self.mode,
            started_at: self.started_at,
            finished_at: Utc::now(),
            images_captured: self.counters.images_captured(),
            images_with_hazard: self.counters.images_with_hazard(),
            detection_ratio: self.counters.detection_ratio(),
            original_flag: self.alert.hazard_flag(),
            verdict,
            published,
        };
        self.ctx.verdicts.record(report.clone()).await;

        tracing::info!(
            session_id = %self.session_id,
            images_captured = report.images_captured,
            images_with_hazard = report.images_with_hazard,
            frames_captured = self.frames_captured,
            "Session finished"
        );
        report
    }

    async fn allocate_folder(&mut self) {
        match self.ctx.store.allocate(&self.session_id).await {
            Ok(folder) => self.folder = Some(folder),
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "Session folder unavailable, images will not be stored"
                );
            }
        }
    }

    async fn ready_detector(&self) -> bool {
        let ctx = &self.ctx;
        match run_bounded(
            "model readiness",
            ctx.bounds.ready,
            &ctx.abort,
            ctx.detector.ensure_ready(&ctx.abort),
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                if self.mode.aggregates() {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "Detection model unavailable, falling back to sensor flag"
                    );
                } else {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "Detection model unavailable, capturing without annotation"
                    );
                }
                false
            }
        }
    }

    /// Tick until the deadline (or abort); sleep `min(interval, remaining)`
    async fn capture_loop(&mut self, detector_ready: bool) {
        let abort = self.ctx.abort.clone();
        let interval = self.ctx.policy.capture_interval;

        loop {
            if abort.is_cancelled() || Instant::now() >= self.deadline {
                break;
            }

            self.tick(detector_ready).await;

            let now = Instant::now();
            if now >= self.deadline {
                break;
            }
            let nap = interval.min(self.deadline - now);
            tokio::select! {
                _ = abort.cancelled() => {
                    tracing::warn!(session_id = %self.session_id, "Capture window cut short by shutdown");
                    break;
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// One capture → classify → store → count step
    async fn tick(&mut self, detector_ready: bool) {
        let ctx = Arc::clone(&self.ctx);

        let image = match run_bounded(
            "camera capture",
            ctx.bounds.capture,
            &ctx.abort,
            ctx.camera.capture(ctx.frame_size, &ctx.abort),
        )
        .await
        {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "Capture failed, skipping iteration"
                );
                return;
            }
        };
        let captured_at = Utc::now();
        self.frames_captured += 1;
        let image_index = self.frames_captured;

        let detection = if detector_ready {
            self.classify(image.clone()).await
        } else {
            None
        };

        if let Some(folder) = &self.folder {
            let record = CaptureRecord {
                image_index,
                captured_at,
                alert: &self.alert,
                image: &image,
                detection: detection.as_ref(),
            };
            if let Err(e) = folder.save_capture(&record).await {
                tracing::warn!(
                    session_id = %self.session_id,
                    image_index = image_index,
                    error = %e,
                    "Failed to store capture"
                );
            }
        }

        if let Some(result) = detection {
            self.counters.record(result.hazard_detected);
            if result.hazard_detected {
                tracing::info!(
                    session_id = %self.session_id,
                    image_index = image_index,
                    labels = ?result.label_counts,
                    "Hazard detected in frame"
                );
                ctx.notifier.hazard_image(&self.session_id, image_index, &result);
            }
        }
    }

    async fn classify(&self, image: Vec<u8>) -> Option<DetectionResult> {
        let ctx = &self.ctx;
        match run_bounded(
            "classification",
            ctx.bounds.classify,
            &ctx.abort,
            ctx.detector.classify(image, &ctx.abort),
        )
        .await
        {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "Classification failed, image not counted"
                );
                None
            }
        }
    }

    fn aggregate(&self) -> bool {
        let threshold = self.ctx.policy.hazard_ratio_threshold;
        let verdict = aggregate_verdict(&self.counters, self.alert.hazard_flag(), threshold);
        let fallback = self.counters.images_captured() == 0;
        let ratio = self.counters.detection_ratio().unwrap_or(0.0);

        if verdict {
            tracing::warn!(
                target: "fireshield::hazard",
                session_id = %self.session_id,
                images_captured = self.counters.images_captured(),
                images_with_hazard = self.counters.images_with_hazard(),
                detection_ratio = ratio,
                fallback = fallback,
                "WILDFIRE CONFIRMED"
            );
        } else {
            tracing::info!(
                session_id = %self.session_id,
                images_captured = self.counters.images_captured(),
                images_with_hazard = self.counters.images_with_hazard(),
                detection_ratio = ratio,
                fallback = fallback,
                "Wildfire not confirmed"
            );
        }
        verdict
    }

    async fn publish(&self, verdict: bool) -> bool {
        let summary = self.counters.summary();
        let status = VerifiedStatus::verified(&self.alert, verdict, summary.clone());
        self.ctx.notifier.verdict(&self.session_id, verdict, &summary);

        // Failure already logged by the publisher; never retried later
        self.ctx.publisher.publish(&status).await.is_ok()
    }
}
