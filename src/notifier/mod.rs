//! Notifier - Chat notifications for wildfire alerts
//!
//! ## Responsibilities
//!
//! - Dispatch messages to every enabled channel on tracked background tasks
//! - Own the "already notified" set so each alert is announced once
//!   (bounded, oldest entries evicted)
//! - Format alert / verdict texts
//!
//! Channels implement [`NotifyChannel`]; [`TelegramChannel`] is the only
//! one shipped.

mod telegram;

pub use telegram::TelegramChannel;

use crate::ai_client::DetectionResult;
use crate::error::Result;
use crate::models::{Alert, VerificationSummary};
use crate::state::NotifyConfig;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Payload keys left out of the sensor listing
const HIDDEN_SENSOR_KEYS: [&str; 3] = ["timestamp", "potential_wildfire", "wildfire_detected"];

/// Alert keys remembered for dedup
const ANNOUNCED_CAPACITY: usize = 256;

/// Notification channel seam
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn send_photo(&self, photo: Vec<u8>, caption: &str) -> Result<()>;
}

/// One outgoing message
#[derive(Debug, Clone)]
pub enum Message {
    Text(String),
    Photo { image: Vec<u8>, caption: String },
}

/// Notification dispatcher
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
    /// Alert keys whose initial message went out
    announced: Mutex<Announced>,
    tasks: TaskTracker,
}

/// Insertion-ordered set with a fixed capacity
#[derive(Default)]
struct Announced {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl Announced {
    /// `false` when `key` is already present
    fn insert(&mut self, key: String, capacity: usize) -> bool {
        if !self.keys.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Identity of an alert across redeliveries: kind plus sender timestamp
///
/// Falls back to `fallback` (the session id) when the payload has no timestamp.
pub fn alert_key(alert: &Alert, fallback: &str) -> String {
    match alert.timestamp() {
        Some(ts) => format!("{}:{}", alert.kind().as_str(), ts),
        None => fallback.to_string(),
    }
}

impl Notifier {
    /// Build from config; Telegram is enabled when token and chat id are set
    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        if config.disabled {
            tracing::info!("Notifications disabled via NOTIFY_DISABLED");
            return Ok(Self::disabled());
        }

        let mut channels: Vec<Arc<dyn NotifyChannel>> = Vec::new();
        if let (Some(token), Some(chat_id)) = (&config.telegram_token, &config.telegram_chat_id) {
            channels.push(Arc::new(TelegramChannel::new(token, chat_id)?));
            tracing::info!("Telegram notifications enabled");
        }

        if channels.is_empty() {
            tracing::warn!("No notification channels configured");
        }

        Ok(Self::with_channels(channels))
    }

    /// Notifier with specific channels
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
            announced: Mutex::new(Announced::default()),
            tasks: TaskTracker::new(),
        }
    }

    /// Notifier that drops everything
    pub fn disabled() -> Self {
        Self {
            channels: Vec::new(),
            disabled: true,
            announced: Mutex::new(Announced::default()),
            tasks: TaskTracker::new(),
        }
    }

    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// In-flight sends; close and wait on it before exiting
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Announce an alert once, however many sessions it starts
    ///
    /// Returns `None` when nothing was dispatched (duplicate, or no channel).
    pub fn alert_started(&self, session_id: &str, alert: &Alert) -> Option<JoinHandle<()>> {
        let key = alert_key(alert, session_id);
        let first = self.announced().insert(key.clone(), ANNOUNCED_CAPACITY);
        if !first {
            tracing::debug!(session_id = %session_id, alert_key = %key, "Alert already announced");
            return None;
        }

        self.dispatch(Message::Text(format_alert_message(alert)))
    }

    /// Forward an annotated hazard frame
    pub fn hazard_image(
        &self,
        session_id: &str,
        image_index: u32,
        detection: &DetectionResult,
    ) -> Option<JoinHandle<()>> {
        let image = detection.annotated_image.clone()?;
        let labels = detection
            .label_counts
            .iter()
            .map(|(label, n)| format!("{} x{}", label, n))
            .collect::<Vec<_>>()
            .join(", ");
        let caption = format!(
            "Detection {} #{}: {}",
            session_id, image_index, labels
        );
        self.dispatch(Message::Photo { image, caption })
    }

    /// Final verdict of a verification session
    pub fn verdict(
        &self,
        session_id: &str,
        verdict: bool,
        summary: &VerificationSummary,
    ) -> Option<JoinHandle<()>> {
        self.dispatch(Message::Text(format_verdict_message(session_id, verdict, summary)))
    }

    fn announced(&self) -> std::sync::MutexGuard<'_, Announced> {
        match self.announced.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Send `message` to every channel on a tracked background task
    pub fn dispatch(&self, message: Message) -> Option<JoinHandle<()>> {
        if !self.has_channels() {
            tracing::debug!("No notification channel, message dropped");
            return None;
        }

        let channels = self.channels.clone();
        Some(self.tasks.spawn(async move {
            for channel in channels {
                let result = match &message {
                    Message::Text(text) => channel.send_text(text).await,
                    Message::Photo { image, caption } => {
                        channel.send_photo(image.clone(), caption).await
                    }
                };
                match result {
                    Ok(()) => tracing::debug!(channel = channel.name(), "Notification sent"),
                    Err(e) => tracing::error!(
                        channel = channel.name(),
                        error = %e,
                        "Failed to send notification"
                    ),
                }
            }
        }))
    }
}

/// Initial alert text with formatted sensor data
pub fn format_alert_message(alert: &Alert) -> String {
    let mut text = String::from("🔥 WILDFIRE ALERT 🔥\n");
    if let Some(ts) = alert.timestamp() {
        let _ = writeln!(text, "Time: {}", ts);
    }
    text.push_str("\nSensor data:\n");
    for (key, value) in alert.readings() {
        if HIDDEN_SENSOR_KEYS.contains(&key.as_str()) {
            continue;
        }
        let _ = writeln!(text, "- {}: {:.2}", key, value);
    }
    text.push_str("\nCapturing verification images...");
    text
}

pub fn format_verdict_message(session_id: &str, verdict: bool, summary: &VerificationSummary) -> String {
    let headline = if verdict {
        "🔥 WILDFIRE CONFIRMED"
    } else {
        "✅ Wildfire not confirmed"
    };
    let ratio = summary
        .detection_ratio
        .map(|r| format!("{:.0}%", r * 100.0))
        .unwrap_or_else(|| "n/a (sensor flag kept)".to_string());

    format!(
        "{}\nSession: {}\nImages analyzed: {}\nImages with fire/smoke: {}\nDetection ratio: {}",
        headline, session_id, summary.verification_images, summary.fire_detected_images, ratio
    )
}
