//! Application state
//!
//! Env-driven configuration and the components shared with the status API

use crate::call_guard::RetryPolicy;
use crate::error::{Error, Result};
use crate::session_registry::SessionRegistry;
use crate::snapshot_service::FrameSize;
use crate::verdict_log::VerdictLog;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Longest capture window accepted
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Most attempts a camera retry policy may make
pub const MAX_ATTEMPTS: u32 = 10;
/// Longest single adapter timeout or backoff accepted
pub const MAX_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Broker connection and topics
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    /// Client id = prefix + random suffix, avoids broker-side takeover
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    /// Sensor readings carrying `potential_wildfire`
    pub sensor_topic: String,
    /// Older senders publishing `wildfire_detected`
    pub legacy_alert_topic: String,
    /// Outbound verified status
    pub status_topic: String,
}

/// Camera HTTP endpoint
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub base_url: String,
    pub frame_size: Option<FrameSize>,
    /// Bound on a single HTTP request
    pub request_timeout: Duration,
    pub capture_retry: RetryPolicy,
    pub resolution_retry: RetryPolicy,
}

/// Detection engine endpoint and policy
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub base_url: String,
    pub model: String,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub load_timeout: Duration,
    pub infer_timeout: Duration,
    /// Lower-cased labels that count as hazard
    pub hazard_classes: Vec<String>,
}

/// Timing and verdict policy of a capture session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    /// Verification window (deadline = start + window)
    pub window: Duration,
    pub capture_interval: Duration,
    /// Verdict is hazard when ratio >= threshold
    pub hazard_ratio_threshold: f64,
    /// Duration of the non-verifying legacy capture loop
    pub legacy_window: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            capture_interval: Duration::from_secs(5),
            hazard_ratio_threshold: 0.2,
            legacy_window: Duration::from_secs(60),
        }
    }
}

/// Chat notification settings
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub disabled: bool,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub session: SessionPolicy,
    pub notify: NotifyConfig,
    /// Root folder for per-session artifacts
    pub image_dir: PathBuf,
    /// Status API host
    pub host: String,
    /// Status API port
    pub port: u16,
    /// Heartbeat period while draining sessions at shutdown
    pub shutdown_heartbeat: Duration,
    pub verdict_log_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig {
                host: "localhost".to_string(),
                port: 8883,
                username: None,
                password: None,
                use_tls: true,
                client_id_prefix: "fireshield-relay".to_string(),
                keep_alive: Duration::from_secs(60),
                sensor_topic: "esp32_01/sensors/data".to_string(),
                legacy_alert_topic: "esp32_01/wildfire/alert".to_string(),
                status_topic: "esp32_01/wildfire/status".to_string(),
            },
            camera: CameraConfig {
                base_url: "http://192.168.8.194".to_string(),
                frame_size: Some(FrameSize::Vga),
                request_timeout: Duration::from_secs(10),
                capture_retry: RetryPolicy::new(3, Duration::from_millis(1000)),
                resolution_retry: RetryPolicy::new(3, Duration::from_millis(300)),
            },
            detection: DetectionConfig {
                base_url: "http://localhost:9000".to_string(),
                model: "yolov8l.pt".to_string(),
                conf_threshold: 0.25,
                iou_threshold: 0.45,
                load_timeout: Duration::from_secs(30),
                infer_timeout: Duration::from_secs(15),
                hazard_classes: vec!["fire".to_string(), "smoke".to_string()],
            },
            session: SessionPolicy::default(),
            notify: NotifyConfig::default(),
            image_dir: PathBuf::from("./wildfire_images"),
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_heartbeat: Duration::from_secs(10),
            verdict_log_capacity: 200,
        }
    }
}

impl AppConfig {
    /// Load from process environment (after `.env`)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let d = Self::default();

        let frame_size = match env.get("CAMERA_FRAME_SIZE") {
            None => d.camera.frame_size,
            Some(v) if v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("keep") => None,
            Some(v) => Some(v.parse::<FrameSize>()?),
        };

        let hazard_classes = env
            .get("HAZARD_CLASSES")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(d.detection.hazard_classes);

        let config = Self {
            mqtt: MqttConfig {
                host: env.string("MQTT_BROKER_HOST", d.mqtt.host),
                port: env.parse("MQTT_BROKER_PORT", d.mqtt.port)?,
                username: env.get("MQTT_USERNAME"),
                password: env.get("MQTT_PASSWORD"),
                use_tls: env.flag("MQTT_USE_TLS", d.mqtt.use_tls),
                client_id_prefix: env.string("MQTT_CLIENT_ID_PREFIX", d.mqtt.client_id_prefix),
                keep_alive: env.secs("MQTT_KEEP_ALIVE_SECS", d.mqtt.keep_alive)?,
                sensor_topic: env.string("MQTT_TOPIC_SENSOR", d.mqtt.sensor_topic),
                legacy_alert_topic: env.string("MQTT_TOPIC_LEGACY_ALERT", d.mqtt.legacy_alert_topic),
                status_topic: env.string("MQTT_TOPIC_STATUS", d.mqtt.status_topic),
            },
            camera: CameraConfig {
                base_url: env.string("CAMERA_URL", d.camera.base_url),
                frame_size,
                request_timeout: env.secs("CAMERA_TIMEOUT_SECS", d.camera.request_timeout)?,
                capture_retry: RetryPolicy::new(
                    env.parse("CAMERA_RETRIES", d.camera.capture_retry.attempts)?,
                    env.millis("CAMERA_RETRY_BACKOFF_MS", d.camera.capture_retry.backoff)?,
                ),
                resolution_retry: d.camera.resolution_retry,
            },
            detection: DetectionConfig {
                base_url: env.string("DETECTION_URL", d.detection.base_url),
                model: env.string("DETECTION_MODEL", d.detection.model),
                conf_threshold: env.parse("DETECTION_CONF_THRESHOLD", d.detection.conf_threshold)?,
                iou_threshold: env.parse("DETECTION_IOU_THRESHOLD", d.detection.iou_threshold)?,
                load_timeout: env.secs("DETECTION_LOAD_TIMEOUT_SECS", d.detection.load_timeout)?,
                infer_timeout: env.secs("DETECTION_INFER_TIMEOUT_SECS", d.detection.infer_timeout)?,
                hazard_classes,
            },
            session: SessionPolicy {
                window: env.secs("CAPTURE_WINDOW_SECS", d.session.window)?,
                capture_interval: env.secs("CAPTURE_INTERVAL_SECS", d.session.capture_interval)?,
                hazard_ratio_threshold: env
                    .parse("HAZARD_RATIO_THRESHOLD", d.session.hazard_ratio_threshold)?,
                legacy_window: env.secs("LEGACY_CAPTURE_SECS", d.session.legacy_window)?,
            },
            notify: NotifyConfig {
                disabled: env.flag("NOTIFY_DISABLED", false),
                telegram_token: env.get("TELEGRAM_TOKEN"),
                telegram_chat_id: env.get("TELEGRAM_CHAT_ID"),
            },
            image_dir: env.get("IMAGE_DIR").map(PathBuf::from).unwrap_or(d.image_dir),
            host: env.string("HOST", d.host),
            port: env.parse("PORT", d.port)?,
            shutdown_heartbeat: env.secs("SHUTDOWN_HEARTBEAT_SECS", d.shutdown_heartbeat)?,
            verdict_log_capacity: env.parse("VERDICT_LOG_CAPACITY", d.verdict_log_capacity)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::Config(format!("{} must be within [0, 1], got {}", name, v)))
            }
        };
        unit("DETECTION_CONF_THRESHOLD", self.detection.conf_threshold as f64)?;
        unit("DETECTION_IOU_THRESHOLD", self.detection.iou_threshold as f64)?;
        unit("HAZARD_RATIO_THRESHOLD", self.session.hazard_ratio_threshold)?;

        if self.session.capture_interval.is_zero() {
            return Err(Error::Config("CAPTURE_INTERVAL_SECS must be > 0".to_string()));
        }
        if self.session.window.is_zero() {
            return Err(Error::Config("CAPTURE_WINDOW_SECS must be > 0".to_string()));
        }
        if self.session.window > MAX_WINDOW || self.session.legacy_window > MAX_WINDOW {
            return Err(Error::Config(format!(
                "CAPTURE_WINDOW_SECS must be <= {}",
                MAX_WINDOW.as_secs()
            )));
        }
        if self.camera.capture_retry.attempts > MAX_ATTEMPTS {
            return Err(Error::Config(format!("CAMERA_RETRIES must be <= {}", MAX_ATTEMPTS)));
        }
        let timeouts = [
            ("CAMERA_TIMEOUT_SECS", self.camera.request_timeout),
            ("CAMERA_RETRY_BACKOFF_MS", self.camera.capture_retry.backoff),
            ("DETECTION_LOAD_TIMEOUT_SECS", self.detection.load_timeout),
            ("DETECTION_INFER_TIMEOUT_SECS", self.detection.infer_timeout),
        ];
        for (name, value) in timeouts {
            if value > MAX_TIMEOUT {
                return Err(Error::Config(format!(
                    "{} must be <= {}s",
                    name,
                    MAX_TIMEOUT.as_secs()
                )));
            }
        }
        if self.shutdown_heartbeat.is_zero() {
            return Err(Error::Config("SHUTDOWN_HEARTBEAT_SECS must be > 0".to_string()));
        }
        if self.detection.hazard_classes.is_empty() {
            return Err(Error::Config("HAZARD_CLASSES must name at least one class".to_string()));
        }
        if self.mqtt.sensor_topic == self.mqtt.legacy_alert_topic {
            return Err(Error::Config(
                "MQTT_TOPIC_SENSOR and MQTT_TOPIC_LEGACY_ALERT must differ".to_string(),
            ));
        }
        if self.verdict_log_capacity == 0 {
            return Err(Error::Config("VERDICT_LOG_CAPACITY must be > 0".to_string()));
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).unwrap_or(default)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        Ok(Duration::from_secs(self.parse(key, default.as_secs())?))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration> {
        Ok(Duration::from_millis(self.parse(key, default.as_millis() as u64)?))
    }
}

/// Application state shared with the status API
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: Arc<AppConfig>,
    /// Active session accounting
    pub registry: Arc<SessionRegistry>,
    /// Recently finished sessions
    pub verdicts: Arc<VerdictLog>,
    /// Process start
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_policy_constants() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.session.window, Duration::from_secs(60));
        assert_eq!(config.session.capture_interval, Duration::from_secs(5));
        assert_eq!(config.session.hazard_ratio_threshold, 0.2);
        assert_eq!(config.detection.conf_threshold, 0.25);
        assert_eq!(config.detection.iou_threshold, 0.45);
        assert_eq!(config.detection.load_timeout, Duration::from_secs(30));
        assert_eq!(config.detection.infer_timeout, Duration::from_secs(15));
        assert_eq!(config.detection.hazard_classes, vec!["fire", "smoke"]);
        assert_eq!(config.camera.frame_size, Some(FrameSize::Vga));
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = AppConfig::from_lookup(lookup(&[
            ("MQTT_BROKER_HOST", "broker.example.net"),
            ("MQTT_BROKER_PORT", "1883"),
            ("MQTT_USE_TLS", "false"),
            ("CAPTURE_WINDOW_SECS", "30"),
            ("HAZARD_RATIO_THRESHOLD", "0.5"),
            ("HAZARD_CLASSES", " Fire , SMOKE,flame "),
            ("CAMERA_FRAME_SIZE", "uxga"),
            ("CAMERA_RETRY_BACKOFF_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.mqtt.host, "broker.example.net");
        assert_eq!(config.mqtt.port, 1883);
        assert!(!config.mqtt.use_tls);
        assert_eq!(config.session.window, Duration::from_secs(30));
        assert_eq!(config.session.hazard_ratio_threshold, 0.5);
        assert_eq!(config.detection.hazard_classes, vec!["fire", "smoke", "flame"]);
        assert_eq!(config.camera.frame_size, Some(FrameSize::Uxga));
        assert_eq!(config.camera.capture_retry.backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_out_of_range_threshold_is_rejected() {
        let result = AppConfig::from_lookup(lookup(&[("HAZARD_RATIO_THRESHOLD", "1.5")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = AppConfig::from_lookup(lookup(&[("DETECTION_IOU_THRESHOLD", "-0.1")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let result = AppConfig::from_lookup(lookup(&[("MQTT_BROKER_PORT", "eighty")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let result = AppConfig::from_lookup(lookup(&[("CAPTURE_INTERVAL_SECS", "0")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_heartbeat_is_rejected() {
        let result = AppConfig::from_lookup(lookup(&[("SHUTDOWN_HEARTBEAT_SECS", "0")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_oversized_window_and_retries_are_rejected() {
        let result = AppConfig::from_lookup(lookup(&[("CAPTURE_WINDOW_SECS", "18446744073709551615")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = AppConfig::from_lookup(lookup(&[("CAMERA_RETRIES", "4294967295")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = AppConfig::from_lookup(lookup(&[("DETECTION_LOAD_TIMEOUT_SECS", "86400")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_frame_size_keep_disables_resolution_change() {
        let config = AppConfig::from_lookup(lookup(&[("CAMERA_FRAME_SIZE", "keep")])).unwrap();
        assert!(config.camera.frame_size.is_none());
    }
}
