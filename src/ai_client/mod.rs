//! AiClient - Detection engine adapter
//!
//! ## Responsibilities
//!
//! - Model readiness (idempotent first load, hard load timeout)
//! - Single-image inference with a hard timeout
//! - Normalize engine output into `DetectionResult`
//!
//! The hazard flag is computed here from label names, never taken from
//! the engine.

use crate::call_guard::run_bounded;
use crate::error::{Error, Result};
use crate::state::DetectionConfig;
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Detection Adapter seam
#[async_trait]
pub trait Detector: Send + Sync {
    /// Load the model. No-op once it succeeded.
    async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<()>;

    /// Classify one image, readying the model first if needed
    async fn classify(&self, image: Vec<u8>, cancel: &CancellationToken)
        -> Result<DetectionResult>;
}

/// Normalized output of one classification call
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    /// Lower-cased label -> occurrences
    pub label_counts: BTreeMap<String, u32>,
    /// Any label in the configured hazard set
    pub hazard_detected: bool,
    pub latency_ms: f64,
    /// Engine-rendered image with boxes
    pub annotated_image: Option<Vec<u8>>,
}

impl DetectionResult {
    /// Sidecar view (without the image bytes)
    pub fn summary(&self) -> DetectionSummary {
        DetectionSummary {
            label_counts: self.label_counts.clone(),
            hazard_detected: self.hazard_detected,
            latency_ms: self.latency_ms,
        }
    }
}

/// Serializable part of a detection result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionSummary {
    pub label_counts: BTreeMap<String, u32>,
    pub hazard_detected: bool,
    pub latency_ms: f64,
}

/// Model load request
#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
    model: &'a str,
    conf_threshold: f32,
    iou_threshold: f32,
}

/// Engine detection response (either shape accepted)
#[derive(Debug, Default, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub detections: Option<Vec<RawDetection>>,
    #[serde(default)]
    pub class_counts: Option<BTreeMap<String, u32>>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    /// Per-stage timings (preprocess / inference / postprocess)
    #[serde(default)]
    pub speed: Option<BTreeMap<String, f64>>,
    /// Base64 JPEG
    #[serde(default)]
    pub annotated_image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDetection {
    pub label: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Detection engine client
pub struct AiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    conf_threshold: f32,
    iou_threshold: f32,
    load_timeout: Duration,
    infer_timeout: Duration,
    hazard_classes: HashSet<String>,
    ready: OnceCell<()>,
}

impl AiClient {
    /// Create new AI client
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.load_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            conf_threshold: config.conf_threshold,
            iou_threshold: config.iou_threshold,
            load_timeout: config.load_timeout,
            infer_timeout: config.infer_timeout,
            hazard_classes: config
                .hazard_classes
                .iter()
                .map(|c| c.trim().to_lowercase())
                .collect(),
            ready: OnceCell::new(),
        })
    }

    /// Check engine health, bounded by the inference timeout
    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<bool> {
        let url = format!("{}/healthz", self.base_url);
        let request = async {
            match self.client.get(&url).send().await {
                Ok(resp) => Ok(resp.status().is_success()),
                Err(_) => Ok(false),
            }
        };
        match run_bounded("health check", self.infer_timeout, cancel, request).await {
            Ok(healthy) => Ok(healthy),
            Err(Error::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    async fn load_model(&self) -> Result<()> {
        let url = format!("{}/v1/model/load", self.base_url);
        let request = LoadRequest {
            model: &self.model,
            conf_threshold: self.conf_threshold,
            iou_threshold: self.iou_threshold,
        };

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::ModelUnavailable(format!("{}: {}", self.model, e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::ModelUnavailable(format!(
                "{}: HTTP {} {}",
                self.model, status, body
            )));
        }

        tracing::info!(model = %self.model, "Detection model loaded");
        Ok(())
    }

    async fn detect(&self, image: Vec<u8>) -> Result<DetectResponse> {
        let url = format!("{}/v1/detect", self.base_url);

        let form = Form::new()
            .part(
                "image",
                Part::bytes(image)
                    .file_name("frame.jpg")
                    .mime_str("image/jpeg")?,
            )
            .text("conf", self.conf_threshold.to_string())
            .text("iou", self.iou_threshold.to_string());

        let resp = self.client.post(&url).multipart(form).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Detection(format!(
                "detect failed: HTTP {}",
                resp.status()
            )));
        }

        let result: DetectResponse = resp
            .json()
            .await
            .map_err(|e| Error::Detection(format!("unreadable detect response: {}", e)))?;
        Ok(result)
    }

    /// Fold an engine response into the shared result shape
    pub fn normalize(&self, response: DetectResponse) -> Result<DetectionResult> {
        normalize(response, &self.hazard_classes)
    }
}

fn normalize(response: DetectResponse, hazard_classes: &HashSet<String>) -> Result<DetectionResult> {
    let mut label_counts: BTreeMap<String, u32> = BTreeMap::new();

    match (response.detections, response.class_counts) {
        (Some(detections), _) => {
            for d in detections {
                let label = d.label.trim().to_lowercase();
                if label.is_empty() {
                    continue;
                }
                *label_counts.entry(label).or_default() += 1;
            }
        }
        (None, Some(counts)) => {
            for (label, n) in counts {
                let label = label.trim().to_lowercase();
                if label.is_empty() || n == 0 {
                    continue;
                }
                *label_counts.entry(label).or_default() += n;
            }
        }
        (None, None) => {
            return Err(Error::Detection(
                "response carries neither detections nor class_counts".to_string(),
            ))
        }
    }

    let hazard_detected = label_counts.keys().any(|l| hazard_classes.contains(l));

    let latency_ms = response
        .latency_ms
        .or_else(|| response.speed.map(|s| s.values().sum()))
        .unwrap_or(0.0);

    let annotated_image = response.annotated_image.and_then(|encoded| {
        match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Annotated image is not valid base64, dropped");
                None
            }
        }
    });

    Ok(DetectionResult {
        label_counts,
        hazard_detected,
        latency_ms,
        annotated_image,
    })
}

#[async_trait]
impl Detector for AiClient {
    async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<()> {
        self.ready
            .get_or_try_init(|| run_bounded("model load", self.load_timeout, cancel, self.load_model()))
            .await
            .map(|_| ())
    }

    async fn classify(
        &self,
        image: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<DetectionResult> {
        self.ensure_ready(cancel).await?;

        let response = run_bounded("inference", self.infer_timeout, cancel, self.detect(image)).await?;
        let result = self.normalize(response)?;

        tracing::debug!(
            labels = ?result.label_counts,
            hazard = result.hazard_detected,
            latency_ms = result.latency_ms,
            "Image classified"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> DetectionConfig {
        DetectionConfig {
            base_url,
            model: "yolov8l.pt".to_string(),
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            load_timeout: Duration::from_secs(2),
            infer_timeout: Duration::from_millis(300),
            hazard_classes: vec!["fire".to_string(), "smoke".to_string()],
        }
    }

    fn hazards() -> HashSet<String> {
        ["fire", "smoke"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_detection_list() {
        let response: DetectResponse = serde_json::from_value(json!({
            "detections": [
                {"label": " Fire ", "confidence": 0.81},
                {"label": "SMOKE", "confidence": 0.44},
                {"label": "fire", "confidence": 0.31},
                {"label": "person", "confidence": 0.9}
            ],
            "speed": {"preprocess": 1.5, "inference": 40.0, "postprocess": 2.5}
        }))
        .unwrap();

        let result = normalize(response, &hazards()).unwrap();
        assert_eq!(result.label_counts.get("fire"), Some(&2));
        assert_eq!(result.label_counts.get("smoke"), Some(&1));
        assert_eq!(result.label_counts.get("person"), Some(&1));
        assert!(result.hazard_detected);
        assert_eq!(result.latency_ms, 44.0);
        assert!(result.annotated_image.is_none());
    }

    #[test]
    fn test_normalize_class_counts_without_hazard() {
        let response: DetectResponse = serde_json::from_value(json!({
            "class_counts": {"Person": 2, "car": 1, "fire": 0},
            "latency_ms": 12.0,
            "annotated_image": "AQID"
        }))
        .unwrap();

        let result = normalize(response, &hazards()).unwrap();
        assert_eq!(result.label_counts.get("person"), Some(&2));
        assert!(!result.label_counts.contains_key("fire"));
        assert!(!result.hazard_detected);
        assert_eq!(result.latency_ms, 12.0);
        assert_eq!(result.annotated_image, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_normalize_rejects_unknown_shape() {
        let response: DetectResponse = serde_json::from_value(json!({"ok": true})).unwrap();
        assert!(matches!(
            normalize(response, &hazards()),
            Err(Error::Detection(_))
        ));
    }

    #[tokio::test]
    async fn test_model_load_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/model/load"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"loaded": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/detect"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"detections": [{"label": "smoke"}], "latency_ms": 9.0})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let client = AiClient::new(&config(server.uri())).unwrap();
        let cancel = CancellationToken::new();

        client.ensure_ready(&cancel).await.unwrap();
        let first = client.classify(vec![0xFF, 0xD8], &cancel).await.unwrap();
        let second = client.classify(vec![0xFF, 0xD8], &cancel).await.unwrap();

        assert!(client.is_ready());
        assert!(first.hazard_detected);
        assert!(second.hazard_detected);
    }

    #[tokio::test]
    async fn test_failed_load_is_model_unavailable_and_retried_later() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/model/load"))
            .respond_with(ResponseTemplate::new(404).set_body_string("weights not found"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/model/load"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = AiClient::new(&config(server.uri())).unwrap();
        let cancel = CancellationToken::new();

        let first = client.ensure_ready(&cancel).await;
        assert!(matches!(first, Err(Error::ModelUnavailable(_))));
        assert!(!client.is_ready());

        client.ensure_ready(&cancel).await.unwrap();
        assert!(client.is_ready());
    }

    #[tokio::test]
    async fn test_slow_inference_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/model/load"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/detect"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"detections": []}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = AiClient::new(&config(server.uri())).unwrap();
        let result = client
            .classify(vec![1, 2, 3], &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(Error::Timeout { operation: "inference", .. })
        ));
    }

    #[tokio::test]
    async fn test_health_check_unreachable_is_false() {
        let client = AiClient::new(&config("http://127.0.0.1:1".to_string())).unwrap();
        assert!(!client.health_check(&CancellationToken::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check_unresponsive_engine_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let client = AiClient::new(&config(server.uri())).unwrap();
        let healthy = tokio::time::timeout(
            Duration::from_secs(5),
            client.health_check(&CancellationToken::new()),
        )
        .await
        .expect("health check not bounded")
        .unwrap();
        assert!(!healthy);
    }
}
