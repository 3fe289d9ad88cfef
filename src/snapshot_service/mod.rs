//! SnapshotService - Image Capture from the field camera
//!
//! ## Responsibilities
//!
//! - Single-frame JPEG capture over HTTP (`GET /capture`)
//! - Best-effort resolution change (`GET /control?var=framesize&val=n`)
//! - Bounded retry with fixed backoff for both calls
//!
//! Safe for concurrent use by several sessions; no fairness between them.

use crate::call_guard::RetryPolicy;
use crate::error::{Error, Result};
use crate::state::CameraConfig;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Capture Adapter seam
#[async_trait]
pub trait Camera: Send + Sync {
    /// Fetch one image, optionally asking for `frame_size` first.
    ///
    /// Exhausted retries come back as `Err`, never as a panic.
    async fn capture(
        &self,
        frame_size: Option<FrameSize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;
}

/// Camera frame sizes and their control codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameSize {
    Qvga,
    Cif,
    Vga,
    Svga,
    Xga,
    Hd,
    Sxga,
    Uxga,
}

impl FrameSize {
    /// Value for `/control?var=framesize&val=`
    pub fn code(&self) -> u8 {
        match self {
            FrameSize::Qvga => 5,
            FrameSize::Cif => 6,
            FrameSize::Vga => 8,
            FrameSize::Svga => 9,
            FrameSize::Xga => 10,
            FrameSize::Hd => 11,
            FrameSize::Sxga => 12,
            FrameSize::Uxga => 13,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameSize::Qvga => "QVGA",
            FrameSize::Cif => "CIF",
            FrameSize::Vga => "VGA",
            FrameSize::Svga => "SVGA",
            FrameSize::Xga => "XGA",
            FrameSize::Hd => "HD",
            FrameSize::Sxga => "SXGA",
            FrameSize::Uxga => "UXGA",
        }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QVGA" => Ok(FrameSize::Qvga),
            "CIF" => Ok(FrameSize::Cif),
            "VGA" => Ok(FrameSize::Vga),
            "SVGA" => Ok(FrameSize::Svga),
            "XGA" => Ok(FrameSize::Xga),
            "HD" => Ok(FrameSize::Hd),
            "SXGA" => Ok(FrameSize::Sxga),
            "UXGA" => Ok(FrameSize::Uxga),
            other => Err(Error::Config(format!("unknown frame size: {}", other))),
        }
    }
}

/// SnapshotService instance
pub struct SnapshotService {
    client: reqwest::Client,
    base_url: String,
    capture_retry: RetryPolicy,
    resolution_retry: RetryPolicy,
    /// Last frame size we asked the camera for (attempted, not confirmed)
    requested: Mutex<Option<FrameSize>>,
}

impl SnapshotService {
    /// Create new SnapshotService
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            capture_retry: config.capture_retry,
            resolution_retry: config.resolution_retry,
            requested: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the camera for a resolution. Failure is logged and ignored.
    pub async fn set_resolution(&self, frame_size: FrameSize, cancel: &CancellationToken) {
        let url = format!(
            "{}/control?var=framesize&val={}",
            self.base_url,
            frame_size.code()
        );

        let result = self
            .resolution_retry
            .retry("camera resolution", cancel, |_| self.get_ok(&url))
            .await;

        match result {
            Ok(_) => {
                tracing::debug!(frame_size = %frame_size, "Camera resolution set");
            }
            Err(e) => {
                tracing::warn!(
                    frame_size = %frame_size,
                    error = %e,
                    "Failed to set camera resolution, capturing at current size"
                );
            }
        }
    }

    /// Returns true when `frame_size` differs from the last attempted one
    fn claim_frame_size(&self, frame_size: FrameSize) -> bool {
        let mut requested = match self.requested.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *requested == Some(frame_size) {
            false
        } else {
            *requested = Some(frame_size);
            true
        }
    }

    async fn capture_once(&self) -> Result<Vec<u8>> {
        let url = format!("{}/capture", self.base_url);
        let bytes = self.get_ok(&url).await?;
        if bytes.is_empty() {
            return Err(Error::Camera("empty capture body".to_string()));
        }
        Ok(bytes)
    }

    async fn get_ok(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Camera(format!("HTTP {} from {}", resp.status(), url)));
        }

        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Camera for SnapshotService {
    async fn capture(
        &self,
        frame_size: Option<FrameSize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if let Some(size) = frame_size {
            if self.claim_frame_size(size) {
                self.set_resolution(size, cancel).await;
            }
        }

        let image = self
            .capture_retry
            .retry("camera capture", cancel, |_| self.capture_once())
            .await?;

        tracing::debug!(size = image.len(), "Captured camera frame");
        Ok(image)
    }
}
