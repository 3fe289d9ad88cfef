//! SessionStore - Per-session artifact folders
//!
//! ## Responsibilities
//!
//! - Claim one folder per session (never shared between sessions)
//! - Store each captured frame with a JSON sidecar
//! - Store the annotated frame when the engine returned one
//!
//! Layout:
//!
//! ```text
//! IMAGE_DIR/
//!   alert_2025-04-20_14-03-11/
//!     img_001_14-03-11_T41.5_H18.0_S1720.jpg
//!     img_001_14-03-11_T41.5_H18.0_S1720.json
//!     img_001_14-03-11_T41.5_H18.0_S1720_detected.jpg
//! ```

use crate::ai_client::{DetectionResult, DetectionSummary};
use crate::error::{Error, Result};
use crate::models::Alert;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Upper bound on `_N` suffixes tried for one session id
const MAX_FOLDER_SUFFIX: u32 = 1000;

/// Artifact root
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    /// Create new SessionStore
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Session id for a start instant (before collision suffixing)
    pub fn session_id_for(started_at: DateTime<Utc>) -> String {
        let stamp = started_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .replace(':', "-")
            .replace(' ', "_");
        format!("alert_{}", stamp)
    }

    /// Claim a fresh folder for `session_id`.
    ///
    /// Uses a non-recursive create; a folder left by an earlier run under the
    /// same name makes this one `<id>_2`, `<id>_3`, ... The session id itself
    /// is unchanged.
    pub async fn allocate(&self, session_id: &str) -> Result<SessionFolder> {
        fs::create_dir_all(&self.base_dir).await?;

        for n in 1..=MAX_FOLDER_SUFFIX {
            let name = if n == 1 {
                session_id.to_string()
            } else {
                format!("{}_{}", session_id, n)
            };
            let path = self.base_dir.join(&name);

            match fs::create_dir(&path).await {
                Ok(()) => {
                    tracing::debug!(
                        session_id = %session_id,
                        path = %path.display(),
                        "Session folder allocated"
                    );
                    return Ok(SessionFolder {
                        session_id: session_id.to_string(),
                        path,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Internal(format!(
            "no free session folder for {} after {} attempts",
            session_id, MAX_FOLDER_SUFFIX
        )))
    }
}

/// One captured frame to persist
pub struct CaptureRecord<'a> {
    /// 1-based index within the session
    pub image_index: u32,
    pub captured_at: DateTime<Utc>,
    pub alert: &'a Alert,
    pub image: &'a [u8],
    /// `None` when classification failed or no engine was available
    pub detection: Option<&'a DetectionResult>,
}

/// Paths written for one frame
#[derive(Debug, Clone)]
pub struct SavedCapture {
    pub image_path: PathBuf,
    pub sidecar_path: PathBuf,
    pub annotated_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct Sidecar<'a> {
    session_id: &'a str,
    image_index: u32,
    captured_at: DateTime<Utc>,
    sensor: &'a BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sensor_timestamp: Option<&'a str>,
    detection: Option<DetectionSummary>,
}

/// Folder owned by exactly one session
#[derive(Debug, Clone)]
pub struct SessionFolder {
    session_id: String,
    path: PathBuf,
}

impl SessionFolder {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write frame, sidecar and (if any) annotated frame
    pub async fn save_capture(&self, record: &CaptureRecord<'_>) -> Result<SavedCapture> {
        let stem = image_stem(record);
        let image_path = self.path.join(format!("{}.jpg", stem));
        let sidecar_path = self.path.join(format!("{}.json", stem));

        fs::write(&image_path, record.image).await?;

        let sidecar = Sidecar {
            session_id: &self.session_id,
            image_index: record.image_index,
            captured_at: record.captured_at,
            sensor: record.alert.readings(),
            sensor_timestamp: record.alert.timestamp(),
            detection: record.detection.map(DetectionResult::summary),
        };
        fs::write(&sidecar_path, serde_json::to_vec_pretty(&sidecar)?).await?;

        let annotated_path = match record.detection.and_then(|d| d.annotated_image.as_deref()) {
            Some(annotated) => {
                let path = self.path.join(format!("{}_detected.jpg", stem));
                fs::write(&path, annotated).await?;
                Some(path)
            }
            None => None,
        };

        tracing::debug!(
            session_id = %self.session_id,
            image_index = record.image_index,
            path = %image_path.display(),
            "Capture saved"
        );

        Ok(SavedCapture {
            image_path,
            sidecar_path,
            annotated_path,
        })
    }
}

fn image_stem(record: &CaptureRecord<'_>) -> String {
    let reading = |key: &str, precision: usize| {
        record
            .alert
            .reading(key)
            .map(|v| format!("{:.*}", precision, v))
            .unwrap_or_else(|| "NA".to_string())
    };

    format!(
        "img_{:03}_{}_T{}_H{}_S{}",
        record.image_index,
        record.captured_at.format("%H-%M-%S"),
        reading("temperature", 1),
        reading("humidity", 1),
        reading("smoke", 0),
    )
}
