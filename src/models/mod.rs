//! Shared data models
//!
//! Inbound alerts as received from the sensor node and the outbound
//! verified status republished after verification.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Which inbound channel an alert came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Periodic sensor reading carrying `potential_wildfire`
    SensorReading,
    /// Older senders publishing `wildfire_detected` directly
    LegacyAlert,
}

impl AlertKind {
    /// Payload key holding the hazard flag for this kind
    pub fn hazard_field(&self) -> &'static str {
        match self {
            AlertKind::SensorReading => "potential_wildfire",
            AlertKind::LegacyAlert => "wildfire_detected",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::SensorReading => "sensor_reading",
            AlertKind::LegacyAlert => "legacy_alert",
        }
    }
}

/// Inbound alert (immutable once parsed)
#[derive(Debug, Clone)]
pub struct Alert {
    kind: AlertKind,
    hazard_flag: bool,
    readings: BTreeMap<String, f64>,
    timestamp: Option<String>,
    fields: Map<String, Value>,
    received_at: DateTime<Utc>,
}

impl Alert {
    /// Parse a broker payload
    ///
    /// The payload must be a JSON object. A missing hazard flag reads as
    /// `false`; numeric fields are collected as sensor readings.
    pub fn parse(kind: AlertKind, payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| Error::Parse(format!("payload is not JSON: {}", e)))?;

        let fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(Error::Parse(format!(
                    "payload must be a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        Self::from_fields(kind, fields)
    }

    /// Build from an already decoded JSON object
    pub fn from_fields(kind: AlertKind, fields: Map<String, Value>) -> Result<Self> {
        let hazard_key = kind.hazard_field();
        let hazard_flag = match fields.get(hazard_key) {
            None | Some(Value::Null) => false,
            Some(v) => truthy(v).ok_or_else(|| {
                Error::Parse(format!("{} is not a boolean: {}", hazard_key, v))
            })?,
        };

        let timestamp = match fields.get("timestamp") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let readings = fields
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
            .collect();

        Ok(Self {
            kind,
            hazard_flag,
            readings,
            timestamp,
            fields,
            received_at: Utc::now(),
        })
    }

    pub fn kind(&self) -> AlertKind {
        self.kind
    }

    pub fn hazard_flag(&self) -> bool {
        self.hazard_flag
    }

    /// Numeric sensor fields (temperature, humidity, smoke, ir_temperature, ...)
    pub fn readings(&self) -> &BTreeMap<String, f64> {
        &self.readings
    }

    pub fn reading(&self, key: &str) -> Option<f64> {
        self.readings.get(key).copied()
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    /// Original payload fields, untouched
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

fn truthy(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Aggregated numbers of one verification run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationSummary {
    /// Images successfully captured and classified
    pub verification_images: u32,
    /// Of those, images with a hazard class
    pub fire_detected_images: u32,
    /// `fire_detected_images / verification_images`; absent with zero images
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_ratio: Option<f64>,
}

/// Keys this relay owns in the outbound payload
const STATUS_KEYS: [&str; 4] = [
    "wildfire_detected",
    "verification_images",
    "fire_detected_images",
    "detection_ratio",
];

/// Outbound verified status (write-once)
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedStatus {
    #[serde(flatten)]
    fields: Map<String, Value>,
    wildfire_detected: bool,
    #[serde(flatten)]
    verification: Option<VerificationSummary>,
}

impl VerifiedStatus {
    /// Forward a non-hazard reading without verification
    pub fn passthrough(alert: &Alert) -> Self {
        Self::build(alert, false, None)
    }

    /// Final verdict of a verification session
    pub fn verified(alert: &Alert, verdict: bool, summary: VerificationSummary) -> Self {
        Self::build(alert, verdict, Some(summary))
    }

    fn build(alert: &Alert, verdict: bool, verification: Option<VerificationSummary>) -> Self {
        let mut fields = alert.fields().clone();
        for key in STATUS_KEYS {
            fields.remove(key);
        }
        Self {
            fields,
            wildfire_detected: verdict,
            verification,
        }
    }

    pub fn wildfire_detected(&self) -> bool {
        self.wildfire_detected
    }

    pub fn verification(&self) -> Option<&VerificationSummary> {
        self.verification.as_ref()
    }

    /// JSON bytes for the broker
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
