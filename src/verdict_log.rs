//! VerdictLog - Finished session reports (Ring Buffer)
//!
//! ## Responsibilities
//!
//! - Keep the most recent session reports in memory
//! - Serve them to the status API

use crate::verification_session::SessionMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Outcome of one finished session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionReport {
    pub session_id: String,
    pub mode: SessionMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub images_captured: u32,
    pub images_with_hazard: u32,
    pub detection_ratio: Option<f64>,
    /// Hazard flag carried by the triggering alert
    pub original_flag: bool,
    /// Final verdict (`None` for legacy capture loops)
    pub verdict: Option<bool>,
    pub published: bool,
}

struct ReportRingBuffer {
    reports: VecDeque<SessionReport>,
    capacity: usize,
}

impl ReportRingBuffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            reports: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, report: SessionReport) {
        if self.reports.len() >= self.capacity {
            self.reports.pop_front();
        }
        self.reports.push_back(report);
    }

    fn latest(&self, count: usize) -> Vec<SessionReport> {
        self.reports.iter().rev().take(count).cloned().collect()
    }
}

/// VerdictLog instance
pub struct VerdictLog {
    buffer: RwLock<ReportRingBuffer>,
}

impl VerdictLog {
    /// Create new VerdictLog
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RwLock::new(ReportRingBuffer::new(capacity)),
        }
    }

    /// Record a finished session
    pub async fn record(&self, report: SessionReport) {
        let mut buffer = self.buffer.write().await;
        tracing::debug!(session_id = %report.session_id, "Session report recorded");
        buffer.push(report);
    }

    /// Newest first
    pub async fn latest(&self, count: usize) -> Vec<SessionReport> {
        self.buffer.read().await.latest(count)
    }

    pub async fn len(&self) -> usize {
        self.buffer.read().await.reports.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffer.read().await.reports.is_empty()
    }
}

impl Default for VerdictLog {
    fn default() -> Self {
        Self::new(200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: &str) -> SessionReport {
        SessionReport {
            session_id: id.to_string(),
            mode: SessionMode::Verification,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            images_captured: 8,
            images_with_hazard: 2,
            detection_ratio: Some(0.25),
            original_flag: true,
            verdict: Some(true),
            published: true,
        }
    }

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let log = VerdictLog::new(2);
        log.record(report("a")).await;
        log.record(report("b")).await;
        log.record(report("c")).await;

        let latest = log.latest(10).await;
        assert_eq!(log.len().await, 2);
        assert_eq!(latest[0].session_id, "c");
        assert_eq!(latest[1].session_id, "b");
    }

    #[tokio::test]
    async fn test_latest_respects_count() {
        let log = VerdictLog::default();
        assert!(log.is_empty().await);
        for i in 0..5 {
            log.record(report(&format!("s{}", i))).await;
        }
        let latest = log.latest(3).await;
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].session_id, "s4");
    }
}
