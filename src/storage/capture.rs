//! Temporary capture buffer with a hold deadline.
//!
//! A capture collects records in memory without touching disk. Before its
//! deadline it can be promoted (written out under a permanent name) or
//! cancelled; once the deadline passes it expires and is discarded. At
//! most one capture exists at a time.

use crate::record::AggregatedRecord;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Capture lifecycle, as reported to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    /// No capture has been started.
    None,
    /// Records are being collected.
    Active,
    /// The last capture was written out permanently.
    Promoted,
    /// The last capture was cancelled by a client.
    Discarded,
    /// The last capture hit its deadline and was dropped.
    Expired,
}

/// Client-facing capture summary.
#[derive(Clone, Debug, Serialize)]
pub struct CaptureReport {
    /// Current lifecycle state.
    pub state: CaptureState,
    /// Identifier of the capture this report describes, if one exists or
    /// ever existed.
    pub id: Option<String>,
    /// Records held (0 unless active).
    pub records: usize,
    /// When the active capture started.
    pub started_at: Option<DateTime<Local>>,
    /// Seconds until the active capture expires.
    pub expires_in_secs: Option<f64>,
}

/// An active in-memory capture, bounded and drop-oldest.
pub struct CaptureBuffer {
    id: String,
    records: VecDeque<AggregatedRecord>,
    capacity: usize,
    started_at: DateTime<Local>,
    deadline: Instant,
}

impl CaptureBuffer {
    /// Start a capture named `id` that expires after `ttl`.
    pub fn start(id: String, capacity: usize, ttl: Duration) -> Self {
        Self {
            id,
            records: VecDeque::new(),
            capacity: capacity.max(1),
            started_at: Local::now(),
            deadline: Instant::now() + ttl,
        }
    }

    /// Capture identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Buffer one record, evicting the oldest at capacity.
    pub fn push(&mut self, record: AggregatedRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Deadline after which the capture expires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Records held so far.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been buffered yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Consume the buffer, yielding the collected records oldest first.
    pub fn into_records(self) -> Vec<AggregatedRecord> {
        self.records.into_iter().collect()
    }

    /// Summary while active.
    pub fn report(&self) -> CaptureReport {
        CaptureReport {
            state: CaptureState::Active,
            id: Some(self.id.clone()),
            records: self.records.len(),
            started_at: Some(self.started_at),
            expires_in_secs: Some(
                self.deadline
                    .saturating_duration_since(Instant::now())
                    .as_secs_f64(),
            ),
        }
    }
}

impl CaptureReport {
    /// Summary for a non-active lifecycle state, naming the last capture
    /// if one existed.
    pub fn idle(state: CaptureState, last_id: Option<String>) -> Self {
        Self {
            state,
            id: last_id,
            records: 0,
            started_at: None,
            expires_in_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tick: u64) -> AggregatedRecord {
        AggregatedRecord::new(Local::now(), 0.0, tick, None, None, None, None, None)
    }

    #[tokio::test]
    async fn capture_is_bounded_and_drops_oldest() {
        let mut capture = CaptureBuffer::start("c1".into(), 3, Duration::from_secs(60));
        for tick in 0..5 {
            capture.push(record(tick));
        }
        let ticks: Vec<u64> = capture.into_records().iter().map(|r| r.tick).collect();
        assert_eq!(ticks, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn report_counts_records_and_deadline() {
        let mut capture = CaptureBuffer::start("c2".into(), 10, Duration::from_secs(60));
        capture.push(record(0));
        let report = capture.report();
        assert_eq!(report.state, CaptureState::Active);
        assert_eq!(report.id.as_deref(), Some("c2"));
        assert_eq!(report.records, 1);
        assert!(report.expires_in_secs.is_some_and(|s| s > 50.0));
    }
}
