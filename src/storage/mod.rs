//! Persistence task.
//!
//! All disk I/O lives in one task that owns the save session and the
//! temporary capture buffer. Records arrive on a bounded queue from the
//! aggregator; control arrives as commands carrying a oneshot reply
//! channel. Serializing everything through one task keeps file handles
//! single-owner and makes start/stop ordering trivial.

pub mod capture;
pub mod session;

pub use capture::{CaptureBuffer, CaptureReport, CaptureState};
pub use session::{SaveSession, SaveSummary};

use crate::config::StorageConfig;
use crate::error::{AppResult, MonitorError};
use crate::record::AggregatedRecord;
use crate::task::TaskHandle;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Result of promoting a capture.
#[derive(Clone, Debug, Serialize)]
pub struct PromotedCapture {
    /// Permanent folder the records were written to.
    pub folder: String,
    /// Number of records written.
    pub rows: usize,
}

/// Snapshot of the persistence state, as reported to clients.
#[derive(Clone, Debug, Serialize)]
pub struct SaveStatus {
    /// Whether a save session is open.
    pub saving: bool,
    /// Open session folder, if any.
    pub folder: Option<String>,
    /// Rows written in the open session.
    pub rows: u64,
    /// CSV files opened in the open session.
    pub files: u32,
    /// Capture buffer summary.
    pub capture: CaptureReport,
}

/// Control messages for the persistence task.
pub enum StorageCommand {
    /// Open a save session under the given name.
    StartSaving {
        /// Session name, used in the folder prefix.
        name: String,
        /// Receives the created folder path.
        reply: oneshot::Sender<AppResult<PathBuf>>,
    },
    /// Close the open save session.
    StopSaving {
        /// Receives the final counters.
        reply: oneshot::Sender<AppResult<SaveSummary>>,
    },
    /// Start (or restart) the in-memory capture buffer.
    BeginCapture {
        /// Caller-chosen capture identifier, echoed back in reports.
        id: String,
        /// Receives the fresh capture summary.
        reply: oneshot::Sender<AppResult<CaptureReport>>,
    },
    /// Write the capture out under a permanent name.
    PromoteCapture {
        /// Permanent name, used in the folder prefix.
        name: String,
        /// Receives the promotion result.
        reply: oneshot::Sender<AppResult<PromotedCapture>>,
    },
    /// Discard the capture buffer.
    CancelCapture {
        /// Receives the post-cancel summary.
        reply: oneshot::Sender<AppResult<CaptureReport>>,
    },
    /// Query the capture buffer.
    CaptureInfo {
        /// Receives the current summary.
        reply: oneshot::Sender<CaptureReport>,
    },
    /// Query the full persistence state.
    SaveStatus {
        /// Receives the current status.
        reply: oneshot::Sender<SaveStatus>,
    },
}

/// Handle for sending commands to the persistence task.
#[derive(Clone)]
pub struct StorageClient {
    tx: mpsc::Sender<StorageCommand>,
}

impl StorageClient {
    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> StorageCommand,
    ) -> AppResult<R> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| MonitorError::StorageUnavailable)?;
        rx.await.map_err(|_| MonitorError::StorageUnavailable)
    }

    /// Open a save session; rejected if one is already open.
    pub async fn start_saving(&self, name: String) -> AppResult<PathBuf> {
        self.request(|reply| StorageCommand::StartSaving { name, reply })
            .await?
    }

    /// Close the open save session; rejected if none is open.
    pub async fn stop_saving(&self) -> AppResult<SaveSummary> {
        self.request(|reply| StorageCommand::StopSaving { reply })
            .await?
    }

    /// Start or restart the capture buffer.
    pub async fn begin_capture(&self, id: String) -> AppResult<CaptureReport> {
        self.request(|reply| StorageCommand::BeginCapture { id, reply })
            .await?
    }

    /// Promote the capture buffer under a permanent name.
    pub async fn promote_capture(&self, name: String) -> AppResult<PromotedCapture> {
        self.request(|reply| StorageCommand::PromoteCapture { name, reply })
            .await?
    }

    /// Discard the capture buffer.
    pub async fn cancel_capture(&self) -> AppResult<CaptureReport> {
        self.request(|reply| StorageCommand::CancelCapture { reply })
            .await?
    }

    /// Current capture buffer summary.
    pub async fn capture_info(&self) -> AppResult<CaptureReport> {
        self.request(|reply| StorageCommand::CaptureInfo { reply })
            .await
    }

    /// Current persistence state.
    pub async fn save_status(&self) -> AppResult<SaveStatus> {
        self.request(|reply| StorageCommand::SaveStatus { reply })
            .await
    }
}

struct TaskState {
    config: StorageConfig,
    session: Option<SaveSession>,
    capture: Option<CaptureBuffer>,
    last_capture_state: CaptureState,
    last_capture_id: Option<String>,
}

impl TaskState {
    fn ingest(&mut self, record: AggregatedRecord) {
        if let Some(capture) = self.capture.as_mut() {
            capture.push(record.clone());
        }
        if let Some(session) = self.session.as_mut() {
            if let Err(err) = session.append(&record) {
                // A failing disk ends the session rather than wedging the
                // pipeline; acquisition and fan-out keep running.
                error!(error = %err, "persistence write failed, closing session");
                if let Some(session) = self.session.take() {
                    if let Err(close_err) = session.close() {
                        error!(error = %close_err, "session close after write failure");
                    }
                }
            }
        }
    }

    fn capture_report(&self) -> CaptureReport {
        match self.capture.as_ref() {
            Some(capture) => capture.report(),
            None => CaptureReport::idle(self.last_capture_state, self.last_capture_id.clone()),
        }
    }

    fn save_status(&self) -> SaveStatus {
        SaveStatus {
            saving: self.session.is_some(),
            folder: self
                .session
                .as_ref()
                .map(|s| s.folder().display().to_string()),
            rows: self.session.as_ref().map(SaveSession::rows).unwrap_or(0),
            files: self.session.as_ref().map(SaveSession::files).unwrap_or(0),
            capture: self.capture_report(),
        }
    }

    fn handle(&mut self, command: StorageCommand) {
        match command {
            StorageCommand::StartSaving { name, reply } => {
                let result = if self.session.is_some() {
                    Err(MonitorError::AlreadySaving)
                } else {
                    match SaveSession::begin(&name, &self.config) {
                        Ok(session) => {
                            let folder = session.folder().to_path_buf();
                            self.session = Some(session);
                            Ok(folder)
                        }
                        Err(err) => Err(err),
                    }
                };
                let _ = reply.send(result);
            }
            StorageCommand::StopSaving { reply } => {
                let result = match self.session.take() {
                    Some(session) => session.close(),
                    None => Err(MonitorError::NotSaving),
                };
                let _ = reply.send(result);
            }
            StorageCommand::BeginCapture { id, reply } => {
                if self.capture.is_some() {
                    info!("restarting capture, previous buffer discarded");
                }
                self.capture = Some(CaptureBuffer::start(
                    id,
                    self.config.capture_capacity,
                    self.config.capture_ttl,
                ));
                let _ = reply.send(Ok(self.capture_report()));
            }
            StorageCommand::PromoteCapture { name, reply } => {
                let result = match self.capture.as_ref() {
                    None => Err(MonitorError::NoActiveCapture),
                    Some(capture) if capture.is_empty() => {
                        // Keep the capture alive; it may still fill.
                        Err(MonitorError::EmptyCapture(name))
                    }
                    Some(_) => {
                        let records = match self.capture.take() {
                            Some(capture) => {
                                self.last_capture_id = Some(capture.id().to_owned());
                                capture.into_records()
                            }
                            None => Vec::new(),
                        };
                        let rows = records.len();
                        match session::dump_records(&name, &records, &self.config) {
                            Ok(dir) => {
                                self.last_capture_state = CaptureState::Promoted;
                                Ok(PromotedCapture {
                                    folder: dir.display().to_string(),
                                    rows,
                                })
                            }
                            Err(err) => {
                                self.last_capture_state = CaptureState::Discarded;
                                Err(err)
                            }
                        }
                    }
                };
                let _ = reply.send(result);
            }
            StorageCommand::CancelCapture { reply } => {
                let result = match self.capture.take() {
                    Some(capture) => {
                        self.last_capture_state = CaptureState::Discarded;
                        self.last_capture_id = Some(capture.id().to_owned());
                        Ok(self.capture_report())
                    }
                    None => Err(MonitorError::NoActiveCapture),
                };
                let _ = reply.send(result);
            }
            StorageCommand::CaptureInfo { reply } => {
                let _ = reply.send(self.capture_report());
            }
            StorageCommand::SaveStatus { reply } => {
                let _ = reply.send(self.save_status());
            }
        }
    }
}

/// The persistence task.
pub struct StorageTask;

impl StorageTask {
    /// Spawn the task; returns the command client and the task handle.
    pub fn spawn(
        config: StorageConfig,
        mut record_rx: mpsc::Receiver<AggregatedRecord>,
    ) -> (StorageClient, TaskHandle) {
        let (tx, mut command_rx) = mpsc::channel(32);
        let handle = TaskHandle::spawn("storage", move |mut stop| async move {
            let mut state = TaskState {
                config,
                session: None,
                capture: None,
                last_capture_state: CaptureState::None,
                last_capture_id: None,
            };
            let mut records_open = true;

            loop {
                let expiry = state.capture.as_ref().map(CaptureBuffer::deadline);
                tokio::select! {
                    _ = stop.stopped() => break,
                    command = command_rx.recv() => match command {
                        Some(command) => state.handle(command),
                        None => break,
                    },
                    record = next_record(&mut record_rx, records_open) => match record {
                        Some(record) => state.ingest(record),
                        None => records_open = false,
                    },
                    _ = expire_at(expiry) => {
                        if let Some(capture) = state.capture.take() {
                            state.last_capture_id = Some(capture.id().to_owned());
                            warn!(id = %capture.id(), "capture hold expired, buffer discarded");
                        }
                        state.last_capture_state = CaptureState::Expired;
                    }
                }
            }

            if let Some(session) = state.session.take() {
                match session.close() {
                    Ok(summary) => info!(folder = %summary.folder, "session closed on shutdown"),
                    Err(err) => error!(error = %err, "session close on shutdown"),
                }
            }
        });
        (StorageClient { tx }, handle)
    }
}

async fn next_record(
    rx: &mut mpsc::Receiver<AggregatedRecord>,
    open: bool,
) -> Option<AggregatedRecord> {
    if open {
        rx.recv().await
    } else {
        std::future::pending().await
    }
}

async fn expire_at(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use std::time::Duration;

    fn test_config(base: &std::path::Path) -> StorageConfig {
        StorageConfig {
            base_dir: base.to_path_buf(),
            rotation_interval: Duration::from_secs(3600),
            power_threshold_w: 10.0,
            aux_snapshot_interval: Duration::from_secs(1),
            capture_ttl: Duration::from_millis(80),
            capture_capacity: 100,
        }
    }

    fn record(tick: u64) -> AggregatedRecord {
        AggregatedRecord::new(Local::now(), 0.0, tick, None, None, None, None, None)
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (_record_tx, record_rx) = mpsc::channel(8);
        let (client, handle) = StorageTask::spawn(test_config(tmp.path()), record_rx);

        client.start_saving("run".into()).await.unwrap();
        let err = client.start_saving("again".into()).await.unwrap_err();
        assert!(matches!(err, MonitorError::AlreadySaving));

        let summary = client.stop_saving().await.unwrap();
        assert_eq!(summary.rows, 0);
        let err = client.stop_saving().await.unwrap_err();
        assert!(matches!(err, MonitorError::NotSaving));

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn records_flow_into_open_session() {
        let tmp = tempfile::tempdir().unwrap();
        let (record_tx, record_rx) = mpsc::channel(8);
        let (client, handle) = StorageTask::spawn(test_config(tmp.path()), record_rx);

        client.start_saving("flow".into()).await.unwrap();
        for tick in 0..3 {
            record_tx.send(record(tick)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = client.save_status().await.unwrap();
        assert!(status.saving);
        assert_eq!(status.rows, 3);

        let summary = client.stop_saving().await.unwrap();
        assert_eq!(summary.rows, 3);
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn capture_promote_before_expiry() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.capture_ttl = Duration::from_secs(60);
        let (record_tx, record_rx) = mpsc::channel(8);
        let (client, handle) = StorageTask::spawn(config, record_rx);

        client.begin_capture("hold".into()).await.unwrap();
        record_tx.send(record(0)).await.unwrap();
        record_tx.send(record(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let promoted = client.promote_capture("kept".into()).await.unwrap();
        assert_eq!(promoted.rows, 2);
        assert!(std::path::Path::new(&promoted.folder)
            .join("records.csv")
            .is_file());

        let report = client.capture_info().await.unwrap();
        assert_eq!(report.state, CaptureState::Promoted);
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn capture_expires_after_ttl() {
        let tmp = tempfile::tempdir().unwrap();
        let (record_tx, record_rx) = mpsc::channel(8);
        let (client, handle) = StorageTask::spawn(test_config(tmp.path()), record_rx);

        client.begin_capture("hold".into()).await.unwrap();
        record_tx.send(record(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let report = client.capture_info().await.unwrap();
        assert_eq!(report.state, CaptureState::Expired);
        assert_eq!(report.id.as_deref(), Some("hold"));
        let err = client.promote_capture("late".into()).await.unwrap_err();
        assert!(matches!(err, MonitorError::NoActiveCapture));
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn empty_capture_cannot_be_promoted_but_stays_active() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.capture_ttl = Duration::from_secs(60);
        let (record_tx, record_rx) = mpsc::channel(8);
        let (client, handle) = StorageTask::spawn(config, record_rx);

        client.begin_capture("hold".into()).await.unwrap();
        let err = client.promote_capture("nothing".into()).await.unwrap_err();
        assert!(matches!(err, MonitorError::EmptyCapture(_)));

        record_tx.send(record(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let promoted = client.promote_capture("second_try".into()).await.unwrap();
        assert_eq!(promoted.rows, 1);
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn cancel_discards_capture() {
        let tmp = tempfile::tempdir().unwrap();
        let (_record_tx, record_rx) = mpsc::channel(8);
        let (client, handle) = StorageTask::spawn(test_config(tmp.path()), record_rx);

        client.begin_capture("hold".into()).await.unwrap();
        let report = client.cancel_capture().await.unwrap();
        assert_eq!(report.state, CaptureState::Discarded);
        let err = client.cancel_capture().await.unwrap_err();
        assert!(matches!(err, MonitorError::NoActiveCapture));
        handle.shutdown(Duration::from_secs(1)).await;
    }
}
