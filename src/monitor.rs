//! Process supervisor.
//!
//! Owns every long-lived piece: the channel stores, the history, the
//! fan-out hub, the persistence task, and (while acquisition runs) the
//! sampling workers, the bridge child, and the aggregator. The network
//! server holds an `Arc<Monitor>` and drives everything through the
//! methods here.

use crate::aggregator::{AcquisitionState, Aggregator, Channels, CncSource, History};
use crate::bridge::Bridge;
use crate::config::Config;
use crate::error::{AppResult, MonitorError};
use crate::net::broadcast::Broadcaster;
use crate::net::event::Event;
use crate::record::AggregatedRecord;
use crate::sampler::mock::{MockAuxCamera, MockCamera, MockCnc, MockLaser, MockPyrometer};
use crate::sampler::SamplingWorker;
use crate::storage::{
    CaptureReport, PromotedCapture, SaveStatus, SaveSummary, StorageClient, StorageTask,
};
use crate::store::{FrameRing, LatestStore};
use crate::task::TaskHandle;
use futures::future;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Reply payload for status queries.
#[derive(Debug, Serialize)]
pub struct SystemStatus {
    /// Acquisition lifecycle state.
    pub acquisition: AcquisitionState,
    /// Per-instrument connection flags.
    pub instruments: BTreeMap<&'static str, bool>,
    /// Connected subscriber count.
    pub clients: usize,
    /// Records currently retained in memory.
    pub history_len: usize,
}

struct Run {
    state: AcquisitionState,
    workers: Vec<TaskHandle>,
    aggregator: Option<TaskHandle>,
    forwarder: Option<TaskHandle>,
    bridge: Option<Bridge>,
}

/// The top-level application object.
pub struct Monitor {
    config: Config,
    channels: Channels,
    history: Arc<History>,
    broadcaster: Arc<Broadcaster>,
    storage: StorageClient,
    storage_record_tx: mpsc::Sender<AggregatedRecord>,
    storage_task: Mutex<Option<TaskHandle>>,
    run: Mutex<Run>,
}

impl Monitor {
    /// Build the pipeline scaffolding and spawn the persistence task.
    ///
    /// Acquisition stays idle until [`Monitor::start_acquisition`].
    pub fn new(config: Config) -> Arc<Self> {
        let instruments = &config.instruments;
        let bridge = config.bridge.enabled.then(|| Bridge::new(config.bridge.clone()));

        let cnc = match bridge.as_ref() {
            Some(bridge) => CncSource::Bridge(bridge.handle()),
            None if instruments.cnc.enabled => {
                CncSource::Store(Arc::new(LatestStore::new(instruments.cnc.store_capacity)))
            }
            None => CncSource::Disabled,
        };
        let channels = Channels {
            camera: Arc::new(LatestStore::new(instruments.camera.store_capacity)),
            cnc,
            laser: Arc::new(LatestStore::new(instruments.laser.store_capacity)),
            pyrometer: Arc::new(LatestStore::new(instruments.pyrometer.store_capacity)),
            aux_camera: Arc::new(FrameRing::new(instruments.aux_camera.store_capacity)),
        };

        let (storage_record_tx, storage_record_rx) =
            mpsc::channel(config.acquisition.handoff_queue);
        let (storage, storage_handle) =
            StorageTask::spawn(config.storage.clone(), storage_record_rx);

        Arc::new(Self {
            history: Arc::new(History::new(config.acquisition.history_capacity)),
            broadcaster: Arc::new(Broadcaster::new(config.server.subscriber_queue)),
            channels,
            storage,
            storage_record_tx,
            storage_task: Mutex::new(Some(storage_handle)),
            run: Mutex::new(Run {
                state: AcquisitionState::Idle,
                workers: Vec::new(),
                aggregator: None,
                forwarder: None,
                bridge,
            }),
            config,
        })
    }

    /// Fan-out hub, shared with the network server.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the pipeline: workers, bridge child, tick loop, fan-out
    /// forwarder. Rejected while already running.
    pub async fn start_acquisition(self: &Arc<Self>) -> AppResult<()> {
        let mut run = self.run.lock().await;
        if run.state == AcquisitionState::Running {
            return Err(MonitorError::AlreadyRunning);
        }

        if let Some(bridge) = run.bridge.as_mut() {
            bridge.start().await?;
        }

        let instruments = &self.config.instruments;
        let mut workers = Vec::new();
        if instruments.camera.enabled {
            workers.push(SamplingWorker::spawn(
                "camera",
                instruments.camera.rate_hz,
                MockCamera,
                self.channels.camera.clone(),
            ));
        }
        if instruments.cnc.enabled && !self.config.bridge.enabled {
            if let CncSource::Store(store) = &self.channels.cnc {
                workers.push(SamplingWorker::spawn(
                    "cnc",
                    instruments.cnc.rate_hz,
                    MockCnc,
                    store.clone(),
                ));
            }
        }
        if instruments.laser.enabled {
            workers.push(SamplingWorker::spawn(
                "laser",
                instruments.laser.rate_hz,
                MockLaser,
                self.channels.laser.clone(),
            ));
        }
        if instruments.pyrometer.enabled {
            workers.push(SamplingWorker::spawn(
                "pyrometer",
                instruments.pyrometer.rate_hz,
                MockPyrometer,
                self.channels.pyrometer.clone(),
            ));
        }
        if instruments.aux_camera.enabled {
            workers.push(SamplingWorker::spawn(
                "aux_camera",
                instruments.aux_camera.rate_hz,
                MockAuxCamera,
                self.channels.aux_camera.clone(),
            ));
        }

        let (broadcast_tx, broadcast_rx) = mpsc::channel(self.config.acquisition.handoff_queue);
        run.forwarder = Some(spawn_forwarder(self.broadcaster.clone(), broadcast_rx));
        run.aggregator = Some(Aggregator::spawn(
            self.config.acquisition.tick_period,
            self.channels.clone(),
            self.history.clone(),
            self.storage_record_tx.clone(),
            broadcast_tx,
        ));
        run.workers = workers;
        run.state = AcquisitionState::Running;
        info!(
            tick_period = ?self.config.acquisition.tick_period,
            workers = run.workers.len(),
            "acquisition started"
        );

        drop(run);
        self.push_status_event().await;
        Ok(())
    }

    /// Stop the pipeline. Rejected unless running.
    pub async fn stop_acquisition(self: &Arc<Self>) -> AppResult<()> {
        let mut run = self.run.lock().await;
        if run.state != AcquisitionState::Running {
            return Err(MonitorError::NotRunning);
        }

        if let Some(aggregator) = run.aggregator.take() {
            aggregator.shutdown(SHUTDOWN_GRACE).await;
        }
        let stops = run
            .workers
            .drain(..)
            .map(|worker| worker.shutdown(SHUTDOWN_GRACE));
        future::join_all(stops).await;
        if let Some(forwarder) = run.forwarder.take() {
            forwarder.shutdown(SHUTDOWN_GRACE).await;
        }
        if let Some(bridge) = run.bridge.as_mut() {
            bridge.stop().await;
        }
        run.state = AcquisitionState::Stopped;
        info!("acquisition stopped");

        drop(run);
        self.push_status_event().await;
        Ok(())
    }

    /// Current system status.
    pub async fn status(&self) -> SystemStatus {
        let run = self.run.lock().await;
        SystemStatus {
            acquisition: run.state,
            instruments: self.channels.connection_status(),
            clients: self.broadcaster.count(),
            history_len: self.history.len(),
        }
    }

    /// Most recent record, if any tick has run.
    pub fn latest(&self) -> Option<AggregatedRecord> {
        self.history.latest()
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn history(&self, limit: usize) -> Vec<AggregatedRecord> {
        self.history.tail(limit)
    }

    /// Open a save session and notify subscribers.
    pub async fn start_saving(&self, name: String) -> AppResult<PathBuf> {
        let folder = self.storage.start_saving(name).await?;
        self.push_save_status_event().await;
        Ok(folder)
    }

    /// Close the save session and notify subscribers.
    pub async fn stop_saving(&self) -> AppResult<SaveSummary> {
        let summary = self.storage.stop_saving().await?;
        self.push_save_status_event().await;
        Ok(summary)
    }

    /// Start or restart the temporary capture.
    pub async fn begin_capture(&self, id: String) -> AppResult<CaptureReport> {
        let report = self.storage.begin_capture(id).await?;
        self.push_save_status_event().await;
        Ok(report)
    }

    /// Promote the capture under a permanent name.
    pub async fn promote_capture(&self, name: String) -> AppResult<PromotedCapture> {
        let promoted = self.storage.promote_capture(name).await?;
        self.push_save_status_event().await;
        Ok(promoted)
    }

    /// Discard the capture.
    pub async fn cancel_capture(&self) -> AppResult<CaptureReport> {
        let report = self.storage.cancel_capture().await?;
        self.push_save_status_event().await;
        Ok(report)
    }

    /// Capture summary.
    pub async fn capture_info(&self) -> AppResult<CaptureReport> {
        self.storage.capture_info().await
    }

    /// Persistence state.
    pub async fn save_status(&self) -> AppResult<SaveStatus> {
        self.storage.save_status().await
    }

    /// Push a status event to all subscribers.
    pub async fn push_status_event(&self) {
        let status = self.status().await;
        let event = Event::status_update(status.acquisition, status.instruments, status.clients);
        if let Err(err) = self.broadcaster.broadcast(&event) {
            warn!(error = %err, "status broadcast");
        }
    }

    async fn push_save_status_event(&self) {
        if let Ok(status) = self.storage.save_status().await {
            if let Err(err) = self.broadcaster.broadcast(&Event::save_status(status)) {
                warn!(error = %err, "save status broadcast");
            }
        }
    }

    /// Stop everything, including the persistence task.
    pub async fn shutdown(self: &Arc<Self>) {
        if let Err(err) = self.stop_acquisition().await {
            if !err.is_rejection() {
                warn!(error = %err, "shutdown stop");
            }
        }
        if let Some(handle) = self.storage_task.lock().await.take() {
            handle.shutdown(SHUTDOWN_GRACE).await;
        }
        info!("monitor shut down");
    }
}

fn spawn_forwarder(
    broadcaster: Arc<Broadcaster>,
    mut rx: mpsc::Receiver<AggregatedRecord>,
) -> TaskHandle {
    TaskHandle::spawn("broadcast-forwarder", move |mut stop| async move {
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                record = rx.recv() => match record {
                    Some(record) => {
                        if let Err(err) = broadcaster.broadcast(&Event::sensor_data(record)) {
                            warn!(error = %err, "record broadcast");
                        }
                    }
                    None => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(base: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.base_dir = base.to_path_buf();
        config.acquisition.tick_period = Duration::from_millis(10);
        config.instruments.camera.enabled = false;
        config.instruments.cnc.enabled = false;
        config.instruments.aux_camera.enabled = false;
        config.instruments.laser.rate_hz = 200.0;
        config.instruments.pyrometer.rate_hz = 200.0;
        config
    }

    #[tokio::test]
    async fn lifecycle_rejects_double_start_and_double_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = Monitor::new(test_config(tmp.path()));

        let err = monitor.stop_acquisition().await.unwrap_err();
        assert!(matches!(err, MonitorError::NotRunning));

        monitor.start_acquisition().await.unwrap();
        let err = monitor.start_acquisition().await.unwrap_err();
        assert!(matches!(err, MonitorError::AlreadyRunning));

        monitor.stop_acquisition().await.unwrap();
        let err = monitor.stop_acquisition().await.unwrap_err();
        assert!(matches!(err, MonitorError::NotRunning));
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn running_pipeline_fills_history_with_laser_data() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = Monitor::new(test_config(tmp.path()));

        monitor.start_acquisition().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        monitor.stop_acquisition().await.unwrap();

        let records = monitor.history(1000);
        assert!(records.len() >= 5, "got {} records", records.len());
        // Simulated laser connects quickly at 200 Hz; the tail of the run
        // must carry its readings while disabled channels stay empty.
        let last = records.last().unwrap();
        assert!(last.availability.laser);
        assert!(last.laser.is_some());
        assert!(last.camera.is_none());
        assert!(last.cnc.is_none());
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn bridge_backed_run_stops_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.bridge.enabled = true;
        config.bridge.program = "sh".to_string();
        config.bridge.args = vec!["-c".to_string(), "cat >/dev/null".to_string()];
        config.bridge.terminate_timeout = Duration::from_secs(2);
        let monitor = Monitor::new(config);

        monitor.start_acquisition().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop_acquisition().await.unwrap();

        // The child held stdin open; stop must still have torn it down.
        assert_eq!(
            monitor.status().await.acquisition,
            AcquisitionState::Stopped
        );
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn status_reflects_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = Monitor::new(test_config(tmp.path()));
        assert_eq!(monitor.status().await.acquisition, AcquisitionState::Idle);

        monitor.start_acquisition().await.unwrap();
        assert_eq!(monitor.status().await.acquisition, AcquisitionState::Running);

        monitor.stop_acquisition().await.unwrap();
        assert_eq!(monitor.status().await.acquisition, AcquisitionState::Stopped);
        monitor.shutdown().await;
    }
}
