//! Fixed-rate merge loop.
//!
//! The aggregator is the master loop of the pipeline. While running, every
//! tick period it performs a non-blocking snapshot read of every channel
//! store (or the bridge), merges the results into exactly one
//! [`AggregatedRecord`], appends it to the bounded in-memory history, and
//! hands it off to persistence and broadcast through bounded queues with
//! `try_send`. The tick loop never awaits per-instrument I/O and never
//! performs disk or network writes inline; a full hand-off queue drops that
//! record for that consumer and counts the drop.
//!
//! A missing instrument contributes a `None` field, never a skipped tick:
//! the record count equals the tick count even with zero instruments
//! available.

use crate::bridge::BridgeHandle;
use crate::record::{
    AggregatedRecord, AuxCameraReading, CameraReading, ChannelKind, CncReading, LaserReading,
    PyrometerReading,
};
use crate::store::{FrameRing, LatestStore};
use crate::task::TaskHandle;
use chrono::Local;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Where CNC readings come from: an in-process worker store, the
/// cross-process bridge, or nowhere at all.
#[derive(Clone)]
pub enum CncSource {
    /// In-process sampling worker writes a normal channel store.
    Store(Arc<LatestStore<CncReading>>),
    /// Readings arrive through the cross-process bridge.
    Bridge(BridgeHandle),
    /// Channel disabled by configuration.
    Disabled,
}

impl CncSource {
    fn latest(&self) -> Option<CncReading> {
        match self {
            CncSource::Store(store) => store.latest(),
            CncSource::Bridge(handle) => handle.latest(),
            CncSource::Disabled => None,
        }
    }

    fn is_available(&self) -> bool {
        match self {
            CncSource::Store(store) => store.is_available(),
            CncSource::Bridge(handle) => handle.is_up(),
            CncSource::Disabled => false,
        }
    }
}

/// The full set of per-instrument hand-off points the aggregator reads.
///
/// One typed field per channel kind; the aggregator is the only reader.
/// Clones share the underlying stores.
#[derive(Clone)]
pub struct Channels {
    /// Melt-pool camera store.
    pub camera: Arc<LatestStore<CameraReading>>,
    /// CNC source (store, bridge, or disabled).
    pub cnc: CncSource,
    /// Laser store.
    pub laser: Arc<LatestStore<LaserReading>>,
    /// Pyrometer store.
    pub pyrometer: Arc<LatestStore<PyrometerReading>>,
    /// Auxiliary camera frame ring.
    pub aux_camera: Arc<FrameRing<AuxCameraReading>>,
}

impl Channels {
    /// Per-instrument connection flags as published by the workers.
    pub fn connection_status(&self) -> BTreeMap<&'static str, bool> {
        BTreeMap::from([
            (ChannelKind::Camera.name(), self.camera.is_available()),
            (ChannelKind::Cnc.name(), self.cnc.is_available()),
            (ChannelKind::Laser.name(), self.laser.is_available()),
            (ChannelKind::Pyrometer.name(), self.pyrometer.is_available()),
            (ChannelKind::AuxCamera.name(), self.aux_camera.is_available()),
        ])
    }
}

/// Acquisition lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    /// Never started.
    Idle,
    /// Tick loop active.
    Running,
    /// Started and later stopped.
    Stopped,
}

/// Bounded in-memory record history, drop-oldest at capacity.
///
/// Appended to only by the aggregator; queries take snapshots.
pub struct History {
    inner: Mutex<VecDeque<AggregatedRecord>>,
    capacity: usize,
}

impl History {
    /// Create a history retaining at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    /// Append one record, evicting the oldest at capacity.
    pub fn append(&self, record: AggregatedRecord) {
        let mut inner = self.lock();
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(record);
    }

    /// Clone of the most recent record.
    pub fn latest(&self) -> Option<AggregatedRecord> {
        self.lock().back().cloned()
    }

    /// The most recent `limit` records, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<AggregatedRecord> {
        let inner = self.lock();
        let skip = inner.len().saturating_sub(limit);
        inner.iter().skip(skip).cloned().collect()
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no record has been produced yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AggregatedRecord>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The fixed-rate merge loop.
pub struct Aggregator;

impl Aggregator {
    /// Spawn the tick loop.
    ///
    /// `storage_tx` and `broadcast_tx` are the non-blocking hand-off queues
    /// toward the persistence task and the fan-out forwarder.
    pub fn spawn(
        period: Duration,
        channels: Channels,
        history: Arc<History>,
        storage_tx: mpsc::Sender<AggregatedRecord>,
        broadcast_tx: mpsc::Sender<AggregatedRecord>,
    ) -> TaskHandle {
        TaskHandle::spawn("aggregator", move |mut stop| async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(period);
            // A restarted run continues the stored stream; ticks stay
            // monotonic across the history the runs share.
            let mut tick: u64 = history.latest().map(|r| r.tick + 1).unwrap_or(0);
            let mut storage_drops: u64 = 0;
            let mut broadcast_drops: u64 = 0;

            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = ticker.tick() => {}
                }

                let record = Self::merge(&channels, started.elapsed().as_secs_f64(), tick);
                tick += 1;
                history.append(record.clone());

                // Hand-off must never block the next tick. A full queue
                // means the consumer is behind; the record is dropped for
                // that consumer only.
                if storage_tx.try_send(record.clone()).is_err() {
                    storage_drops += 1;
                    if storage_drops % 100 == 1 {
                        debug!(drops = storage_drops, "persistence hand-off queue full");
                    }
                }
                if broadcast_tx.try_send(record).is_err() {
                    broadcast_drops += 1;
                    if broadcast_drops % 100 == 1 {
                        debug!(drops = broadcast_drops, "broadcast hand-off queue full");
                    }
                }
            }

            info!(
                ticks = tick,
                storage_drops, broadcast_drops, "aggregator stopped"
            );
        })
    }

    /// Non-blocking snapshot of every channel, merged into one record.
    fn merge(channels: &Channels, elapsed_secs: f64, tick: u64) -> AggregatedRecord {
        AggregatedRecord::new(
            Local::now(),
            elapsed_secs,
            tick,
            channels.camera.latest(),
            channels.cnc.latest(),
            channels.laser.latest(),
            channels.pyrometer.latest(),
            channels.aux_camera.peek_last(),
        )
    }
}
