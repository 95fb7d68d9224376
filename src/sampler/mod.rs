//! Per-instrument sampling workers.
//!
//! One [`SamplingWorker`] runs per instrument. It owns the instrument's
//! read-collaborator (an [`InstrumentReader`]) and is the *only* writer of
//! that instrument's channel store. The loop is rate-limited to the
//! configured sampling frequency and tolerant of a disconnected or slow
//! device: read failures are logged and retried, a device that reports
//! "not connected" puts the worker into a fixed 500 ms back-off instead of
//! busy-polling.
//!
//! Cancellation is cooperative: a stop request interrupts the rate sleep,
//! never a read in flight, and the reader is closed before the task exits.

pub mod mock;

use crate::error::AppResult;
use crate::store::{FrameRing, LatestStore};
use crate::task::{StopSignal, TaskHandle};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fixed back-off while an instrument is unreachable.
const DISCONNECTED_BACKOFF: Duration = Duration::from_millis(500);

/// External read-collaborator contract for one instrument.
///
/// Implementations own the actual device protocol (serial framing, socket
/// commands, SDK calls); the pipeline only sees typed readings.
#[async_trait]
pub trait InstrumentReader: Send + 'static {
    /// Reading type this instrument produces.
    type Reading: Clone + Send + Sync + 'static;

    /// Open the device. Fails with a connection error once a bounded
    /// internal retry count is exhausted.
    async fn open(&mut self) -> AppResult<()>;

    /// Read one sample. `Ok(None)` means the device had nothing this
    /// cycle, which is normal, not an error.
    async fn read_one(&mut self) -> AppResult<Option<Self::Reading>>;

    /// Whether the device connection is currently believed healthy.
    fn is_connected(&self) -> bool;

    /// Release the device. Idempotent.
    async fn close(&mut self);
}

/// Destination a worker writes its readings into.
///
/// Both channel store variants qualify; the worker does not care which one
/// backs its instrument.
pub trait SampleSink<T>: Send + Sync {
    /// Store one reading. Must never block.
    fn accept(&self, value: T);
    /// Publish the worker's connection state.
    fn set_available(&self, available: bool);
}

impl<T: Clone + Send + Sync> SampleSink<T> for LatestStore<T> {
    fn accept(&self, value: T) {
        self.put(value);
    }
    fn set_available(&self, available: bool) {
        LatestStore::set_available(self, available);
    }
}

impl<T: Clone + Send + Sync> SampleSink<T> for FrameRing<T> {
    fn accept(&self, value: T) {
        self.push(value);
    }
    fn set_available(&self, available: bool) {
        FrameRing::set_available(self, available);
    }
}

/// Rate-limited sampling loop for one instrument.
pub struct SamplingWorker;

impl SamplingWorker {
    /// Spawn the worker task for `name`, polling `reader` at `rate_hz` and
    /// writing into `sink`.
    pub fn spawn<R>(
        name: &'static str,
        rate_hz: f64,
        mut reader: R,
        sink: Arc<dyn SampleSink<R::Reading>>,
    ) -> TaskHandle
    where
        R: InstrumentReader,
    {
        let period = Duration::from_secs_f64(1.0 / rate_hz.max(f64::EPSILON));
        TaskHandle::spawn(name, move |stop| async move {
            Self::run(name, period, &mut reader, sink.as_ref(), stop).await;
        })
    }

    async fn run<R>(
        name: &'static str,
        period: Duration,
        reader: &mut R,
        sink: &dyn SampleSink<R::Reading>,
        mut stop: StopSignal,
    ) where
        R: InstrumentReader,
    {
        let mut opened = false;
        loop {
            if stop.is_stopped() {
                break;
            }
            let loop_start = Instant::now();

            if !opened {
                match reader.open().await {
                    Ok(()) => {
                        opened = true;
                        sink.set_available(true);
                        info!(instrument = name, "instrument connected");
                    }
                    Err(e) => {
                        sink.set_available(false);
                        debug!(instrument = name, error = %e, "instrument unreachable, backing off");
                        tokio::select! {
                            _ = stop.stopped() => break,
                            _ = tokio::time::sleep(DISCONNECTED_BACKOFF) => {}
                        }
                        continue;
                    }
                }
            }

            match reader.read_one().await {
                Ok(Some(reading)) => sink.accept(reading),
                Ok(None) => {}
                Err(e) => {
                    warn!(instrument = name, error = %e, "sample read failed");
                    if !reader.is_connected() {
                        opened = false;
                        sink.set_available(false);
                        continue;
                    }
                }
            }

            let sleep_for = period.saturating_sub(loop_start.elapsed());
            tokio::select! {
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        reader.close().await;
        sink.set_available(false);
        info!(instrument = name, "sampling worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedReader;
    use super::*;
    use crate::store::LatestStore;

    #[tokio::test]
    async fn worker_writes_samples_into_store() {
        let store = Arc::new(LatestStore::new(16));
        let reader = ScriptedReader::new(vec![1u32, 2, 3]);
        let handle = SamplingWorker::spawn("scripted", 200.0, reader, store.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown(Duration::from_secs(1)).await;

        // The script repeats its last value once exhausted; the newest
        // observation is always the final scripted value.
        assert_eq!(store.latest(), Some(3));
        assert!(!store.is_available(), "flag cleared after close");
    }

    #[tokio::test]
    async fn disconnected_reader_backs_off_and_store_stays_empty() {
        let store: Arc<LatestStore<u32>> = Arc::new(LatestStore::new(4));
        let reader = ScriptedReader::<u32>::unreachable();
        let handle = SamplingWorker::spawn("dead", 100.0, reader, store.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.latest(), None);
        assert!(!store.is_available());
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_closes_reader_promptly() {
        let store = Arc::new(LatestStore::new(4));
        let reader = ScriptedReader::new(vec![7u32]);
        let closed = reader.close_flag();
        let handle = SamplingWorker::spawn("closing", 50.0, reader, store);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let start = Instant::now();
        handle.shutdown(Duration::from_secs(2)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
