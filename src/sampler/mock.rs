//! Mock instrument readers.
//!
//! Used for the simulation mode (running the backend with no hardware on
//! the bench) and throughout the test suite. Simulated values stay inside
//! plausible process ranges so live viewers render sensible charts.

use super::InstrumentReader;
use crate::error::{AppResult, MonitorError};
use crate::record::{
    AuxCameraReading, CameraReading, CncReading, FrameBuffer, LaserReading, PyrometerReading,
};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Scripted reader: yields a fixed sequence, then repeats the last value.
///
/// The workhorse of the worker and aggregator tests; also usable as a
/// permanently unreachable instrument via [`ScriptedReader::unreachable`].
pub struct ScriptedReader<T> {
    values: Vec<T>,
    index: usize,
    reachable: bool,
    closed: Arc<AtomicBool>,
}

impl<T: Clone + Send + Sync + 'static> ScriptedReader<T> {
    /// Reader that opens successfully and replays `values`.
    pub fn new(values: Vec<T>) -> Self {
        Self {
            values,
            index: 0,
            reachable: true,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reader whose `open` always fails, modeling a device that is absent.
    pub fn unreachable() -> Self {
        Self {
            values: Vec::new(),
            index: 0,
            reachable: false,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that flips once `close` has been called.
    pub fn close_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> InstrumentReader for ScriptedReader<T> {
    type Reading = T;

    async fn open(&mut self) -> AppResult<()> {
        if self.reachable {
            Ok(())
        } else {
            Err(MonitorError::Instrument("device not present".into()))
        }
    }

    async fn read_one(&mut self) -> AppResult<Option<T>> {
        if self.values.is_empty() {
            return Ok(None);
        }
        let value = self.values[self.index.min(self.values.len() - 1)].clone();
        self.index += 1;
        Ok(Some(value))
    }

    fn is_connected(&self) -> bool {
        self.reachable
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn stub_frame(width: u32, height: u32) -> FrameBuffer {
    FrameBuffer {
        width,
        height,
        data: Bytes::from_static(b"\x89PNG\r\n\x1a\nmock-frame"),
    }
}

/// Simulated melt-pool camera.
pub struct MockCamera;

#[async_trait]
impl InstrumentReader for MockCamera {
    type Reading = CameraReading;

    async fn open(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn read_one(&mut self) -> AppResult<Option<CameraReading>> {
        let mut rng = rand::thread_rng();
        Ok(Some(CameraReading {
            melt_pool_area_mm2: Some(10.0 + 5.0 * rng.gen::<f64>()),
            frame: Some(stub_frame(640, 512)),
        }))
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Simulated CNC controller (in-process stand-in for the bridge).
pub struct MockCnc;

#[async_trait]
impl InstrumentReader for MockCnc {
    type Reading = CncReading;

    async fn open(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn read_one(&mut self) -> AppResult<Option<CncReading>> {
        let mut rng = rand::thread_rng();
        Ok(Some(CncReading {
            x: Some(10.0 + 5.0 * rng.gen::<f64>()),
            y: Some(20.0 + 5.0 * rng.gen::<f64>()),
            z: Some(5.0 + 2.0 * rng.gen::<f64>()),
            a: Some(0.0),
            c: Some(0.0),
            feed_rate: Some(1000.0),
            feed_override: Some(100.0),
            rapid_override: Some(100.0),
        }))
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Simulated laser power source.
pub struct MockLaser;

#[async_trait]
impl InstrumentReader for MockLaser {
    type Reading = LaserReading;

    async fn open(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn read_one(&mut self) -> AppResult<Option<LaserReading>> {
        let mut rng = rand::thread_rng();
        Ok(Some(LaserReading {
            out_power_w: Some(400.0 + 100.0 * rng.gen::<f64>()),
            set_power_w: Some(500.0),
        }))
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Simulated pyrometer.
pub struct MockPyrometer;

#[async_trait]
impl InstrumentReader for MockPyrometer {
    type Reading = PyrometerReading;

    async fn open(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn read_one(&mut self) -> AppResult<Option<PyrometerReading>> {
        let mut rng = rand::thread_rng();
        Ok(Some(PyrometerReading {
            melt_pool_temp_c: Some(1600.0 + 200.0 * rng.gen::<f64>()),
            one_color_temp_c: Some(1580.0 + 200.0 * rng.gen::<f64>()),
            two_color_temp_c: Some(1620.0 + 200.0 * rng.gen::<f64>()),
        }))
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Simulated auxiliary camera pair (already-combined frame).
pub struct MockAuxCamera;

#[async_trait]
impl InstrumentReader for MockAuxCamera {
    type Reading = AuxCameraReading;

    async fn open(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn read_one(&mut self) -> AppResult<Option<AuxCameraReading>> {
        Ok(Some(AuxCameraReading {
            combined_frame: Some(stub_frame(2 * 1280, 1024)),
        }))
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}
