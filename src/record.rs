//! Core data model: per-instrument readings and the merged record.
//!
//! Each instrument kind gets its own typed sub-record instead of an untyped
//! key/value map, so a missing instrument is an explicit `None` field and two
//! instruments can never silently overwrite each other's keys during a merge.
//!
//! An [`AggregatedRecord`] is produced exactly once per aggregator tick and is
//! immutable after construction. Image payloads are carried in-process (for
//! the snapshot policies) but skipped on the wire; subscribers only see the
//! derived availability flags, matching what live viewers actually consume.

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Instrument kinds known to the pipeline.
///
/// One channel = one physical source plus its sampling worker and store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Melt-pool thermal/vision camera.
    Camera,
    /// CNC positioning controller (may run behind the cross-process bridge).
    Cnc,
    /// Laser power source.
    Laser,
    /// Non-contact pyrometer.
    Pyrometer,
    /// Auxiliary imaging cameras (combined view of the pair).
    AuxCamera,
}

impl ChannelKind {
    /// All channel kinds in merge order.
    pub const ALL: [ChannelKind; 5] = [
        ChannelKind::Camera,
        ChannelKind::Cnc,
        ChannelKind::Laser,
        ChannelKind::Pyrometer,
        ChannelKind::AuxCamera,
    ];

    /// Stable lowercase name used in logs, status maps, and config keys.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Camera => "camera",
            ChannelKind::Cnc => "cnc",
            ChannelKind::Laser => "laser",
            ChannelKind::Pyrometer => "pyrometer",
            ChannelKind::AuxCamera => "aux_camera",
        }
    }
}

/// Opaque, already-encoded image payload produced by a camera decode layer.
///
/// The pipeline never inspects pixels; it only moves the buffer to disk when
/// a snapshot policy fires. Cloning is cheap (`Bytes` is reference-counted).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Encoded image bytes (PNG from the decode layer).
    pub data: Bytes,
}

/// Melt-pool camera reading.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CameraReading {
    /// Measured melt-pool area in mm².
    pub melt_pool_area_mm2: Option<f64>,
    /// Latest frame; in-process only, never serialized to the wire.
    #[serde(skip)]
    pub frame: Option<FrameBuffer>,
}

/// CNC positioning controller reading.
///
/// Field names double as the bridge wire keys (`curpos_x` etc.), so a bridge
/// line deserializes straight into this struct.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CncReading {
    /// X axis position.
    #[serde(rename = "curpos_x")]
    pub x: Option<f64>,
    /// Y axis position.
    #[serde(rename = "curpos_y")]
    pub y: Option<f64>,
    /// Z axis position.
    #[serde(rename = "curpos_z")]
    pub z: Option<f64>,
    /// A axis position.
    #[serde(rename = "curpos_a")]
    pub a: Option<f64>,
    /// C axis position.
    #[serde(rename = "curpos_c")]
    pub c: Option<f64>,
    /// Programmed feed rate.
    #[serde(default)]
    pub feed_rate: Option<f64>,
    /// Feed override percentage.
    #[serde(default)]
    pub feed_override: Option<f64>,
    /// Rapid override percentage.
    #[serde(default)]
    pub rapid_override: Option<f64>,
}

/// Laser power source reading.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LaserReading {
    /// Measured output power in watts.
    pub out_power_w: Option<f64>,
    /// Commanded set power in watts.
    pub set_power_w: Option<f64>,
}

/// Pyrometer reading (three temperature channels).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PyrometerReading {
    /// Melt-pool temperature in °C.
    pub melt_pool_temp_c: Option<f64>,
    /// One-color temperature in °C.
    pub one_color_temp_c: Option<f64>,
    /// Two-color temperature in °C.
    pub two_color_temp_c: Option<f64>,
}

/// Combined auxiliary camera reading.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuxCameraReading {
    /// Side-by-side combined frame from the auxiliary pair; in-process only.
    #[serde(skip)]
    pub combined_frame: Option<FrameBuffer>,
}

/// Derived per-instrument availability flags for one record.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Availability {
    /// Camera sub-record present.
    pub camera: bool,
    /// CNC sub-record present.
    pub cnc: bool,
    /// Laser sub-record present.
    pub laser: bool,
    /// Pyrometer sub-record present.
    pub pyrometer: bool,
    /// Aux camera sub-record present.
    pub aux_camera: bool,
    /// A camera frame is attached to this record.
    pub camera_frame: bool,
    /// An aux combined frame is attached to this record.
    pub aux_frame: bool,
}

/// One merged, time-stamped snapshot across all instruments.
///
/// Created once per aggregator tick; a missing instrument contributes a
/// `None` field, never a skipped tick.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregatedRecord {
    /// Wall-clock timestamp at tick time.
    pub timestamp: DateTime<Local>,
    /// Monotonic seconds since acquisition start.
    pub elapsed_secs: f64,
    /// Monotonic tick index since acquisition start.
    pub tick: u64,
    /// Latest camera reading, if any has ever arrived.
    pub camera: Option<CameraReading>,
    /// Latest CNC reading, if any has ever arrived.
    pub cnc: Option<CncReading>,
    /// Latest laser reading, if any has ever arrived.
    pub laser: Option<LaserReading>,
    /// Latest pyrometer reading, if any has ever arrived.
    pub pyrometer: Option<PyrometerReading>,
    /// Latest combined aux camera reading, if any has ever arrived.
    pub aux_camera: Option<AuxCameraReading>,
    /// Derived availability flags.
    pub availability: Availability,
}

impl AggregatedRecord {
    /// Build a record from the per-channel snapshot reads of one tick,
    /// deriving the availability flags.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamp: DateTime<Local>,
        elapsed_secs: f64,
        tick: u64,
        camera: Option<CameraReading>,
        cnc: Option<CncReading>,
        laser: Option<LaserReading>,
        pyrometer: Option<PyrometerReading>,
        aux_camera: Option<AuxCameraReading>,
    ) -> Self {
        let availability = Availability {
            camera: camera.is_some(),
            cnc: cnc.is_some(),
            laser: laser.is_some(),
            pyrometer: pyrometer.is_some(),
            aux_camera: aux_camera.is_some(),
            camera_frame: camera.as_ref().is_some_and(|c| c.frame.is_some()),
            aux_frame: aux_camera
                .as_ref()
                .is_some_and(|a| a.combined_frame.is_some()),
        };
        Self {
            timestamp,
            elapsed_secs,
            tick,
            camera,
            cnc,
            laser,
            pyrometer,
            aux_camera,
            availability,
        }
    }

    /// Laser output power, used by the melt-pool snapshot gate.
    pub fn out_power_w(&self) -> Option<f64> {
        self.laser.as_ref().and_then(|l| l.out_power_w)
    }
}
