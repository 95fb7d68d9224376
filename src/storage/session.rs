//! On-disk save session: folder layout, rotating CSV, image snapshots.

use crate::config::StorageConfig;
use crate::error::{AppResult, MonitorError};
use crate::record::AggregatedRecord;
use chrono::Local;
use serde::Serialize;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Flat CSV row, one per aggregated record. `None` serializes as an
/// empty cell.
#[derive(Debug, Serialize)]
pub struct CsvRow {
    timestamp: String,
    elapsed_secs: f64,
    curpos_x: Option<f64>,
    curpos_y: Option<f64>,
    curpos_z: Option<f64>,
    curpos_a: Option<f64>,
    curpos_c: Option<f64>,
    feed_rate: Option<f64>,
    melt_pool_temp_c: Option<f64>,
    one_color_temp_c: Option<f64>,
    two_color_temp_c: Option<f64>,
    melt_pool_area_mm2: Option<f64>,
    out_power_w: Option<f64>,
    set_power_w: Option<f64>,
}

impl CsvRow {
    /// Flatten a record for persistence.
    pub fn from_record(record: &AggregatedRecord) -> Self {
        let cnc = record.cnc.as_ref();
        let pyro = record.pyrometer.as_ref();
        let laser = record.laser.as_ref();
        Self {
            timestamp: record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            elapsed_secs: record.elapsed_secs,
            curpos_x: cnc.and_then(|c| c.x),
            curpos_y: cnc.and_then(|c| c.y),
            curpos_z: cnc.and_then(|c| c.z),
            curpos_a: cnc.and_then(|c| c.a),
            curpos_c: cnc.and_then(|c| c.c),
            feed_rate: cnc.and_then(|c| c.feed_rate),
            melt_pool_temp_c: pyro.and_then(|p| p.melt_pool_temp_c),
            one_color_temp_c: pyro.and_then(|p| p.one_color_temp_c),
            two_color_temp_c: pyro.and_then(|p| p.two_color_temp_c),
            melt_pool_area_mm2: record.camera.as_ref().and_then(|c| c.melt_pool_area_mm2),
            out_power_w: laser.and_then(|l| l.out_power_w),
            set_power_w: laser.and_then(|l| l.set_power_w),
        }
    }
}

/// Counters reported when a session closes.
#[derive(Clone, Debug, Serialize)]
pub struct SaveSummary {
    /// Session folder path.
    pub folder: String,
    /// CSV rows written across all rotation files.
    pub rows: u64,
    /// CSV files opened (initial plus rotations).
    pub files: u32,
    /// Melt-pool snapshots written.
    pub meltpool_images: u64,
    /// Auxiliary snapshots written.
    pub aux_images: u64,
}

/// A live save session writing to `<base>/<name>_<YYYYmmdd_HHMMSS>/`.
///
/// Each rotation interval a fresh CSV file is opened; every file carries
/// exactly one header. Melt-pool frames are written only while the laser
/// output power exceeds the configured threshold; auxiliary frames are
/// rate-limited to one per snapshot interval.
pub struct SaveSession {
    dir: PathBuf,
    meltpool_dir: PathBuf,
    aux_dir: PathBuf,
    writer: csv::Writer<File>,
    file_opened_at: Instant,
    rotation: Duration,
    power_threshold_w: f64,
    aux_interval: Duration,
    last_aux: Option<Instant>,
    rows: u64,
    files: u32,
    meltpool_seq: u64,
    aux_count: u64,
}

impl SaveSession {
    /// Create the session folder tree and open the first CSV file.
    pub fn begin(name: &str, config: &StorageConfig) -> AppResult<Self> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let dir = config.base_dir.join(format!("{name}_{stamp}"));
        let meltpool_dir = dir.join("meltpool_images");
        let aux_dir = dir.join("captures_aux");
        fs::create_dir_all(&meltpool_dir)?;
        fs::create_dir_all(&aux_dir)?;

        let writer = Self::open_csv(&dir)?;
        info!(folder = %dir.display(), "save session started");
        Ok(Self {
            dir,
            meltpool_dir,
            aux_dir,
            writer,
            file_opened_at: Instant::now(),
            rotation: config.rotation_interval,
            power_threshold_w: config.power_threshold_w,
            aux_interval: config.aux_snapshot_interval,
            last_aux: None,
            rows: 0,
            files: 1,
            meltpool_seq: 0,
            aux_count: 0,
        })
    }

    fn open_csv(dir: &Path) -> AppResult<csv::Writer<File>> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        let path = dir.join(format!("records_{stamp}.csv"));
        let file = File::create(&path)?;
        debug!(file = %path.display(), "opened csv file");
        Ok(csv::Writer::from_writer(file))
    }

    /// Append one record, rotating the CSV file when the interval expires.
    pub fn append(&mut self, record: &AggregatedRecord) -> AppResult<()> {
        if self.file_opened_at.elapsed() >= self.rotation {
            self.writer.flush()?;
            self.writer = Self::open_csv(&self.dir)?;
            self.file_opened_at = Instant::now();
            self.files += 1;
        }
        self.writer.serialize(CsvRow::from_record(record))?;
        self.rows += 1;
        self.write_snapshots(record)?;
        Ok(())
    }

    fn write_snapshots(&mut self, record: &AggregatedRecord) -> AppResult<()> {
        // Melt-pool frames only matter while the laser is actually firing.
        if record.out_power_w().unwrap_or(0.0) > self.power_threshold_w {
            if let Some(frame) = record.camera.as_ref().and_then(|c| c.frame.as_ref()) {
                let stamp = record.timestamp.format("%Y%m%d_%H%M%S_%3f");
                let path = self
                    .meltpool_dir
                    .join(format!("meltpool_{:05}_{stamp}.png", self.meltpool_seq));
                fs::write(&path, &frame.data)?;
                self.meltpool_seq += 1;
            }
        }

        if let Some(frame) = record
            .aux_camera
            .as_ref()
            .and_then(|a| a.combined_frame.as_ref())
        {
            let due = match self.last_aux {
                Some(last) => last.elapsed() >= self.aux_interval,
                None => true,
            };
            if due {
                let stamp = record.timestamp.format("%Y%m%d_%H%M%S");
                let path = self.aux_dir.join(format!("aux_combined_{stamp}.png"));
                fs::write(&path, &frame.data)?;
                self.last_aux = Some(Instant::now());
                self.aux_count += 1;
            }
        }
        Ok(())
    }

    /// Session folder path.
    pub fn folder(&self) -> &Path {
        &self.dir
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// CSV files opened so far.
    pub fn files(&self) -> u32 {
        self.files
    }

    /// Flush and close, returning the final counters.
    pub fn close(mut self) -> AppResult<SaveSummary> {
        self.writer.flush()?;
        let summary = SaveSummary {
            folder: self.dir.display().to_string(),
            rows: self.rows,
            files: self.files,
            meltpool_images: self.meltpool_seq,
            aux_images: self.aux_count,
        };
        info!(
            folder = %summary.folder,
            rows = summary.rows,
            files = summary.files,
            "save session closed"
        );
        Ok(summary)
    }
}

/// Write a one-shot CSV dump of `records` into a fresh permanent folder.
///
/// Used when a temporary capture is promoted.
pub fn dump_records(
    name: &str,
    records: &[AggregatedRecord],
    config: &StorageConfig,
) -> AppResult<PathBuf> {
    if records.is_empty() {
        return Err(MonitorError::EmptyCapture(name.to_owned()));
    }
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let dir = config.base_dir.join(format!("{name}_{stamp}"));
    fs::create_dir_all(&dir)?;
    let path = dir.join("records.csv");
    let mut writer = csv::Writer::from_writer(File::create(&path)?);
    for record in records {
        writer.serialize(CsvRow::from_record(record))?;
    }
    writer.flush()?;
    info!(folder = %dir.display(), rows = records.len(), "capture promoted");
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CncReading, LaserReading};
    use chrono::Local;

    fn test_config(base: &Path) -> StorageConfig {
        StorageConfig {
            base_dir: base.to_path_buf(),
            rotation_interval: Duration::from_secs(3600),
            power_threshold_w: 10.0,
            aux_snapshot_interval: Duration::from_secs(1),
            capture_ttl: Duration::from_secs(1800),
            capture_capacity: 1000,
        }
    }

    fn record_with_laser(power: f64) -> AggregatedRecord {
        AggregatedRecord::new(
            Local::now(),
            0.0,
            0,
            None,
            Some(CncReading {
                x: Some(1.0),
                y: Some(2.0),
                z: Some(3.0),
                a: Some(0.0),
                c: Some(0.0),
                feed_rate: Some(120.0),
                feed_override: None,
                rapid_override: None,
            }),
            Some(LaserReading {
                out_power_w: Some(power),
                set_power_w: Some(500.0),
            }),
            None,
            None,
        )
    }

    #[test]
    fn session_creates_folder_tree_and_writes_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let mut session = SaveSession::begin("build42", &config).unwrap();
        session.append(&record_with_laser(0.0)).unwrap();
        session.append(&record_with_laser(400.0)).unwrap();
        let folder = session.folder().to_path_buf();
        let summary = session.close().unwrap();

        assert_eq!(summary.rows, 2);
        assert_eq!(summary.files, 1);
        assert!(folder.join("meltpool_images").is_dir());
        assert!(folder.join("captures_aux").is_dir());

        let csv_files: Vec<_> = fs::read_dir(&folder)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "csv"))
            .collect();
        assert_eq!(csv_files.len(), 1);
        let text = fs::read_to_string(csv_files[0].path()).unwrap();
        let headers = text.lines().filter(|l| l.starts_with("timestamp")).count();
        assert_eq!(headers, 1);
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("curpos_x"));
    }

    #[test]
    fn rotation_opens_a_second_file_with_its_own_header() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.rotation_interval = Duration::from_millis(0);
        let mut session = SaveSession::begin("rotate", &config).unwrap();
        session.append(&record_with_laser(0.0)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        session.append(&record_with_laser(0.0)).unwrap();
        let folder = session.folder().to_path_buf();
        let summary = session.close().unwrap();

        assert!(summary.files >= 2);
        let csv_files: Vec<_> = fs::read_dir(&folder)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "csv"))
            .collect();
        assert!(csv_files.len() >= 2);
        for entry in csv_files {
            let text = fs::read_to_string(entry.path()).unwrap();
            if text.is_empty() {
                continue;
            }
            let headers = text.lines().filter(|l| l.starts_with("timestamp")).count();
            assert_eq!(headers, 1, "each file carries exactly one header");
        }
    }

    #[test]
    fn dump_rejects_empty_capture() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let err = dump_records("empty", &[], &config).unwrap_err();
        assert!(matches!(err, MonitorError::EmptyCapture(_)));
    }

    #[test]
    fn dump_writes_permanent_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let records = vec![record_with_laser(0.0), record_with_laser(1.0)];
        let dir = dump_records("promoted", &records, &config).unwrap();
        let text = fs::read_to_string(dir.join("records.csv")).unwrap();
        assert_eq!(text.lines().count(), 3);
    }
}
