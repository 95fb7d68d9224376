//! Wire events pushed to connected clients.

use crate::aggregator::AcquisitionState;
use crate::record::AggregatedRecord;
use crate::storage::SaveStatus;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One line-delimited JSON event, tagged by `type`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// First event on every connection, carrying the assigned client id.
    Connection {
        /// Id assigned to the subscriber.
        client_id: Uuid,
        /// Emission time.
        timestamp: DateTime<Local>,
    },
    /// One aggregated record.
    #[serde(rename = "data")]
    SensorData {
        /// Emission time.
        timestamp: DateTime<Local>,
        /// The record, frames omitted.
        record: AggregatedRecord,
    },
    /// Periodic system status.
    #[serde(rename = "status")]
    StatusUpdate {
        /// Emission time.
        timestamp: DateTime<Local>,
        /// Acquisition lifecycle state.
        acquisition: AcquisitionState,
        /// Per-instrument connection flags.
        instruments: BTreeMap<&'static str, bool>,
        /// Connected subscriber count.
        clients: usize,
    },
    /// Persistence state change or periodic refresh.
    SaveStatus {
        /// Emission time.
        timestamp: DateTime<Local>,
        /// Current persistence state.
        status: SaveStatus,
    },
    /// Keep-alive.
    Ping {
        /// Emission time.
        timestamp: DateTime<Local>,
    },
    /// Server-side problem worth telling clients about.
    Error {
        /// Emission time.
        timestamp: DateTime<Local>,
        /// Human-readable description.
        message: String,
    },
}

impl Event {
    /// Connection acknowledgement for `client_id`.
    pub fn connection(client_id: Uuid) -> Self {
        Event::Connection {
            client_id,
            timestamp: Local::now(),
        }
    }

    /// Wrap one record.
    pub fn sensor_data(record: AggregatedRecord) -> Self {
        Event::SensorData {
            timestamp: Local::now(),
            record,
        }
    }

    /// Current system status.
    pub fn status_update(
        acquisition: AcquisitionState,
        instruments: BTreeMap<&'static str, bool>,
        clients: usize,
    ) -> Self {
        Event::StatusUpdate {
            timestamp: Local::now(),
            acquisition,
            instruments,
            clients,
        }
    }

    /// Current persistence state.
    pub fn save_status(status: SaveStatus) -> Self {
        Event::SaveStatus {
            timestamp: Local::now(),
            status,
        }
    }

    /// Keep-alive.
    pub fn ping() -> Self {
        Event::Ping {
            timestamp: Local::now(),
        }
    }

    /// Error notification.
    pub fn error(message: impl Into<String>) -> Self {
        Event::Error {
            timestamp: Local::now(),
            message: message.into(),
        }
    }
}
