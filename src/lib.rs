//! # DED Process Monitor Core Library
//!
//! Core library for the `ded-monitor` backend: multi-rate instrument
//! acquisition for directed-energy-deposition machines, merged at a fixed
//! tick into one record stream that feeds on-disk persistence and live
//! network fan-out.
//!
//! ## Crate Structure
//!
//! - **`aggregator`**: The fixed-tick merge loop, the bounded record
//!   history, and the per-channel hand-off wiring.
//! - **`bridge`**: Supervisor for the out-of-process CNC driver child and
//!   its line-delimited JSON output.
//! - **`config`**: Layered configuration (defaults, TOML file, environment)
//!   with validation.
//! - **`error`**: The `MonitorError` enum shared across the crate.
//! - **`monitor`**: The top-level supervisor tying acquisition, persistence,
//!   and fan-out together.
//! - **`net`**: Wire events, subscriber fan-out, and the TCP command
//!   server.
//! - **`record`**: Typed per-instrument readings and the aggregated record.
//! - **`sampler`**: Rate-limited per-instrument sampling workers and the
//!   simulated instruments.
//! - **`storage`**: The persistence task: rotating CSV sessions, image
//!   snapshots, and the temporary capture buffer.
//! - **`store`**: Bounded single-writer channel stores.
//! - **`task`**: Cooperative task lifecycle (spawn, stop, join).
//! - **`telemetry`**: Structured logging setup.

pub mod aggregator;
pub mod bridge;
pub mod config;
pub mod error;
pub mod monitor;
pub mod net;
pub mod record;
pub mod sampler;
pub mod storage;
pub mod store;
pub mod task;
pub mod telemetry;

pub use config::Config;
pub use error::{AppResult, MonitorError};
pub use monitor::Monitor;
