//! Cross-process bridge for the CNC driver.
//!
//! The CNC vendor library requires a 32-bit host and cannot be loaded into
//! this process, so the driver runs as a supervised child process that
//! prints one self-contained JSON message per stdout line. The bridge
//! launches and supervises that child, consumes its output line by line,
//! and exposes the latest decoded message with the same non-blocking
//! "latest value" contract as a channel store.
//!
//! Line handling is an explicit parse result, not exception plumbing: every
//! line is classified as [`LineOutcome::Parsed`] or
//! [`LineOutcome::Malformed`], and a malformed line is logged and skipped
//! without terminating the reader. When the child exits, the bridge marks
//! itself down; the aggregator sees channel unavailability, never a
//! pipeline error.

use crate::config::BridgeConfig;
use crate::error::{AppResult, MonitorError};
use crate::record::CncReading;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Classification of one child stdout line.
#[derive(Debug)]
pub enum LineOutcome {
    /// The line carried one decodable message.
    Parsed(CncReading),
    /// The line was not a valid message; it is skipped.
    Malformed,
}

/// Decode one stdout line from the driver child.
pub fn decode_line(line: &str) -> LineOutcome {
    match serde_json::from_str::<CncReading>(line.trim()) {
        Ok(reading) => LineOutcome::Parsed(reading),
        Err(_) => LineOutcome::Malformed,
    }
}

#[derive(Default)]
struct Shared {
    latest: Mutex<Option<CncReading>>,
    up: AtomicBool,
}

/// Read-side handle to the bridge, given to the aggregator.
///
/// Mirrors the channel-store contract: `latest` never blocks and absence is
/// a normal state.
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
}

impl BridgeHandle {
    /// Most recent decoded message, if any has ever arrived.
    pub fn latest(&self) -> Option<CncReading> {
        match self.shared.latest.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether the child process is believed alive.
    pub fn is_up(&self) -> bool {
        self.shared.up.load(Ordering::Acquire)
    }
}

/// Supervisor for the driver child process and its stdout reader.
pub struct Bridge {
    config: BridgeConfig,
    shared: Arc<Shared>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Create an unstarted bridge.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            child: None,
            stdin: None,
            reader: None,
        }
    }

    /// Read-side handle for the aggregator.
    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Launch the child and spawn its stdout reader loop.
    pub async fn start(&mut self) -> AppResult<()> {
        if self.child.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MonitorError::Bridge(format!(
                    "failed to launch '{}': {e}",
                    self.config.program
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MonitorError::Bridge("child stdout not captured".into()))?;
        self.stdin = child.stdin.take();

        self.shared.up.store(true, Ordering::Release);
        info!(program = %self.config.program, "bridge child launched");

        let shared = self.shared.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decode_line(&line) {
                        LineOutcome::Parsed(reading) => {
                            let mut guard = match shared.latest.lock() {
                                Ok(g) => g,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            *guard = Some(reading);
                        }
                        LineOutcome::Malformed => {
                            warn!(line = %truncate(&line), "skipping malformed bridge message");
                        }
                    },
                    // End of stream: the child exited.
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "bridge stdout read failed");
                        break;
                    }
                }
            }
            shared.up.store(false, Ordering::Release);
            warn!("bridge child output ended, channel marked down");
        }));

        self.child = Some(child);
        Ok(())
    }

    /// Graceful stop: close the child's stdin (the driver treats EOF as a
    /// terminate request), wait a bounded time, then force-kill.
    pub async fn stop(&mut self) {
        self.stdin.take(); // drop = EOF on the child's stdin

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(self.config.terminate_timeout, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "bridge child exited"),
                Ok(Err(e)) => warn!(error = %e, "waiting for bridge child failed"),
                Err(_) => {
                    warn!("bridge child missed terminate deadline, killing");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "failed to kill bridge child");
                    }
                }
            }
        }

        if let Some(reader) = self.reader.take() {
            // The reader exits on end-of-stream once the child is gone.
            let _ = tokio::time::timeout(self.config.terminate_timeout, reader).await;
        }
        self.shared.up.store(false, Ordering::Release);
    }
}

fn truncate(line: &str) -> &str {
    if line.len() <= 100 {
        line
    } else {
        line.get(..100).unwrap_or(line)
    }
}
