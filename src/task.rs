//! Uniform lifecycle handle for supervised loop tasks.
//!
//! Every long-running loop in the pipeline (sampling workers, the bridge
//! reader, the aggregator tick loop, the persistence task) is spawned as a
//! tokio task and handed back to its supervisor as a [`TaskHandle`]. The
//! supervisor can then treat them uniformly: request a cooperative stop,
//! then join with a bounded wait. Stop is observed by each loop at the top
//! of its next iteration; nothing is interrupted mid-read.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Cooperative stop signal shared with a loop task.
///
/// Loops `select!` on [`StopSignal::stopped`] against their sleep so a stop
/// request interrupts the sleep, never the work.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop is requested (immediately if it already was).
    pub async fn stopped(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // The sender lives inside the TaskHandle; if it is gone the task is
        // orphaned and should wind down too.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Handle to a supervised loop task: request stop, then join with a bound.
pub struct TaskHandle {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn a loop task, handing it a [`StopSignal`].
    pub fn spawn<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, rx) = watch::channel(false);
        let join = tokio::spawn(f(StopSignal { rx }));
        Self {
            name,
            stop_tx,
            join,
        }
    }

    /// Task name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request a cooperative stop without waiting.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Request a stop and wait up to `timeout` for the loop to exit.
    ///
    /// A task that misses the deadline is aborted; that is logged, not an
    /// error, since every loop's own cleanup runs before its final await.
    pub async fn shutdown(mut self, timeout: Duration) {
        self.stop();
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => warn!(task = self.name, error = %e, "task ended with panic"),
            Err(_) => {
                warn!(task = self.name, "task missed stop deadline, aborting");
                self.join.abort();
            }
        }
    }

    /// Whether the underlying task has already finished.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
