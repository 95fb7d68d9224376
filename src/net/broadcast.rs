//! Subscriber registry with serialize-once fan-out.
//!
//! Each subscriber gets a bounded outgoing queue. An event is serialized
//! exactly once and the resulting line is shared across subscribers. A
//! slow subscriber loses events (its queue fills); a dead one is pruned
//! on the next send. One subscriber can never stall another.

use super::event::Event;
use crate::error::AppResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Fan-out hub for wire events.
pub struct Broadcaster {
    clients: Mutex<HashMap<Uuid, mpsc::Sender<Arc<String>>>>,
    queue_capacity: usize,
}

impl Broadcaster {
    /// Create a hub whose per-subscriber queues hold `queue_capacity` lines.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a subscriber; returns its id and the outgoing line queue.
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<Arc<String>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.lock().insert(id, tx);
        debug!(client = %id, "subscriber connected");
        (id, rx)
    }

    /// Remove a subscriber. Removing twice, or an unknown id, is a no-op.
    pub fn unsubscribe(&self, id: Uuid) {
        if self.lock().remove(&id).is_some() {
            debug!(client = %id, "subscriber disconnected");
        }
    }

    /// Connected subscriber count.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Serialize `event` once and push the line to every subscriber.
    ///
    /// Full queues drop the event for that subscriber only; closed queues
    /// are pruned.
    pub fn broadcast(&self, event: &Event) -> AppResult<()> {
        let line = Arc::new(serde_json::to_string(event)?);
        let mut dead = Vec::new();
        {
            let clients = self.lock();
            for (id, tx) in clients.iter() {
                match tx.try_send(line.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(client = %id, "subscriber queue full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }
        for id in dead {
            self.unsubscribe(id);
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, mpsc::Sender<Arc<String>>>> {
        match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
