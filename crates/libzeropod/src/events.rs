//! Task events and the forwarder that drains them to the shim publisher.
//!
//! Everything that happens to a task is announced on a single process-wide
//! queue. Ordering on the queue is the ordering the publisher observes, so
//! code that needs "start before exit" guarantees only has to send in the
//! right order.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEvent {
    Start {
        container_id: String,
        pid: i32,
    },
    Exit {
        container_id: String,
        exec_id: String,
        pid: i32,
        exit_status: i32,
        exited_at: DateTime<Utc>,
    },
    Checkpointed {
        container_id: String,
    },
    Resumed {
        container_id: String,
    },
    Oom {
        container_id: String,
    },
}

impl TaskEvent {
    pub fn container_id(&self) -> &str {
        match self {
            TaskEvent::Start { container_id, .. }
            | TaskEvent::Exit { container_id, .. }
            | TaskEvent::Checkpointed { container_id }
            | TaskEvent::Resumed { container_id }
            | TaskEvent::Oom { container_id } => container_id,
        }
    }
}

/// Sink for task events, implemented by the shim transport.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: TaskEvent);
}

/// Decouples event producers from the publisher: producers send on a
/// channel, a single background thread forwards in order.
pub struct EventForwarder {
    tx: Sender<TaskEvent>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EventForwarder {
    pub fn spawn(publisher: Arc<dyn EventPublisher>) -> std::io::Result<Self> {
        let (tx, rx): (Sender<TaskEvent>, Receiver<TaskEvent>) = channel();
        let handle = thread::Builder::new()
            .name("event-forwarder".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    tracing::debug!(?event, "forwarding event");
                    publisher.publish(event);
                }
            })?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> Sender<TaskEvent> {
        self.tx.clone()
    }

    /// Waits until every queued event is delivered and the forwarder loop
    /// ended. Only returns once all handed-out senders are dropped.
    pub fn shutdown(mut self) {
        let (orphan, _) = channel();
        drop(std::mem::replace(&mut self.tx, orphan));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// dropping detaches the forwarder thread: senders handed out to the other
// subsystems keep the queue alive for as long as they need it
impl Drop for EventForwarder {
    fn drop(&mut self) {
        self.handle.take();
    }
}

/// Publisher collecting events in memory, for tests and the debug runner.
#[derive(Default, Clone)]
pub struct VecPublisher {
    events: Arc<Mutex<Vec<TaskEvent>>>,
}

impl VecPublisher {
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventPublisher for VecPublisher {
    fn publish(&self, event: TaskEvent) {
        self.events.lock().unwrap().push(event);
    }
}
