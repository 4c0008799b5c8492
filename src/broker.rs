//! FIFO buffer of pending work between the dispatcher and the worker pool.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::job::{JobId, WorkItem};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, item: WorkItem) -> Result<(), BrokerError>;

    /// Wait for the oldest pending item. Returns `None` once the broker is
    /// closed; items still pending at that point stay queued.
    async fn dequeue(&self) -> Option<WorkItem>;

    /// Drop a not-yet-dequeued item. Returns `false` if a worker already took
    /// it (or it was never enqueued).
    async fn remove_if_pending(&self, job_id: JobId) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting work and wake every waiting consumer.
    fn close(&self);
}

struct QueueState {
    items: VecDeque<WorkItem>,
    closed: bool,
}

/// In-process broker backed by a `VecDeque`.
pub struct MemoryBroker {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, item: WorkItem) -> Result<(), BrokerError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            debug!(job_id = %item.job_id, depth = state.items.len() + 1, "work item enqueued");
            state.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            // Register interest before checking so a concurrent enqueue
            // cannot slip between the check and the wait.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    async fn remove_if_pending(&self, job_id: JobId) -> bool {
        let mut state = self.lock();
        match state.items.iter().position(|item| item.job_id == job_id) {
            Some(index) => {
                state.items.remove(index);
                debug!(%job_id, "pending work item removed");
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }
}
