//! Message queues between the host and each worker.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::message::Message;

/// FIFO hand-off of [`Message`] batches across one thread boundary.
///
/// Producers and consumers are disjoint threads, so the mutex guards only
/// the list splice and contention stays minimal. A failure to splice (the
/// other side panicked mid-operation and poisoned the lock) latches a
/// diagnostic into the error slot; `status()` then reports the queue
/// unhealthy instead of the failure propagating as a panic.
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: Mutex<VecDeque<Message>>,
    error: Mutex<Option<String>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one message.
    pub fn enqueue(&self, message: Message) {
        match self.messages.lock() {
            Ok(mut guard) => guard.push_back(message),
            Err(_) => self.latch_error("enqueue on a poisoned queue"),
        }
    }

    /// Atomically appends a batch.
    pub fn enqueue_all(&self, batch: impl IntoIterator<Item = Message>) {
        match self.messages.lock() {
            Ok(mut guard) => guard.extend(batch),
            Err(_) => self.latch_error("batch enqueue on a poisoned queue"),
        }
    }

    /// Atomically removes and returns the entire current contents.
    pub fn accept_all(&self) -> Vec<Message> {
        match self.messages.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => {
                self.latch_error("drain of a poisoned queue");
                Vec::new()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first failure observed on this queue, if any.
    pub fn error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|guard| guard.clone())
    }

    fn latch_error(&self, context: &str) {
        if let Ok(mut slot) = self.error.lock() {
            if slot.is_none() {
                *slot = Some(context.to_string());
            }
        }
    }
}
