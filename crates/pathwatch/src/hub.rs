//! Host-facing surface: submit commands, poll messages, read status.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Result;
use crate::message::{CommandId, CommandPayload, Message, NULL_COMMAND_ID};
use crate::polling::PollingWorker;
use crate::status::Status;
use crate::worker::Worker;

/// The entry point a binding layer drives.
///
/// All operations are non-blocking from the caller's perspective: `submit`
/// enqueues and signals, `poll` drains whatever is ready, and `status`
/// reads shared telemetry without touching the worker thread.
pub struct WatcherHub {
    polling: Worker<PollingWorker>,
    next_command_id: AtomicU32,
}

impl WatcherHub {
    pub fn new() -> Self {
        Self {
            polling: Worker::new("polling worker", PollingWorker::new()),
            next_command_id: AtomicU32::new(1),
        }
    }

    /// Enqueues a batch of commands, assigning fresh ids to the ones
    /// submitted with [`NULL_COMMAND_ID`], and returns all ids in
    /// submission order. Each id is acknowledged exactly once through
    /// [`WatcherHub::poll`].
    pub fn submit(&self, commands: Vec<CommandPayload>) -> Result<Vec<CommandId>> {
        let mut ids = Vec::with_capacity(commands.len());
        let mut batch = Vec::with_capacity(commands.len());
        for mut command in commands {
            if command.id == NULL_COMMAND_ID {
                command.id = self.next_id();
            }
            ids.push(command.id);
            batch.push(Message::Command(command));
        }
        self.polling.send(batch)?;
        Ok(ids)
    }

    /// Drains the outbound queue: filesystem events and acks, in the order
    /// the worker published them.
    pub fn poll(&self) -> Vec<Message> {
        self.polling.take_outbound()
    }

    /// Registers the callback fired whenever new outbound messages are
    /// ready. The callback runs on the worker thread and should only
    /// schedule a `poll` on the host's own loop.
    pub fn set_main_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.polling.set_notifier(callback);
    }

    /// Snapshot of worker health and queue telemetry.
    pub fn status(&self) -> Status {
        Status {
            polling: self.polling.collect_status(),
        }
    }

    fn next_id(&self) -> CommandId {
        let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        if id == NULL_COMMAND_ID {
            // Wrapped around; the reserved id is never handed out.
            self.next_command_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }
}

impl Default for WatcherHub {
    fn default() -> Self {
        Self::new()
    }
}
