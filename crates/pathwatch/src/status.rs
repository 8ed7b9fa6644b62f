//! Point-in-time diagnostics for the watcher core.

use std::fmt;

use serde::Serialize;

use crate::logging::plural;

/// Health and queue telemetry of one worker.
#[derive(Debug, Default, Serialize)]
pub struct WorkerHealth {
    pub state: String,
    pub error: Option<String>,
    pub inbound_size: usize,
    pub inbound_error: Option<String>,
    pub outbound_size: usize,
    pub outbound_error: Option<String>,
}

/// Snapshot produced on demand by [`WatcherHub::status`].
///
/// [`WatcherHub::status`]: crate::hub::WatcherHub::status
#[derive(Debug, Default, Serialize)]
pub struct Status {
    pub polling: WorkerHealth,
}

fn health(error: &Option<String>) -> &str {
    error.as_deref().unwrap_or("ok")
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "WATCHER STATUS SUMMARY")?;
        writeln!(f, "* polling worker:")?;
        writeln!(f, "  - state: {}", self.polling.state)?;
        writeln!(f, "  - health: {}", health(&self.polling.error))?;
        writeln!(f, "  - in queue health: {}", health(&self.polling.inbound_error))?;
        writeln!(f, "  - {}", plural(self.polling.inbound_size, "in queue message"))?;
        writeln!(f, "  - out queue health: {}", health(&self.polling.outbound_error))?;
        write!(f, "  - {}", plural(self.polling.outbound_size, "out queue message"))
    }
}
