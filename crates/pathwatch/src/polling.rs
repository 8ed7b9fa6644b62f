//! Polling-mode watching.
//!
//! Drives change detection by walking each watched subtree on a schedule
//! and diffing the result against the previous snapshot. Used when the OS
//! provides no native notifications, or when the host asks for polling
//! explicitly.
//!
//! - `root` - per-channel snapshot, traversal cursor and diffing
//! - `worker` - the strategy scheduling roots under the throttle budget

mod root;
mod worker;

pub use root::PolledRoot;
pub use worker::{PollingWorker, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_THROTTLE};
