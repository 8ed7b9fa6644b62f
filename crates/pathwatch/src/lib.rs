//! Native core of a cross-platform filesystem watcher service.
//!
//! A host process submits [commands](message::CommandAction) to register
//! watch roots and receives an asynchronous stream of filesystem events
//! (created / modified / deleted / renamed, each tagged with an entry kind
//! and a channel id) plus one ack per command.
//!
//! ## Architecture
//!
//! Each worker thread exclusively owns its domain state. The host talks to
//! it through a pair of mutex-guarded message queues and a wake signal.
//! Messages are move-only, so ownership of their heap data is unambiguous
//! across the hand-off, and nothing else is shared beyond atomics for
//! health reads.
//!
//! The polling worker detects changes without OS notifications: it walks
//! every watched subtree on a schedule, metered by a global throttle
//! budget, and diffs each directory against the previous snapshot.
//!
//! ## Module Structure
//!
//! - `error` - crate error enum and `Result` alias
//! - `hub` - host-facing API: submit / poll / callback / status
//! - `logging` - thread-local, redirectable log sinks
//! - `message` - the move-only message model
//! - `polling` - polled roots and the polling worker
//! - `queue` - mutex-guarded message queues
//! - `status` - diagnostics snapshot
//! - `worker` - generic worker thread base

pub mod error;
pub mod hub;
pub mod logging;
pub mod message;
pub mod polling;
pub mod queue;
pub mod status;
pub mod worker;

pub use error::{Result, WatcherError};
pub use hub::WatcherHub;
pub use message::{
    AckPayload, ChannelId, CommandAction, CommandId, CommandPayload, EntryKind, EntryMetadata,
    FileSystemAction, FileSystemPayload, Message, NULL_CHANNEL_ID, NULL_COMMAND_ID,
};
pub use polling::{PolledRoot, PollingWorker, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_THROTTLE};
pub use queue::MessageQueue;
pub use status::{Status, WorkerHealth};
pub use worker::{CommandOutcome, OfflineCommandOutcome, Worker, WorkerState, WorkerStrategy};
