//! Message model shared between the host and the worker threads.
//!
//! A [`Message`] is exactly one of three payloads: a filesystem event, a
//! command, or an acknowledgement. Payloads own their heap data and none of
//! them implement `Clone`; once a message is enqueued the sender has moved
//! it away, so there is never a question of who frees the strings inside.

use std::fmt;
use std::fs::Metadata;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Host-assigned identifier for one watch subscription.
pub type ChannelId = u32;

/// Reserved "no channel" value.
pub const NULL_CHANNEL_ID: ChannelId = 0;

/// Host-assigned identifier correlating an ack with its command.
pub type CommandId = u32;

/// Reserved "no command" value; the hub assigns a real id on submit.
pub const NULL_COMMAND_ID: CommandId = 0;

/// What kind of entry an event refers to. `Unknown` is used when the kind
/// cannot be determined any more, e.g. for an entry that is already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Unknown,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Unknown => "unknown",
        }
    }

    /// Whether two kinds are known to disagree. `Unknown` never conflicts
    /// with anything.
    pub fn conflicts_with(self, other: EntryKind) -> bool {
        self != EntryKind::Unknown && other != EntryKind::Unknown && self != other
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSystemAction {
    Created,
    Deleted,
    Modified,
    Renamed,
}

impl FileSystemAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::Modified => "modified",
            Self::Renamed => "renamed",
        }
    }
}

impl fmt::Display for FileSystemAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes recorded per snapshot entry, compared between polls to decide
/// whether the entry changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    /// Filesystem identity of the entry: the inode on Unix, absent on
    /// platforms without a cheap equivalent. Rename inference pairs
    /// created and deleted entries through this value.
    pub file_id: Option<u64>,
    pub readonly: bool,
}

impl EntryMetadata {
    /// Captures the attributes of `fs::symlink_metadata` output. Symlinks
    /// are recorded as files with the link's own metadata, never followed.
    pub fn from_fs_metadata(metadata: &Metadata) -> Self {
        let kind = if metadata.file_type().is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        #[cfg(unix)]
        let file_id = {
            use std::os::unix::fs::MetadataExt;
            Some(metadata.ino())
        };
        #[cfg(not(unix))]
        let file_id = None;

        Self {
            kind,
            size: metadata.len(),
            mtime: metadata.modified().ok(),
            file_id,
            readonly: metadata.permissions().readonly(),
        }
    }

    /// Whether the observable attributes drifted. Identity changes are the
    /// caller's concern (compare `file_id` directly); this only looks at
    /// kind, size, mtime and permissions.
    pub fn differs_from(&self, other: &EntryMetadata) -> bool {
        self.kind.conflicts_with(other.kind)
            || self.size != other.size
            || self.mtime != other.mtime
            || self.readonly != other.readonly
    }
}

/// What the host asks a worker to do.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandAction {
    /// Begin watching `root` on `channel`. `split_count` partitions the
    /// subtree across native watchers; the polling worker ignores it but
    /// the field stays for wire compatibility.
    Add {
        root: PathBuf,
        channel: ChannelId,
        split_count: usize,
    },
    /// Stop watching one channel.
    Remove { channel: ChannelId },
    LogToFile(PathBuf),
    LogToStderr,
    LogToStdout,
    LogDisable,
    /// New polling cadence in milliseconds.
    PollingInterval(u64),
    /// New throttle budget in slots per cycle.
    PollingThrottle(usize),
    /// Flush pending events; the ack arrives behind everything already
    /// emitted.
    Drain,
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add {
                root,
                channel,
                split_count,
            } => write!(
                f,
                "add {} to channel {channel} (split {split_count})",
                root.display()
            ),
            Self::Remove { channel } => write!(f, "remove channel {channel}"),
            Self::LogToFile(path) => write!(f, "log to file {}", path.display()),
            Self::LogToStderr => f.write_str("log to stderr"),
            Self::LogToStdout => f.write_str("log to stdout"),
            Self::LogDisable => f.write_str("log disable"),
            Self::PollingInterval(ms) => write!(f, "polling interval {ms}ms"),
            Self::PollingThrottle(slots) => write!(f, "polling throttle {slots}"),
            Self::Drain => f.write_str("drain"),
        }
    }
}

/// A command plus its correlation id.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub id: CommandId,
    pub action: CommandAction,
}

impl CommandPayload {
    pub fn new(id: CommandId, action: CommandAction) -> Self {
        Self { id, action }
    }

    /// The channel a channel-bearing command addresses, or
    /// [`NULL_CHANNEL_ID`] for the rest.
    pub fn channel(&self) -> ChannelId {
        match &self.action {
            CommandAction::Add { channel, .. } | CommandAction::Remove { channel } => *channel,
            _ => NULL_CHANNEL_ID,
        }
    }
}

impl fmt::Display for CommandPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command #{}: {}", self.id, self.action)
    }
}

/// One observed filesystem change. `old_path` is populated exactly for
/// renames.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct FileSystemPayload {
    pub channel: ChannelId,
    pub action: FileSystemAction,
    pub kind: EntryKind,
    pub old_path: Option<PathBuf>,
    pub path: PathBuf,
}

impl FileSystemPayload {
    pub fn created(channel: ChannelId, path: PathBuf, kind: EntryKind) -> Self {
        Self {
            channel,
            action: FileSystemAction::Created,
            kind,
            old_path: None,
            path,
        }
    }

    pub fn modified(channel: ChannelId, path: PathBuf, kind: EntryKind) -> Self {
        Self {
            channel,
            action: FileSystemAction::Modified,
            kind,
            old_path: None,
            path,
        }
    }

    pub fn deleted(channel: ChannelId, path: PathBuf, kind: EntryKind) -> Self {
        Self {
            channel,
            action: FileSystemAction::Deleted,
            kind,
            old_path: None,
            path,
        }
    }

    pub fn renamed(channel: ChannelId, old_path: PathBuf, path: PathBuf, kind: EntryKind) -> Self {
        Self {
            channel,
            action: FileSystemAction::Renamed,
            kind,
            old_path: Some(old_path),
            path,
        }
    }
}

impl fmt::Display for FileSystemPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.old_path {
            Some(old_path) => write!(
                f,
                "renamed {} {} -> {} on channel {}",
                self.kind,
                old_path.display(),
                self.path.display(),
                self.channel
            ),
            None => write!(
                f,
                "{} {} {} on channel {}",
                self.action,
                self.kind,
                self.path.display(),
                self.channel
            ),
        }
    }
}

/// Reply correlating to the command submitted with id `key`.
#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct AckPayload {
    pub key: CommandId,
    pub channel: ChannelId,
    pub success: bool,
    pub message: String,
}

impl fmt::Display for AckPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            write!(f, "ack #{} (channel {})", self.key, self.channel)
        } else {
            write!(
                f,
                "ack #{} (channel {}) failed: {}",
                self.key, self.channel, self.message
            )
        }
    }
}

/// The unit moved across queue boundaries. Discriminate with the `as_*`
/// accessors; asking for the wrong variant yields `None`.
#[derive(Debug)]
pub enum Message {
    FileSystem(FileSystemPayload),
    Command(CommandPayload),
    Ack(AckPayload),
}

impl Message {
    /// Builds the ack for `command`: key and channel come from the command,
    /// success and message from `result`.
    pub fn ack_for(command: &CommandPayload, result: &Result<()>) -> Message {
        let (success, message) = match result {
            Ok(()) => (true, String::new()),
            Err(error) => (false, error.to_string()),
        };
        Message::Ack(AckPayload {
            key: command.id,
            channel: command.channel(),
            success,
            message,
        })
    }

    pub fn as_filesystem(&self) -> Option<&FileSystemPayload> {
        match self {
            Message::FileSystem(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn as_command(&self) -> Option<&CommandPayload> {
        match self {
            Message::Command(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn as_ack(&self) -> Option<&AckPayload> {
        match self {
            Message::Ack(payload) => Some(payload),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::FileSystem(payload) => payload.fmt(f),
            Message::Command(payload) => payload.fmt(f),
            Message::Ack(payload) => payload.fmt(f),
        }
    }
}
