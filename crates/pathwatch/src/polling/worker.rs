//! The polling worker: owns the polled roots and spends the throttle
//! budget across them.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WatcherError};
use crate::logline;
use crate::logging::plural;
use crate::message::{
    AckPayload, ChannelId, CommandAction, CommandPayload, Message, NULL_CHANNEL_ID,
};
use crate::worker::{CommandOutcome, OfflineCommandOutcome, WorkerStrategy};

use super::root::PolledRoot;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_POLL_THROTTLE: usize = 7000;

/// Strategy driving the polling thread. Channel ids are handed out in
/// increasing order, so iterating the map visits roots in insertion order.
pub struct PollingWorker {
    roots: BTreeMap<ChannelId, PolledRoot>,
    poll_interval: Duration,
    poll_throttle: usize,
}

impl PollingWorker {
    pub fn new() -> Self {
        Self {
            roots: BTreeMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_throttle: DEFAULT_POLL_THROTTLE,
        }
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn poll_throttle(&self) -> usize {
        self.poll_throttle
    }

    /// One throttled pass over every root. Each root is allotted an even
    /// share of the remaining budget; integer division keeps the total
    /// under budget, and slots a root leaves unused flow to the roots
    /// after it.
    pub fn cycle(&mut self, buffer: &mut Vec<Message>) {
        let mut remaining = self.poll_throttle;
        let mut roots_left = self.roots.len();
        if roots_left == 0 {
            return;
        }
        logline!(
            "polling {} with {}",
            plural(roots_left, "root"),
            plural(self.poll_throttle, "throttle slot")
        );

        for root in self.roots.values_mut() {
            let allotment = remaining / roots_left;
            let consumed = root.advance(buffer, allotment);
            logline!("{root} consumed {}", plural(consumed, "throttle slot"));
            remaining = remaining.saturating_sub(consumed);
            roots_left -= 1;
        }
    }

    fn add_root(
        &mut self,
        command: &CommandPayload,
        root: &Path,
        channel: ChannelId,
        outgoing: &mut Vec<Message>,
    ) -> Result<()> {
        if channel == NULL_CHANNEL_ID {
            return Err(WatcherError::UnsupportedCommand(
                "channel 0 is reserved".to_string(),
            ));
        }
        let metadata = fs::symlink_metadata(root).map_err(|error| {
            WatcherError::InvalidRoot(format!("{}: {error}", root.display()))
        })?;
        if !metadata.is_dir() {
            return Err(WatcherError::InvalidRoot(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        // A second add on a live channel replaces the root: fresh snapshot,
        // fresh ack once its initial scan completes.
        let polled = PolledRoot::new(root.to_path_buf(), command.id, channel);
        if let Some(previous) = self.roots.insert(channel, polled) {
            settle_owed_ack(&previous, outgoing);
        }
        Ok(())
    }
}

impl Default for PollingWorker {
    fn default() -> Self {
        Self::new()
    }
}

/// A root discarded before its initial scan completed still owes the ack
/// for the add that created it; emit it now so the command is answered
/// exactly once.
fn settle_owed_ack(root: &PolledRoot, outgoing: &mut Vec<Message>) {
    if root.is_primed() {
        return;
    }
    outgoing.push(Message::Ack(AckPayload {
        key: root.command_id(),
        channel: root.channel(),
        success: true,
        message: String::new(),
    }));
}

impl WorkerStrategy for PollingWorker {
    fn handle_add(
        &mut self,
        command: &CommandPayload,
        outgoing: &mut Vec<Message>,
    ) -> Result<CommandOutcome> {
        let CommandAction::Add { root, channel, .. } = &command.action else {
            return Err(WatcherError::UnsupportedCommand(
                "add handler received a different command".to_string(),
            ));
        };
        logline!("adding poll root {} on channel {channel}", root.display());
        self.add_root(command, root, *channel, outgoing)?;
        // Acked by the root itself once its initial scan completes.
        Ok(CommandOutcome::Nothing)
    }

    fn handle_remove(
        &mut self,
        command: &CommandPayload,
        outgoing: &mut Vec<Message>,
    ) -> Result<CommandOutcome> {
        let CommandAction::Remove { channel } = command.action else {
            return Err(WatcherError::UnsupportedCommand(
                "remove handler received a different command".to_string(),
            ));
        };
        logline!("removing poll root on channel {channel}");
        match self.roots.remove(&channel) {
            Some(previous) => settle_owed_ack(&previous, outgoing),
            None => return Err(WatcherError::UnknownChannel(channel)),
        }
        if self.roots.is_empty() {
            logline!("final root removed");
            return Ok(CommandOutcome::TriggerStop);
        }
        Ok(CommandOutcome::Ack)
    }

    fn handle_config(&mut self, command: &CommandPayload) -> Result<CommandOutcome> {
        match command.action {
            CommandAction::PollingInterval(ms) => {
                self.poll_interval = Duration::from_millis(ms);
                Ok(CommandOutcome::Ack)
            }
            CommandAction::PollingThrottle(slots) => {
                if slots == 0 {
                    return Err(WatcherError::UnsupportedCommand(
                        "polling throttle must be positive".to_string(),
                    ));
                }
                self.poll_throttle = slots;
                Ok(CommandOutcome::Ack)
            }
            _ => Err(WatcherError::UnsupportedCommand(format!(
                "config handler received {}",
                command.action
            ))),
        }
    }

    fn handle_offline_command(
        &mut self,
        command: &CommandPayload,
        outgoing: &mut Vec<Message>,
    ) -> Result<OfflineCommandOutcome> {
        match command.action {
            CommandAction::Add { .. } => Ok(OfflineCommandOutcome::TriggerRun),
            CommandAction::Remove { .. } => {
                match self.handle_remove(command, outgoing)? {
                    CommandOutcome::TriggerStop => Ok(OfflineCommandOutcome::TriggerStop),
                    _ => Ok(OfflineCommandOutcome::Ack),
                }
            }
            CommandAction::PollingInterval(_) | CommandAction::PollingThrottle(_) => {
                self.handle_config(command)?;
                Ok(OfflineCommandOutcome::Ack)
            }
            _ => Ok(OfflineCommandOutcome::Ack),
        }
    }

    fn work(&mut self, buffer: &mut Vec<Message>) -> Result<()> {
        self.cycle(buffer);
        Ok(())
    }

    fn pause(&self) -> Duration {
        self.poll_interval
    }
}
