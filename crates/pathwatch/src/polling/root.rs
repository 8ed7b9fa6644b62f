//! One watched subtree: snapshot, resumable traversal, change detection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use crate::logline;
use crate::message::{
    AckPayload, ChannelId, CommandId, EntryKind, EntryMetadata, FileSystemAction,
    FileSystemPayload, Message,
};

/// Resumable position in the depth-first walk: the directory being listed
/// and how many of its name-sorted entries were already inspected. Plain
/// data, so no handle stays open between `advance` calls.
#[derive(Debug)]
struct CursorFrame {
    dir: PathBuf,
    resume_index: usize,
}

/// A change observed during one `advance` call, held back until the call
/// completes so created/deleted pairs can coalesce into renames.
#[derive(Debug)]
struct PendingChange {
    action: FileSystemAction,
    kind: EntryKind,
    path: PathBuf,
    file_id: Option<u64>,
}

/// The polling worker's record of one watched channel.
///
/// The snapshot maps every known path under the root to the attributes it
/// had when last inspected. The first complete traversal seeds the snapshot
/// silently and emits the success ack for the originating add command;
/// every traversal after that diffs the live tree against the snapshot and
/// emits the differences.
pub struct PolledRoot {
    root: PathBuf,
    command_id: CommandId,
    channel: ChannelId,
    snapshot: std::collections::BTreeMap<PathBuf, EntryMetadata>,
    cursor: Vec<CursorFrame>,
    primed: bool,
}

impl PolledRoot {
    pub fn new(root: PathBuf, command_id: CommandId, channel: ChannelId) -> Self {
        Self {
            root,
            command_id,
            channel,
            snapshot: std::collections::BTreeMap::new(),
            cursor: Vec::new(),
            primed: false,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Id of the add command this root was created for; its ack is owed
    /// until the initial scan completes.
    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// Whether the initial scan has completed.
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn entry_count(&self) -> usize {
        self.snapshot.len()
    }

    /// Walks as much of the subtree as `allotment` slots allow, emitting
    /// detected changes into `buffer`. One slot pays for one directory
    /// entry inspection; a call that does anything at all consumes at
    /// least one slot. Returns the slots consumed.
    ///
    /// When the allotment runs out mid-traversal the cursor is saved and
    /// the next call resumes there; until then, unvisited subtrees are
    /// represented by stale snapshot data.
    pub fn advance(&mut self, buffer: &mut Vec<Message>, allotment: usize) -> usize {
        if allotment == 0 {
            return 0;
        }

        let mut slots = 0usize;
        let mut changes: Vec<PendingChange> = Vec::new();

        if self.cursor.is_empty() {
            self.cursor.push(CursorFrame {
                dir: self.root.clone(),
                resume_index: 0,
            });
        }

        while slots < allotment {
            let Some(mut frame) = self.cursor.pop() else {
                break;
            };

            let listing = match list_dir_sorted(&frame.dir) {
                Ok(listing) => listing,
                Err(error) => {
                    // Unreadable or vanished: treated as emptied for this
                    // cycle, re-examined next cycle.
                    logline!("cannot read {}: {error}", frame.dir.display());
                    self.treat_as_emptied(&frame.dir, &mut changes);
                    slots += 1;
                    continue;
                }
            };

            let mut descend_into = None;
            while frame.resume_index < listing.len() && slots < allotment {
                let path = listing[frame.resume_index].clone();
                frame.resume_index += 1;
                slots += 1;
                if let Some(child_dir) = self.inspect_entry(path, &mut changes) {
                    descend_into = Some(child_dir);
                    break;
                }
            }

            if let Some(child_dir) = descend_into {
                self.cursor.push(frame);
                self.cursor.push(CursorFrame {
                    dir: child_dir,
                    resume_index: 0,
                });
                continue;
            }

            if frame.resume_index < listing.len() {
                // Allotment exhausted mid-directory.
                self.cursor.push(frame);
                break;
            }

            self.diff_deletions(&frame.dir, &listing, &mut changes);
        }

        if self.cursor.is_empty() && !self.primed {
            self.primed = true;
            logline!("{} primed", self);
            buffer.push(Message::Ack(AckPayload {
                key: self.command_id,
                channel: self.channel,
                success: true,
                message: String::new(),
            }));
        }

        buffer.extend(coalesce_renames(self.channel, changes));

        slots.max(1)
    }

    /// Compares one listed entry against the snapshot, recording the
    /// difference and updating the snapshot in place. Returns the path
    /// again when it is a directory to descend into.
    fn inspect_entry(
        &mut self,
        path: PathBuf,
        changes: &mut Vec<PendingChange>,
    ) -> Option<PathBuf> {
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => EntryMetadata::from_fs_metadata(&metadata),
            Err(_) => {
                // Vanished between listing and inspection.
                if let Some(prior) = self.snapshot.get(&path).copied() {
                    self.remove_subtree(&path, prior, changes);
                }
                return None;
            }
        };

        match self.snapshot.get(&path).copied() {
            None => {
                if self.primed {
                    changes.push(PendingChange {
                        action: FileSystemAction::Created,
                        kind: metadata.kind,
                        path: path.clone(),
                        file_id: metadata.file_id,
                    });
                }
                self.snapshot.insert(path.clone(), metadata);
            }
            Some(prior) => {
                let identity_changed = prior.file_id.is_some()
                    && metadata.file_id.is_some()
                    && prior.file_id != metadata.file_id;

                if identity_changed {
                    // Same name, different entry: not a modification.
                    if self.primed {
                        changes.push(PendingChange {
                            action: FileSystemAction::Deleted,
                            kind: prior.kind,
                            path: path.clone(),
                            file_id: prior.file_id,
                        });
                        changes.push(PendingChange {
                            action: FileSystemAction::Created,
                            kind: metadata.kind,
                            path: path.clone(),
                            file_id: metadata.file_id,
                        });
                    }
                    self.snapshot.insert(path.clone(), metadata);
                } else if metadata.differs_from(&prior) {
                    if self.primed {
                        changes.push(PendingChange {
                            action: FileSystemAction::Modified,
                            kind: metadata.kind,
                            path: path.clone(),
                            file_id: metadata.file_id,
                        });
                    }
                    self.snapshot.insert(path.clone(), metadata);
                }

                if prior.kind == EntryKind::Directory && metadata.kind != EntryKind::Directory {
                    self.evict_descendants(&path, changes);
                }
            }
        }

        (metadata.kind == EntryKind::Directory).then_some(path)
    }

    /// Emits deletions for snapshot children of `dir` that the completed
    /// listing no longer contains.
    fn diff_deletions(
        &mut self,
        dir: &Path,
        listing: &[PathBuf],
        changes: &mut Vec<PendingChange>,
    ) {
        let present: HashSet<&Path> = listing.iter().map(PathBuf::as_path).collect();
        let stale: Vec<(PathBuf, EntryMetadata)> = self
            .children_of(dir)
            .into_iter()
            .filter(|(path, _)| !present.contains(path.as_path()))
            .collect();
        for (path, metadata) in stale {
            self.remove_subtree(&path, metadata, changes);
        }
    }

    /// Drops one entry from the snapshot, with everything under it when it
    /// was a directory, emitting a deletion per dropped entry.
    fn remove_subtree(
        &mut self,
        path: &Path,
        metadata: EntryMetadata,
        changes: &mut Vec<PendingChange>,
    ) {
        self.snapshot.remove(path);
        if self.primed {
            changes.push(PendingChange {
                action: FileSystemAction::Deleted,
                kind: metadata.kind,
                path: path.to_path_buf(),
                file_id: metadata.file_id,
            });
        }
        if metadata.kind == EntryKind::Directory {
            self.evict_descendants(path, changes);
        }
    }

    fn evict_descendants(&mut self, dir: &Path, changes: &mut Vec<PendingChange>) {
        let descendants: Vec<(PathBuf, EntryMetadata)> = self
            .snapshot
            .range::<Path, _>((Bound::Excluded(dir), Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(dir))
            .map(|(path, metadata)| (path.clone(), *metadata))
            .collect();
        for (path, metadata) in descendants {
            self.snapshot.remove(&path);
            if self.primed {
                changes.push(PendingChange {
                    action: FileSystemAction::Deleted,
                    kind: metadata.kind,
                    path,
                    file_id: metadata.file_id,
                });
            }
        }
    }

    fn treat_as_emptied(&mut self, dir: &Path, changes: &mut Vec<PendingChange>) {
        for (path, metadata) in self.children_of(dir) {
            self.remove_subtree(&path, metadata, changes);
        }
    }

    /// Immediate snapshot children of `dir`. Paths sort component-wise, so
    /// everything under a directory is contiguous right after it.
    fn children_of(&self, dir: &Path) -> Vec<(PathBuf, EntryMetadata)> {
        self.snapshot
            .range::<Path, _>((Bound::Excluded(dir), Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(dir))
            .filter(|(path, _)| path.parent() == Some(dir))
            .map(|(path, metadata)| (path.clone(), *metadata))
            .collect()
    }
}

impl fmt::Display for PolledRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "poll root {} (channel {}, {} entries)",
            self.root.display(),
            self.channel,
            self.snapshot.len()
        )
    }
}

fn list_dir_sorted(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    Ok(entries)
}

/// Coalesces created/deleted pairs sharing a file id into single renames,
/// preserving the observation order of the surviving changes.
fn coalesce_renames(channel: ChannelId, changes: Vec<PendingChange>) -> Vec<Message> {
    let mut created_by_fileid: HashMap<u64, usize> = HashMap::new();
    let mut deleted_by_fileid: HashMap<u64, usize> = HashMap::new();
    for (index, change) in changes.iter().enumerate() {
        let Some(file_id) = change.file_id else {
            continue;
        };
        match change.action {
            FileSystemAction::Created => {
                created_by_fileid.insert(file_id, index);
            }
            FileSystemAction::Deleted => {
                deleted_by_fileid.insert(file_id, index);
            }
            _ => {}
        }
    }

    let mut consumed = vec![false; changes.len()];
    let mut old_path_for: Vec<Option<PathBuf>> = vec![None; changes.len()];
    for (file_id, created_index) in &created_by_fileid {
        if let Some(deleted_index) = deleted_by_fileid.get(file_id) {
            consumed[*deleted_index] = true;
            old_path_for[*created_index] = Some(changes[*deleted_index].path.clone());
        }
    }

    changes
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !consumed[*index])
        .map(|(index, change)| {
            let payload = match old_path_for[index].take() {
                Some(old_path) => {
                    FileSystemPayload::renamed(channel, old_path, change.path, change.kind)
                }
                None => match change.action {
                    FileSystemAction::Created => {
                        FileSystemPayload::created(channel, change.path, change.kind)
                    }
                    FileSystemAction::Deleted => {
                        FileSystemPayload::deleted(channel, change.path, change.kind)
                    }
                    FileSystemAction::Modified | FileSystemAction::Renamed => {
                        FileSystemPayload::modified(channel, change.path, change.kind)
                    }
                },
            };
            Message::FileSystem(payload)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    const BIG_ALLOTMENT: usize = 10_000;

    fn primed_root(dir: &Path) -> PolledRoot {
        let mut root = PolledRoot::new(dir.to_path_buf(), 10, 1);
        let mut buffer = Vec::new();
        while !root.is_primed() {
            root.advance(&mut buffer, BIG_ALLOTMENT);
        }
        root
    }

    fn events(buffer: &[Message]) -> Vec<&FileSystemPayload> {
        buffer.iter().filter_map(Message::as_filesystem).collect()
    }

    #[test]
    fn priming_emits_a_single_ack_and_no_events() {
        let temp = TempDir::new().unwrap();
        File::create(temp.path().join("a.txt")).unwrap();
        File::create(temp.path().join("b.txt")).unwrap();

        let mut root = PolledRoot::new(temp.path().to_path_buf(), 42, 7);
        let mut buffer = Vec::new();
        root.advance(&mut buffer, BIG_ALLOTMENT);

        assert!(root.is_primed());
        assert_eq!(buffer.len(), 1);
        let ack = buffer[0].as_ack().unwrap();
        assert_eq!(ack.key, 42);
        assert_eq!(ack.channel, 7);
        assert!(ack.success);
        assert_eq!(root.entry_count(), 2);
    }

    #[test]
    fn empty_root_consumes_one_slot_and_emits_no_events() {
        let temp = TempDir::new().unwrap();
        let mut root = PolledRoot::new(temp.path().to_path_buf(), 1, 1);

        let mut buffer = Vec::new();
        let consumed = root.advance(&mut buffer, BIG_ALLOTMENT);
        assert_eq!(consumed, 1);
        assert!(events(&buffer).is_empty());

        // Steady state stays at one slot per pass.
        let mut buffer = Vec::new();
        assert_eq!(root.advance(&mut buffer, BIG_ALLOTMENT), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn created_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let mut root = primed_root(temp.path());

        File::create(temp.path().join("a.txt")).unwrap();

        let mut buffer = Vec::new();
        root.advance(&mut buffer, BIG_ALLOTMENT);
        let events = events(&buffer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, FileSystemAction::Created);
        assert_eq!(events[0].kind, EntryKind::File);
        assert_eq!(events[0].path, temp.path().join("a.txt"));
        assert_eq!(events[0].channel, 1);
    }

    #[test]
    fn modified_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.txt");
        fs::write(&path, b"one").unwrap();
        let mut root = primed_root(temp.path());

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b" two").unwrap();
        drop(file);

        let mut buffer = Vec::new();
        root.advance(&mut buffer, BIG_ALLOTMENT);
        let events = events(&buffer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, FileSystemAction::Modified);
        assert_eq!(events[0].path, path);
    }

    #[test]
    fn deleted_file_is_reported_with_its_prior_kind() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.txt");
        File::create(&path).unwrap();
        let mut root = primed_root(temp.path());

        fs::remove_file(&path).unwrap();

        let mut buffer = Vec::new();
        root.advance(&mut buffer, BIG_ALLOTMENT);
        let events = events(&buffer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, FileSystemAction::Deleted);
        assert_eq!(events[0].kind, EntryKind::File);
        assert_eq!(events[0].path, path);
    }

    #[cfg(unix)]
    #[test]
    fn rename_within_one_pass_coalesces_into_a_single_event() {
        let temp = TempDir::new().unwrap();
        let old_path = temp.path().join("a.txt");
        let new_path = temp.path().join("b.txt");
        fs::write(&old_path, b"payload").unwrap();
        let mut root = primed_root(temp.path());

        fs::rename(&old_path, &new_path).unwrap();

        let mut buffer = Vec::new();
        root.advance(&mut buffer, BIG_ALLOTMENT);
        let events = events(&buffer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, FileSystemAction::Renamed);
        assert_eq!(events[0].old_path.as_deref(), Some(old_path.as_path()));
        assert_eq!(events[0].path, new_path);
        assert_eq!(events[0].kind, EntryKind::File);
    }

    #[cfg(unix)]
    #[test]
    fn overwriting_rename_reports_the_loss_and_the_rename() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("a.txt");
        let source = temp.path().join("b.txt");
        fs::write(&target, b"old").unwrap();
        fs::write(&source, b"new").unwrap();
        let mut root = primed_root(temp.path());

        fs::rename(&source, &target).unwrap();

        let mut buffer = Vec::new();
        root.advance(&mut buffer, BIG_ALLOTMENT);
        let events = events(&buffer);
        assert_eq!(events.len(), 2);

        let deleted = events
            .iter()
            .find(|event| event.action == FileSystemAction::Deleted)
            .expect("the overwritten entry is reported deleted");
        assert_eq!(deleted.path, target);

        let renamed = events
            .iter()
            .find(|event| event.action == FileSystemAction::Renamed)
            .expect("the move itself is reported as a rename");
        assert_eq!(renamed.old_path.as_deref(), Some(source.as_path()));
        assert_eq!(renamed.path, target);
    }

    #[test]
    fn vanished_directory_reports_itself_and_its_descendants() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("d");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("inner.txt"), b"x").unwrap();
        let mut root = primed_root(temp.path());

        fs::remove_dir_all(&dir).unwrap();

        let mut buffer = Vec::new();
        root.advance(&mut buffer, BIG_ALLOTMENT);
        let events = events(&buffer);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, FileSystemAction::Deleted);
        assert_eq!(events[0].kind, EntryKind::Directory);
        assert_eq!(events[0].path, dir);
        assert_eq!(events[1].action, FileSystemAction::Deleted);
        assert_eq!(events[1].kind, EntryKind::File);
        assert_eq!(events[1].path, dir.join("inner.txt"));
        assert_eq!(root.entry_count(), 0);
    }

    #[test]
    fn new_directory_and_its_contents_surface_in_one_pass() {
        let temp = TempDir::new().unwrap();
        let mut root = primed_root(temp.path());

        let dir = temp.path().join("d");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("inner.txt"), b"x").unwrap();

        let mut buffer = Vec::new();
        root.advance(&mut buffer, BIG_ALLOTMENT);
        let events = events(&buffer);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, FileSystemAction::Created);
        assert_eq!(events[0].kind, EntryKind::Directory);
        assert_eq!(events[0].path, dir);
        assert_eq!(events[1].action, FileSystemAction::Created);
        assert_eq!(events[1].kind, EntryKind::File);
        assert_eq!(events[1].path, dir.join("inner.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recorded_as_files_and_not_followed() {
        let temp = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::write(target.path().join("inside.txt"), b"x").unwrap();
        let mut root = primed_root(temp.path());

        let link = temp.path().join("link");
        std::os::unix::fs::symlink(target.path(), &link).unwrap();

        let mut buffer = Vec::new();
        root.advance(&mut buffer, BIG_ALLOTMENT);
        let events = events(&buffer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, FileSystemAction::Created);
        assert_eq!(events[0].kind, EntryKind::File);
        assert_eq!(events[0].path, link);
    }

    #[test]
    fn allotment_splits_a_large_directory_across_calls() {
        let temp = TempDir::new().unwrap();
        for index in 0..10 {
            File::create(temp.path().join(format!("f{index}.txt"))).unwrap();
        }

        let mut root = PolledRoot::new(temp.path().to_path_buf(), 3, 2);
        let mut buffer = Vec::new();

        assert_eq!(root.advance(&mut buffer, 5), 5);
        assert!(!root.is_primed());
        assert!(buffer.is_empty());

        assert_eq!(root.advance(&mut buffer, 5), 5);
        assert!(root.is_primed());
        assert_eq!(buffer.len(), 1);
        assert!(buffer[0].as_ack().unwrap().success);
        assert_eq!(root.entry_count(), 10);
    }

    #[test]
    fn zero_allotment_consumes_nothing() {
        let temp = TempDir::new().unwrap();
        let mut root = PolledRoot::new(temp.path().to_path_buf(), 1, 1);
        let mut buffer = Vec::new();
        assert_eq!(root.advance(&mut buffer, 0), 0);
        assert!(buffer.is_empty());
        assert!(!root.is_primed());
    }
}
