//! Hardlink group tracking, keyed by `(device, inode)`.
//!
//! # Install side
//! [`LinkSet`] decides, for each regular entry with `nlink > 1`, whether it
//! is deferred (no data yet), materialized (it carries the data, or it is
//! the last expected link), or linked to an already materialized member.
//! A group leaves the set once every expected link has been seen and one of
//! them is on disk.  Groups still without a materialized member at the end
//! of the archive are an error.
//!
//! # Build side
//! [`LinkBatcher`] holds back the members of each group until the last one
//! named by the caller arrives, so that the whole group is written
//! contiguously with the data attached to the first member.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::header::EntryHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub dev: u64,
    pub ino: u64,
}

impl InodeKey {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    pub fn of(header: &EntryHeader) -> Self {
        let dev = (u64::from(header.dev_major) << 32) | u64::from(header.dev_minor);
        Self { dev, ino: u64::from(header.ino) }
    }
}

// ── Install side ──────────────────────────────────────────────────────────────

/// One archive name of a hardlinked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub archive_path: String,
    pub dest:         PathBuf,
}

#[derive(Debug)]
struct LinkGroup {
    links_left: u32,
    /// Index into `members` of the link that is on disk.
    created:    Option<usize>,
    members:    Vec<Member>,
}

/// What the installer must do with an admitted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Nothing on disk yet and no data in this entry: wait.
    Defer,
    /// Write this entry's data, then [`LinkSet::commit`].
    Materialize,
    /// Link this entry's destination to `target`.
    Link { target: PathBuf },
}

/// Members that were deferred before the data arrived.
#[derive(Debug)]
pub struct Replay {
    pub target:  PathBuf,
    pub members: Vec<Member>,
}

#[derive(Debug, Default)]
pub struct LinkSet {
    groups: HashMap<InodeKey, LinkGroup>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, key: InodeKey, nlink: u32, has_payload: bool, member: Member) -> Admission {
        let group = self.groups.entry(key).or_insert_with(|| LinkGroup {
            links_left: nlink,
            created:    None,
            members:    Vec::new(),
        });
        group.members.push(member);
        group.links_left = group.links_left.saturating_sub(1);

        match group.created {
            Some(i) => Admission::Link { target: group.members[i].dest.clone() },
            // The last expected link materializes even without data: a group
            // of empty files never carries a payload.
            None if has_payload || group.links_left == 0 => Admission::Materialize,
            None => Admission::Defer,
        }
    }

    /// Record that the most recently admitted member of `key` is on disk and
    /// hand back the deferred members that must now be linked to it.
    pub fn commit(&mut self, key: InodeKey) -> Replay {
        let Some(group) = self.groups.get_mut(&key) else {
            return Replay { target: PathBuf::new(), members: Vec::new() };
        };
        let created = group.members.len() - 1;
        group.created = Some(created);
        let target = group.members[created].dest.clone();
        let members = group.members[..created].to_vec();
        self.settle(key);
        Replay { target, members }
    }

    /// Drop the group once every link is accounted for.
    pub fn settle(&mut self, key: InodeKey) {
        let done = self
            .groups
            .get(&key)
            .is_some_and(|g| g.links_left == 0 && g.created.is_some());
        if done {
            self.groups.remove(&key);
        }
    }

    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// End of archive.  Returns the first member of a group whose data never
    /// arrived.  Groups with a materialized member but missing names (links
    /// that were never archived) are fine.
    pub fn finish(self) -> Result<(), Member> {
        let mut orphaned: Vec<Member> = self
            .groups
            .into_values()
            .filter(|g| g.created.is_none())
            .filter_map(|g| g.members.into_iter().next())
            .collect();
        orphaned.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));
        match orphaned.into_iter().next() {
            Some(m) => Err(m),
            None    => Ok(()),
        }
    }
}

// ── Build side ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingGroup<T> {
    seq:        usize,
    links_left: u64,
    members:    Vec<T>,
}

#[derive(Debug)]
pub struct LinkBatcher<T> {
    groups:   HashMap<InodeKey, PendingGroup<T>>,
    next_seq: usize,
}

impl<T> Default for LinkBatcher<T> {
    fn default() -> Self {
        Self { groups: HashMap::new(), next_seq: 0 }
    }
}

impl<T> LinkBatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `item`.  Returns the complete group when its links-remaining
    /// counter reaches zero.
    pub fn push(&mut self, key: InodeKey, nlink: u64, item: T) -> Option<Vec<T>> {
        let seq = self.next_seq;
        let group = self.groups.entry(key).or_insert_with(|| PendingGroup {
            seq,
            links_left: nlink,
            members:    Vec::new(),
        });
        if group.seq == seq {
            self.next_seq += 1;
        }
        group.members.push(item);
        group.links_left = group.links_left.saturating_sub(1);

        if group.links_left == 0 {
            self.groups.remove(&key).map(|g| g.members)
        } else {
            None
        }
    }

    /// Groups whose remaining links were never supplied, in first-seen order.
    pub fn drain(self) -> Vec<Vec<T>> {
        let mut rest: Vec<PendingGroup<T>> = self.groups.into_values().collect();
        rest.sort_by_key(|g| g.seq);
        rest.into_iter().map(|g| g.members).collect()
    }
}
