//! Node variants held by the file tree arena (spec C7, §3 DATA MODEL).

use std::collections::HashMap;
use std::time::Instant;

use crate::error::Error;
use crate::wire::FileStat;

/// Index into [`super::FileTree`]'s node arena.
pub type NodeId = usize;

/// [`FileStat`] plus the monotonic id assigned at node creation (spec §3:
/// "Id is allocated at node creation and never reused").
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub file: FileStat,
    pub id: u64,
}

/// Open-descriptor bookkeeping and dirty flag for a regular file.
#[derive(Default)]
pub struct RegularFile {
    open_fds: HashMap<u64, i32>,
    dirty: bool,
}

impl RegularFile {
    /// Record `fd` as open with `flags`. Returns false if already open.
    pub fn open(&mut self, fd: u64, flags: i32) -> bool {
        if self.open_fds.contains_key(&fd) {
            return false;
        }
        self.open_fds.insert(fd, flags);
        true
    }

    /// Forget `fd`. Returns false if it wasn't open.
    pub fn close(&mut self, fd: u64) -> bool {
        self.open_fds.remove(&fd).is_some()
    }

    pub fn is_open(&self, fd: u64) -> bool {
        self.open_fds.contains_key(&fd)
    }

    pub fn has_open_fds(&self) -> bool {
        !self.open_fds.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
}

/// Child set keyed by name, plus the readdir-complete flag (spec §3).
#[derive(Default)]
pub struct Directory {
    children: HashMap<String, NodeId>,
    readdir_complete: bool,
}

impl Directory {
    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }

    pub fn insert(&mut self, name: String, id: NodeId) {
        self.children.insert(name, id);
    }

    pub fn remove(&mut self, name: &str) -> Option<NodeId> {
        self.children.remove(name)
    }

    pub fn has_readdir(&self) -> bool {
        self.readdir_complete
    }

    pub fn set_readdir(&mut self) {
        self.readdir_complete = true;
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.children.iter().map(|(name, &id)| (name.as_str(), id))
    }
}

/// A node's concrete kind (spec §3: "tagged union").
pub enum Kind {
    Regular(RegularFile),
    Directory(Directory),
    /// Last-read target of a symlink.
    Link(String),
    /// Block/char/socket/fifo — anything not modeled further.
    Other,
    /// Cached failure from the last revalidation attempt.
    Error(Error),
}

impl Kind {
    pub fn from_mode(mode: u32) -> Kind {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => Kind::Directory(Directory::default()),
            libc::S_IFREG => Kind::Regular(RegularFile::default()),
            libc::S_IFLNK => Kind::Link(String::new()),
            _ => Kind::Other,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Kind::Directory(_))
    }

    pub fn is_link(&self) -> bool {
        matches!(self, Kind::Link(_))
    }

    pub fn as_error(&self) -> Option<Error> {
        match self {
            Kind::Error(e) => Some(*e),
            _ => None,
        }
    }
}

/// A single tree entry: name, parent back-reference, stat, and kind.
pub struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
    pub stat: Stat,
    pub kind: Kind,
    pub expires_at: Instant,
}

impl Node {
    pub fn new(name: String, parent: Option<NodeId>, stat: Stat, kind: Kind, expires_at: Instant) -> Self {
        Node { name, parent, stat, kind, expires_at }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}
