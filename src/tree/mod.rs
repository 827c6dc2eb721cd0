//! Lazily-built, TTL-revalidated file tree (spec C7).
//!
//! `FileTree` is a trie of [`node::Node`]s stored in an arena (`Vec<Option<Node>>`)
//! addressed by [`node::NodeId`] rather than raw pointers — the idiomatic
//! substitute for the reference implementation's intrusive `Node*` back-links,
//! which the borrow checker won't allow directly. Runs entirely on the single
//! executor thread the rest of the core lives on, so arena access goes through
//! a `RefCell`, same reasoning as [`crate::cache::PageCache`].

pub mod node;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use node::{Directory, Kind, Node, NodeId, Stat};

use crate::cache::PageCache;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::path::{Path, PathBuf};
use crate::wire::{FileStat, RenameFlags, TimeSpec, WireTime};

fn wire_time_now() -> WireTime {
    let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    WireTime { seconds: dur.as_secs() as i64, nanos: dur.subsec_nanos() as i64 }
}

fn mode_family(mode: u32) -> u32 {
    mode & libc::S_IFMT
}

pub struct FileTree {
    connection: Rc<dyn Connection>,
    cache: Rc<PageCache>,
    nodes: RefCell<Vec<Option<Node>>>,
    free: RefCell<Vec<NodeId>>,
    root: NodeId,
    fd_counter: Cell<u64>,
    id_counter: Cell<u64>,
    ttl: Cell<Duration>,
}

impl FileTree {
    pub fn new(connection: Rc<dyn Connection>, cache: Rc<PageCache>, ttl: Duration) -> Self {
        let root_stat = Stat { file: FileStat::default(), id: 0 };
        let root_node = Node::new(String::new(), None, root_stat, Kind::Directory(Directory::default()), Instant::now());
        FileTree {
            connection,
            cache,
            nodes: RefCell::new(vec![Some(root_node)]),
            free: RefCell::new(Vec::new()),
            root: 0,
            fd_counter: Cell::new(0),
            id_counter: Cell::new(1),
            ttl: Cell::new(ttl),
        }
    }

    /// Reconfigure the revalidation TTL (spec §4.8, control op `set_ttl`).
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl.set(ttl);
    }

    /// Reconfigure the connection's per-request timeout (spec §4.8, control
    /// op `set_timeout`).
    pub fn set_request_timeout(&self, timeout: Option<Duration>) {
        self.connection.set_timeout(timeout);
    }

    /// Drop every cached page without flushing and force every node to
    /// revalidate on next access (spec §4.8, control op `invalidate_cache`).
    pub async fn invalidate_all_cache(&self) -> Result<()> {
        self.cache.invalidate_all().await?;
        let now = Instant::now();
        let mut nodes = self.nodes.borrow_mut();
        for slot in nodes.iter_mut().flatten() {
            slot.expires_at = now;
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        let v = self.id_counter.get();
        self.id_counter.set(v + 1);
        v
    }

    fn next_fd(&self) -> u64 {
        let v = self.fd_counter.get();
        self.fd_counter.set(v + 1);
        v
    }

    fn alloc_slot(&self, node: Node) -> NodeId {
        if let Some(idx) = self.free.borrow_mut().pop() {
            self.nodes.borrow_mut()[idx] = Some(node);
            idx
        } else {
            let mut nodes = self.nodes.borrow_mut();
            nodes.push(Some(node));
            nodes.len() - 1
        }
    }

    /// Recursively detach and free a node and (if a directory) its children.
    fn free_subtree(&self, id: NodeId) {
        let child_ids: Vec<NodeId> = {
            let nodes = self.nodes.borrow();
            match nodes[id].as_ref().map(|n| &n.kind) {
                Some(Kind::Directory(dir)) => dir.iter().map(|(_, id)| id).collect(),
                _ => Vec::new(),
            }
        };
        for child in child_ids {
            self.free_subtree(child);
        }
        self.nodes.borrow_mut()[id] = None;
        self.free.borrow_mut().push(id);
    }

    /// Apply a freshly-fetched [`FileStat`] to an existing node, resetting its
    /// kind if the file-type family changed and invalidating cached pages on
    /// a regular file whose size or mtime moved (spec §4.6 Revalidation).
    async fn reconcile(&self, id: NodeId, new_stat: FileStat) -> Result<()> {
        let (old_mode, old_size, old_mtime) = {
            let nodes = self.nodes.borrow();
            let node = nodes[id].as_ref().expect("node present");
            (node.stat.file.mode, node.stat.file.size, node.stat.file.mtime)
        };

        if mode_family(old_mode) != mode_family(new_stat.mode) {
            self.free_subtree_children(id);
            let kind = Kind::from_mode(new_stat.mode);
            let mut nodes = self.nodes.borrow_mut();
            let node = nodes[id].as_mut().expect("node present");
            node.kind = kind;
        } else if mode_family(new_stat.mode) == libc::S_IFREG
            && (old_size != new_stat.size || old_mtime != new_stat.mtime)
        {
            let cache_id = { self.nodes.borrow()[id].as_ref().expect("node present").stat.id };
            self.cache.invalidate_one(cache_id, false).await?;
        }

        let mut nodes = self.nodes.borrow_mut();
        let node = nodes[id].as_mut().expect("node present");
        let stat_id = node.stat.id;
        node.stat = Stat { file: new_stat, id: stat_id };
        node.expires_at = Instant::now() + self.ttl.get();
        Ok(())
    }

    /// Clear a directory's children (on a kind-changing revalidation) without
    /// touching the node's own slot.
    fn free_subtree_children(&self, id: NodeId) {
        let child_ids: Vec<NodeId> = {
            let nodes = self.nodes.borrow();
            match nodes[id].as_ref().map(|n| &n.kind) {
                Some(Kind::Directory(dir)) => dir.iter().map(|(_, id)| id).collect(),
                _ => Vec::new(),
            }
        };
        for child in child_ids {
            self.free_subtree(child);
        }
    }

    /// Refresh `id` (whose path is `path`) if its TTL has expired. Transient
    /// errors never overwrite the node (spec §4.6).
    async fn revalidate(&self, id: NodeId, path: &str) -> Result<()> {
        let expired = {
            let nodes = self.nodes.borrow();
            nodes[id].as_ref().expect("node present").is_expired(Instant::now())
        };
        if !expired {
            return Ok(());
        }

        match self.connection.stat(path).await {
            Ok(new_stat) => {
                self.reconcile(id, new_stat).await?;
                let is_link = { matches!(self.nodes.borrow()[id].as_ref().unwrap().kind, Kind::Link(_)) };
                if is_link {
                    let target = self.connection.readlink(path).await?;
                    let mut nodes = self.nodes.borrow_mut();
                    nodes[id].as_mut().unwrap().kind = Kind::Link(target);
                }
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                let mut nodes = self.nodes.borrow_mut();
                let node = nodes[id].as_mut().expect("node present");
                node.kind = Kind::Error(e);
                node.expires_at = Instant::now() + self.ttl.get();
                Err(e)
            }
        }
    }

    /// Build a brand-new child of `parent` at `path`, statting (and, for a
    /// symlink, reading the link target) from the connection.
    async fn build_child(&self, parent: NodeId, name: &str, path: &Path<'_>) -> Result<NodeId> {
        let file_stat = self.connection.stat(path.as_str()).await?;
        let mut kind = Kind::from_mode(file_stat.mode);
        if let Kind::Link(_) = kind {
            let target = self.connection.readlink(path.as_str()).await?;
            kind = Kind::Link(target);
        }
        let stat = Stat { file: file_stat, id: self.next_id() };
        let node = Node::new(name.to_string(), Some(parent), stat, kind, Instant::now() + self.ttl.get());
        let id = self.alloc_slot(node);
        let mut nodes = self.nodes.borrow_mut();
        if let Kind::Directory(dir) = &mut nodes[parent].as_mut().expect("parent present").kind {
            dir.insert(name.to_string(), id);
        }
        Ok(id)
    }

    /// Walk `path` from the root, revalidating expired nodes and, if `build`
    /// is set, statting and materializing missing components.
    async fn resolve(&self, path: Path<'_>) -> Result<NodeId> {
        self.resolve_impl(path, true).await
    }

    async fn resolve_no_build(&self, path: Path<'_>) -> Result<NodeId> {
        self.resolve_impl(path, false).await
    }

    async fn resolve_impl(&self, path: Path<'_>, build: bool) -> Result<NodeId> {
        self.revalidate(self.root, "/").await?;
        let mut current = self.root;
        let mut current_path = PathBuf::root();

        for comp in path.components() {
            let child_path = current_path.extend_copy(comp)?;

            let existing = {
                let nodes = self.nodes.borrow();
                let node = nodes[current].as_ref().expect("node present");
                match &node.kind {
                    Kind::Directory(dir) => dir.get(comp),
                    Kind::Error(e) => return Err(*e),
                    _ => return Err(Error::NotADirectory),
                }
            };

            current = match existing {
                Some(child) => {
                    self.revalidate(child, child_path.as_str()).await?;
                    child
                }
                None if build => self.build_child(current, comp, &child_path.as_path()).await?,
                None => return Err(Error::NotFound),
            };
            current_path = child_path;
        }

        Ok(current)
    }

    fn stat_of(&self, id: NodeId) -> Result<Stat> {
        let nodes = self.nodes.borrow();
        let node = nodes[id].as_ref().expect("node present");
        if let Some(e) = node.kind.as_error() {
            return Err(e);
        }
        Ok(node.stat)
    }

    pub async fn getattr(&self, path: &PathBuf) -> Result<Stat> {
        let id = self.resolve(path.as_path()).await?;
        self.stat_of(id)
    }

    pub async fn readdir(&self, path: &PathBuf, filler: &mut dyn FnMut(&str, u32)) -> Result<()> {
        let id = self.resolve(path.as_path()).await?;

        let needs_fetch = {
            let nodes = self.nodes.borrow();
            match &nodes[id].as_ref().expect("node present").kind {
                Kind::Directory(dir) => !dir.has_readdir(),
                Kind::Error(e) => return Err(*e),
                _ => return Err(Error::NotADirectory),
            }
        };

        if needs_fetch {
            let entries = self.connection.statdir(path.as_str()).await?;
            let new_names: HashSet<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();

            let stale: Vec<NodeId> = {
                let nodes = self.nodes.borrow();
                let Kind::Directory(dir) = &nodes[id].as_ref().expect("node present").kind else {
                    unreachable!()
                };
                dir.iter().filter(|(name, _)| !new_names.contains(name)).map(|(_, id)| id).collect()
            };
            for stale_id in stale {
                let name = { self.nodes.borrow()[stale_id].as_ref().expect("node present").name.clone() };
                {
                    let mut nodes = self.nodes.borrow_mut();
                    if let Kind::Directory(dir) = &mut nodes[id].as_mut().expect("node present").kind {
                        dir.remove(&name);
                    }
                }
                self.free_subtree(stale_id);
            }

            for (name, file_stat) in entries {
                let existing = {
                    let nodes = self.nodes.borrow();
                    let Kind::Directory(dir) = &nodes[id].as_ref().expect("node present").kind else {
                        unreachable!()
                    };
                    dir.get(&name)
                };
                match existing {
                    Some(child_id) => {
                        self.reconcile(child_id, file_stat).await?;
                        let is_link = matches!(self.nodes.borrow()[child_id].as_ref().unwrap().kind, Kind::Link(_));
                        if is_link {
                            let child_path = path.extend_copy(&name)?;
                            let target = self.connection.readlink(child_path.as_str()).await?;
                            self.nodes.borrow_mut()[child_id].as_mut().unwrap().kind = Kind::Link(target);
                        }
                    }
                    None => {
                        let mut kind = Kind::from_mode(file_stat.mode);
                        if let Kind::Link(_) = kind {
                            let child_path = path.extend_copy(&name)?;
                            let target = self.connection.readlink(child_path.as_str()).await?;
                            kind = Kind::Link(target);
                        }
                        let stat = Stat { file: file_stat, id: self.next_id() };
                        let node = Node::new(name.clone(), Some(id), stat, kind, Instant::now() + self.ttl.get());
                        let child_id = self.alloc_slot(node);
                        let mut nodes = self.nodes.borrow_mut();
                        if let Kind::Directory(dir) = &mut nodes[id].as_mut().expect("node present").kind {
                            dir.insert(name, child_id);
                        }
                    }
                }
            }

            let mut nodes = self.nodes.borrow_mut();
            if let Kind::Directory(dir) = &mut nodes[id].as_mut().expect("node present").kind {
                dir.set_readdir();
            }
        }

        let nodes = self.nodes.borrow();
        if let Kind::Directory(dir) = &nodes[id].as_ref().expect("node present").kind {
            for (name, child_id) in dir.iter() {
                let mode = nodes[child_id].as_ref().map(|n| n.stat.file.mode).unwrap_or(0);
                filler(name, mode);
            }
        }
        Ok(())
    }

    pub async fn readlink(&self, path: &PathBuf) -> Result<String> {
        let id = self.resolve(path.as_path()).await?;
        let nodes = self.nodes.borrow();
        match &nodes[id].as_ref().expect("node present").kind {
            Kind::Link(target) => Ok(target.clone()),
            Kind::Error(e) => Err(*e),
            _ => Err(Error::InvalidArgument),
        }
    }

    async fn split_parent(&self, path: &PathBuf) -> Result<(NodeId, String)> {
        if path.is_root() {
            return Err(Error::InvalidArgument);
        }
        let parent_path = path.parent_path();
        let parent_id = self.resolve(parent_path.as_path()).await?;
        Ok((parent_id, path.filename().to_string()))
    }

    async fn create_entry(&self, path: &PathBuf, file_stat: FileStat, kind_hint: Option<Kind>) -> Result<Stat> {
        let (parent_id, name) = self.split_parent(path).await?;
        let kind = kind_hint.unwrap_or_else(|| Kind::from_mode(file_stat.mode));
        let stat = Stat { file: file_stat, id: self.next_id() };
        let node = Node::new(name.clone(), Some(parent_id), stat, kind, Instant::now() + self.ttl.get());
        let id = self.alloc_slot(node);
        let mut nodes = self.nodes.borrow_mut();
        let Kind::Directory(dir) = &mut nodes[parent_id].as_mut().expect("parent present").kind else {
            return Err(Error::NotADirectory);
        };
        dir.insert(name, id);
        Ok(stat)
    }

    pub async fn mknod(&self, path: &PathBuf, mode: u32, dev: u64) -> Result<Stat> {
        self.connection.mknod(path.as_str(), mode, dev).await?;
        let file_stat = self.connection.stat(path.as_str()).await?;
        self.create_entry(path, file_stat, None).await
    }

    pub async fn mkdir(&self, path: &PathBuf, mode: u32) -> Result<Stat> {
        self.connection.mkdir(path.as_str(), mode).await?;
        let file_stat = self.connection.stat(path.as_str()).await?;
        self.create_entry(path, file_stat, Some(Kind::Directory(Directory::default()))).await
    }

    async fn remove(&self, path: &PathBuf, is_dir: bool) -> Result<()> {
        let (parent_id, name) = self.split_parent(path).await?;
        let child_id = {
            let nodes = self.nodes.borrow();
            let Kind::Directory(dir) = &nodes[parent_id].as_ref().expect("parent present").kind else {
                return Err(Error::NotADirectory);
            };
            dir.get(&name).ok_or(Error::NotFound)?
        };

        if is_dir {
            self.connection.rmdir(path.as_str()).await?;
        } else {
            self.connection.unlink(path.as_str()).await?;
        }

        let cache_id = { self.nodes.borrow()[child_id].as_ref().expect("node present").stat.id };
        self.cache.invalidate_one(cache_id, false).await?;

        let mut nodes = self.nodes.borrow_mut();
        if let Kind::Directory(dir) = &mut nodes[parent_id].as_mut().expect("parent present").kind {
            dir.remove(&name);
        }
        drop(nodes);
        self.free_subtree(child_id);
        Ok(())
    }

    pub async fn unlink(&self, path: &PathBuf) -> Result<()> {
        self.remove(path, false).await
    }

    pub async fn rmdir(&self, path: &PathBuf) -> Result<()> {
        self.remove(path, true).await
    }

    pub async fn rename(&self, from: &PathBuf, to: &PathBuf, flags: RenameFlags) -> Result<()> {
        let (from_parent, from_name) = self.split_parent(from).await?;
        let (to_parent, to_name) = self.split_parent(to).await?;

        let from_id = {
            let nodes = self.nodes.borrow();
            let Kind::Directory(dir) = &nodes[from_parent].as_ref().expect("parent present").kind else {
                return Err(Error::NotADirectory);
            };
            dir.get(&from_name).ok_or(Error::NotFound)?
        };

        let to_existing = {
            let nodes = self.nodes.borrow();
            let Kind::Directory(dir) = &nodes[to_parent].as_ref().expect("parent present").kind else {
                return Err(Error::NotADirectory);
            };
            dir.get(&to_name)
        };

        if flags == RenameFlags::NoReplace {
            if let Some(existing) = to_existing {
                let is_error = self.nodes.borrow()[existing].as_ref().expect("node present").kind.as_error().is_some();
                if !is_error {
                    return Err(Error::FileExists);
                }
            }
        }

        self.connection.rename(from.as_str(), to.as_str(), flags).await?;

        if flags == RenameFlags::Exchange {
            let to_id = to_existing.ok_or(Error::NotFound)?;
            self.swap_nodes(from_parent, &from_name, from_id, to_parent, &to_name, to_id)?;
            let (from_cache_id, to_cache_id) = {
                let nodes = self.nodes.borrow();
                (
                    nodes[from_id].as_ref().expect("node present").stat.id,
                    nodes[to_id].as_ref().expect("node present").stat.id,
                )
            };
            self.cache.rename(from_cache_id, to.as_str());
            self.cache.rename(to_cache_id, from.as_str());
            return Ok(());
        }

        if let Some(existing) = to_existing {
            let overwritten_cache_id = { self.nodes.borrow()[existing].as_ref().expect("node present").stat.id };
            self.cache.invalidate_one(overwritten_cache_id, false).await?;
            {
                let mut nodes = self.nodes.borrow_mut();
                if let Kind::Directory(dir) = &mut nodes[to_parent].as_mut().expect("parent present").kind {
                    dir.remove(&to_name);
                }
            }
            self.free_subtree(existing);
        }

        {
            let mut nodes = self.nodes.borrow_mut();
            if let Kind::Directory(dir) = &mut nodes[from_parent].as_mut().expect("parent present").kind {
                dir.remove(&from_name);
            }
        }
        {
            let mut nodes = self.nodes.borrow_mut();
            let node = nodes[from_id].as_mut().expect("node present");
            node.name = to_name.clone();
            node.parent = Some(to_parent);
        }
        {
            let mut nodes = self.nodes.borrow_mut();
            if let Kind::Directory(dir) = &mut nodes[to_parent].as_mut().expect("parent present").kind {
                dir.insert(to_name, from_id);
            }
        }

        let cache_id = { self.nodes.borrow()[from_id].as_ref().expect("node present").stat.id };
        self.cache.rename(cache_id, to.as_str());

        Ok(())
    }

    fn swap_nodes(
        &self,
        from_parent: NodeId,
        from_name: &str,
        from_id: NodeId,
        to_parent: NodeId,
        to_name: &str,
        to_id: NodeId,
    ) -> Result<()> {
        {
            let mut nodes = self.nodes.borrow_mut();
            if let Kind::Directory(dir) = &mut nodes[from_parent].as_mut().expect("parent present").kind {
                dir.insert(from_name.to_string(), to_id);
            }
            if let Kind::Directory(dir) = &mut nodes[to_parent].as_mut().expect("parent present").kind {
                dir.insert(to_name.to_string(), from_id);
            }
        }
        let mut nodes = self.nodes.borrow_mut();
        nodes[from_id].as_mut().expect("node present").name = to_name.to_string();
        nodes[from_id].as_mut().expect("node present").parent = Some(to_parent);
        nodes[to_id].as_mut().expect("node present").name = from_name.to_string();
        nodes[to_id].as_mut().expect("node present").parent = Some(from_parent);
        Ok(())
    }

    /// Resolve a node and check it is (or resolves through) a regular file,
    /// mapping other kinds to the same errno the reference implementation
    /// uses (spec §4.6 `regular_file_prelude`).
    fn check_regular(&self, id: NodeId) -> Result<()> {
        let nodes = self.nodes.borrow();
        match &nodes[id].as_ref().expect("node present").kind {
            Kind::Regular(_) => Ok(()),
            Kind::Directory(_) => Err(Error::IsADirectory),
            Kind::Other => Err(Error::PermissionDenied),
            Kind::Link(_) => Err(Error::InvalidArgument),
            Kind::Error(e) => Err(*e),
        }
    }

    pub async fn truncate(&self, path: &PathBuf, size: i64) -> Result<()> {
        let id = self.resolve(path.as_path()).await?;
        self.check_regular(id)?;
        self.connection.truncate(path.as_str(), size).await?;
        let cache_id = { self.nodes.borrow()[id].as_ref().expect("node present").stat.id };
        self.cache.truncate(cache_id, size);
        let mut nodes = self.nodes.borrow_mut();
        nodes[id].as_mut().expect("node present").stat.file.size = size;
        Ok(())
    }

    pub async fn open(&self, path: &PathBuf, flags: i32) -> Result<u64> {
        let id = self.resolve(path.as_path()).await?;
        self.check_regular(id)?;
        let fd = self.next_fd();
        let mut nodes = self.nodes.borrow_mut();
        let Kind::Regular(regular) = &mut nodes[id].as_mut().expect("node present").kind else {
            unreachable!("checked above")
        };
        regular.open(fd, flags);
        Ok(fd)
    }

    fn cache_id_checked_open(&self, id: NodeId, fd: u64) -> Result<u64> {
        let nodes = self.nodes.borrow();
        let node = nodes[id].as_ref().expect("node present");
        let Kind::Regular(regular) = &node.kind else { return Err(Error::InvalidArgument) };
        if !regular.is_open(fd) {
            return Err(Error::BadFileDescriptor);
        }
        Ok(node.stat.id)
    }

    pub async fn read(&self, path: &PathBuf, fd: u64, out: &mut [u8], offset: i64) -> Result<usize> {
        let id = self.resolve_no_build(path.as_path()).await?;
        let cache_id = self.cache_id_checked_open(id, fd)?;
        self.cache.read(cache_id, path.as_str(), out, offset).await
    }

    pub async fn write(&self, path: &PathBuf, fd: u64, data: &[u8], offset: i64) -> Result<usize> {
        let id = self.resolve_no_build(path.as_path()).await?;
        let cache_id = self.cache_id_checked_open(id, fd)?;
        let n = self.cache.write(cache_id, path.as_str(), data, offset).await?;
        let mut nodes = self.nodes.borrow_mut();
        let Kind::Regular(regular) = &mut nodes[id].as_mut().expect("node present").kind else {
            unreachable!("checked by cache_id_checked_open")
        };
        regular.set_dirty(true);
        let new_end = offset.max(0) as i64 + n as i64;
        if new_end > nodes[id].as_mut().expect("node present").stat.file.size {
            nodes[id].as_mut().expect("node present").stat.file.size = new_end;
        }
        Ok(n)
    }

    pub async fn flush(&self, path: &PathBuf, fd: u64) -> Result<()> {
        let id = self.resolve_no_build(path.as_path()).await?;
        let cache_id = self.cache_id_checked_open(id, fd)?;
        self.cache.flush(cache_id).await?;
        let mut nodes = self.nodes.borrow_mut();
        if let Kind::Regular(regular) = &mut nodes[id].as_mut().expect("node present").kind {
            regular.set_dirty(false);
        }
        Ok(())
    }

    pub async fn release(&self, path: &PathBuf, fd: u64) -> Result<()> {
        let id = self.resolve_no_build(path.as_path()).await?;
        let cache_id = self.cache_id_checked_open(id, fd)?;
        let dirty = {
            let nodes = self.nodes.borrow();
            let Kind::Regular(regular) = &nodes[id].as_ref().expect("node present").kind else {
                return Err(Error::InvalidArgument);
            };
            regular.is_dirty()
        };
        if dirty {
            self.cache.flush(cache_id).await?;
        }
        let mut nodes = self.nodes.borrow_mut();
        let Kind::Regular(regular) = &mut nodes[id].as_mut().expect("node present").kind else {
            unreachable!("checked above")
        };
        regular.set_dirty(false);
        regular.close(fd);
        Ok(())
    }

    pub async fn utimens(&self, path: &PathBuf, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        let id = self.resolve(path.as_path()).await?;
        self.connection.utimens(path.as_str(), atime, mtime).await?;

        let mut nodes = self.nodes.borrow_mut();
        let node = nodes[id].as_mut().expect("node present");
        match atime {
            TimeSpec::Set(t) => node.stat.file.atime = t,
            TimeSpec::Now => node.stat.file.atime = wire_time_now(),
            TimeSpec::Omit => {}
        }
        match mtime {
            TimeSpec::Set(t) => node.stat.file.mtime = t,
            TimeSpec::Now => node.stat.file.mtime = wire_time_now(),
            TimeSpec::Omit => {}
        }
        node.stat.file.ctime = wire_time_now();
        Ok(())
    }

    pub async fn copy_file_range(
        &self,
        in_path: &PathBuf,
        in_offset: i64,
        out_path: &PathBuf,
        out_offset: i64,
        size: u64,
    ) -> Result<u64> {
        let in_id = self.resolve(in_path.as_path()).await?;
        let out_id = self.resolve(out_path.as_path()).await?;
        self.check_regular(in_id)?;
        self.check_regular(out_id)?;

        let in_cache_id = { self.nodes.borrow()[in_id].as_ref().expect("node present").stat.id };
        let out_cache_id = { self.nodes.borrow()[out_id].as_ref().expect("node present").stat.id };
        self.cache.flush(in_cache_id).await?;
        self.cache.flush(out_cache_id).await?;

        let copied = self
            .connection
            .copy_file_range(in_path.as_str(), in_offset, out_path.as_str(), out_offset, size)
            .await?;

        self.cache.invalidate_one(out_cache_id, false).await?;
        let new_stat = self.connection.stat(out_path.as_str()).await?;
        let mut nodes = self.nodes.borrow_mut();
        nodes[out_id].as_mut().expect("node present").stat.file = new_stat;
        Ok(copied)
    }

    /// Flush every regular file still marked dirty (spec §4.7 shutdown).
    pub async fn flush_all(&self) -> Result<()> {
        let dirty_ids: Vec<u64> = {
            let nodes = self.nodes.borrow();
            nodes
                .iter()
                .filter_map(|n| n.as_ref())
                .filter_map(|n| match &n.kind {
                    Kind::Regular(r) if r.is_dirty() => Some(n.stat.id),
                    _ => None,
                })
                .collect()
        };
        for id in dirty_ids {
            self.cache.flush(id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeConnection {
        entries: Mutex<Map<String, FileStat>>,
        links: Mutex<Map<String, String>>,
        dirs: Mutex<Map<String, Vec<String>>>,
        stat_calls: AtomicU32,
    }

    impl FakeConnection {
        fn new() -> Self {
            FakeConnection {
                entries: Mutex::new(Map::new()),
                links: Mutex::new(Map::new()),
                dirs: Mutex::new(Map::new()),
                stat_calls: AtomicU32::new(0),
            }
        }

        fn add_dir(&self, path: &str, mode: u32) {
            self.entries.lock().unwrap().insert(path.to_string(), FileStat { mode: libc::S_IFDIR | mode, ..Default::default() });
        }

        fn add_file(&self, path: &str, size: i64, mode: u32) {
            self.entries
                .lock()
                .unwrap()
                .insert(path.to_string(), FileStat { mode: libc::S_IFREG | mode, size, ..Default::default() });
        }

        fn add_child(&self, parent: &str, name: &str) {
            self.dirs.lock().unwrap().entry(parent.to_string()).or_default().push(name.to_string());
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn statdir(&self, path: &str) -> Result<Vec<(String, FileStat)>> {
            let dirs = self.dirs.lock().unwrap();
            let entries = self.entries.lock().unwrap();
            let Some(names) = dirs.get(path) else { return Ok(Vec::new()) };
            Ok(names
                .iter()
                .filter_map(|name| {
                    let child_path = if path == "/" { format!("/{name}") } else { format!("{path}/{name}") };
                    entries.get(&child_path).map(|stat| (name.clone(), *stat))
                })
                .collect())
        }

        async fn stat(&self, path: &str) -> Result<FileStat> {
            self.stat_calls.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().unwrap().get(path).copied().ok_or(Error::NotFound)
        }

        async fn readlink(&self, path: &str) -> Result<String> {
            self.links.lock().unwrap().get(path).cloned().ok_or(Error::NotFound)
        }

        async fn mknod(&self, path: &str, mode: u32, _dev: u64) -> Result<()> {
            self.entries.lock().unwrap().insert(path.to_string(), FileStat { mode, ..Default::default() });
            Ok(())
        }

        async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
            self.add_dir(path, mode);
            Ok(())
        }

        async fn unlink(&self, path: &str) -> Result<()> {
            self.entries.lock().unwrap().remove(path);
            Ok(())
        }

        async fn rmdir(&self, path: &str) -> Result<()> {
            self.entries.lock().unwrap().remove(path);
            Ok(())
        }

        async fn rename(&self, from: &str, to: &str, _flags: RenameFlags) -> Result<()> {
            let stat = self.entries.lock().unwrap().remove(from);
            if let Some(stat) = stat {
                self.entries.lock().unwrap().insert(to.to_string(), stat);
            }
            Ok(())
        }

        async fn truncate(&self, path: &str, size: i64) -> Result<()> {
            if let Some(stat) = self.entries.lock().unwrap().get_mut(path) {
                stat.size = size;
            }
            Ok(())
        }

        async fn read(&self, _path: &str, _buf: &mut [u8], _offset: i64) -> Result<usize> {
            Ok(0)
        }

        async fn write(&self, _path: &str, data: &[u8], _offset: i64) -> Result<usize> {
            Ok(data.len())
        }

        async fn utimens(&self, _path: &str, _atime: TimeSpec, _mtime: TimeSpec) -> Result<()> {
            Ok(())
        }

        async fn copy_file_range(&self, _in_path: &str, _in_offset: i64, _out_path: &str, _out_offset: i64, size: u64) -> Result<u64> {
            Ok(size)
        }
    }

    fn tree_with(conn: FakeConnection, ttl: Duration) -> FileTree {
        let conn: Rc<dyn Connection> = Rc::new(conn);
        let cache = Rc::new(PageCache::new(conn.clone(), 64 * 1024, 128));
        FileTree::new(conn, cache, ttl)
    }

    #[tokio::test]
    async fn mkdir_then_getattr_resolves_through_root() {
        let conn = FakeConnection::new();
        conn.add_dir("/", 0o755);
        let tree = tree_with(conn, Duration::from_secs(30));

        let path = PathBuf::new("/sub").unwrap();
        tree.mkdir(&path, 0o755).await.unwrap();

        let stat = tree.getattr(&path).await.unwrap();
        assert_eq!(mode_family(stat.file.mode), libc::S_IFDIR);
    }

    #[tokio::test]
    async fn readdir_lists_children_once_fetched() {
        let conn = FakeConnection::new();
        conn.add_dir("/", 0o755);
        conn.add_file("/a.txt", 10, 0o644);
        conn.add_file("/b.txt", 20, 0o644);
        conn.add_child("/", "a.txt");
        conn.add_child("/", "b.txt");
        let tree = tree_with(conn, Duration::from_secs(30));

        let root = PathBuf::root();
        let mut names = Vec::new();
        tree.readdir(&root, &mut |name, _mode| names.push(name.to_string())).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[tokio::test]
    async fn unlink_removes_entry_and_frees_node() {
        let conn = FakeConnection::new();
        conn.add_dir("/", 0o755);
        conn.add_file("/a.txt", 10, 0o644);
        let tree = tree_with(conn, Duration::from_secs(30));

        let path = PathBuf::new("/a.txt").unwrap();
        tree.getattr(&path).await.unwrap();
        tree.unlink(&path).await.unwrap();

        let err = tree.getattr(&path).await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn rmdir_on_nonempty_style_path_still_delegates_to_connection() {
        // The tree itself doesn't enforce "directory not empty" — that's the
        // remote side's job; this just confirms the call reaches it and the
        // node is detached locally afterward.
        let conn = FakeConnection::new();
        conn.add_dir("/", 0o755);
        conn.add_dir("/sub", 0o755);
        let tree = tree_with(conn, Duration::from_secs(30));

        let path = PathBuf::new("/sub").unwrap();
        tree.getattr(&path).await.unwrap();
        tree.rmdir(&path).await.unwrap();
        assert!(matches!(tree.getattr(&path).await.unwrap_err(), Error::NotFound));
    }

    #[tokio::test]
    async fn rename_exchange_swaps_cache_path_mapping() {
        let conn = FakeConnection::new();
        conn.add_dir("/", 0o755);
        conn.add_file("/a.txt", 4, 0o644);
        conn.add_file("/b.txt", 4, 0o644);
        let tree = tree_with(conn, Duration::from_secs(30));

        let a = PathBuf::new("/a.txt").unwrap();
        let b = PathBuf::new("/b.txt").unwrap();

        let fd = tree.open(&a, libc::O_RDWR).await.unwrap();
        tree.write(&a, fd, b"AAAA", 0).await.unwrap();
        tree.flush(&a, fd).await.unwrap();

        let fd2 = tree.open(&b, libc::O_RDWR).await.unwrap();
        tree.write(&b, fd2, b"BBBB", 0).await.unwrap();
        tree.flush(&b, fd2).await.unwrap();

        tree.rename(&a, &b, RenameFlags::Exchange).await.unwrap();

        let mut out = vec![0u8; 4];
        tree.read(&b, fd, &mut out, 0).await.unwrap();
        assert_eq!(&out, b"AAAA");
    }

    #[tokio::test]
    async fn revalidate_skips_refresh_before_ttl_expires() {
        let fake = Rc::new(FakeConnection::new());
        fake.add_dir("/", 0o755);
        fake.add_file("/a.txt", 10, 0o644);
        let conn: Rc<dyn Connection> = fake.clone();
        let cache = Rc::new(PageCache::new(conn.clone(), 64 * 1024, 128));
        let tree = FileTree::new(conn, cache, Duration::from_secs(30));

        let path = PathBuf::new("/a.txt").unwrap();
        let first = tree.getattr(&path).await.unwrap();
        let calls_after_first = fake.stat_calls.load(Ordering::SeqCst);
        let second = tree.getattr(&path).await.unwrap();
        let calls_after_second = fake.stat_calls.load(Ordering::SeqCst);

        assert_eq!(first.file.size, second.file.size);
        assert_eq!(calls_after_first, calls_after_second, "well within TTL, no extra stat calls expected");
    }
}
