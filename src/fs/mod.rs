//! Bridges `fuser`'s inode-addressed kernel callbacks to the tree's
//! path-addressed API (spec C8 "filesystem callback threads").
//!
//! The reference implementation rides libfuse's high-level, path-passthrough
//! API, which maintains the inode table internally and calls back with full
//! paths. `fuser` only exposes the low-level, inode-addressed kernel
//! protocol, so this module keeps that table itself: a bidirectional
//! `ino <-> path` map, populated by `lookup` and `readdir` the way any
//! inode-numbered filesystem over a path-oriented backend does.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, TimeOrNow,
};

use crate::error::Error;
use crate::orchestrator::{Core, Orchestrator};
use crate::path::PathBuf as RemotePathBuf;
use crate::tree::node::Stat;
use crate::wire::{RenameFlags, TimeSpec, WireTime};

const ROOT_INO: u64 = 1;
const ATTR_TTL: Duration = Duration::from_secs(1);

struct InodeTable {
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut t = InodeTable { path_to_ino: HashMap::new(), ino_to_path: HashMap::new(), next_ino: 2 };
        t.path_to_ino.insert("/".to_string(), ROOT_INO);
        t.ino_to_path.insert(ROOT_INO, "/".to_string());
        t
    }

    fn path_of(&self, ino: u64) -> Option<RemotePathBuf> {
        self.ino_to_path.get(&ino).and_then(|p| RemotePathBuf::new(p).ok())
    }

    /// Intern `path`, returning its stable inode number.
    fn intern(&mut self, path: &RemotePathBuf) -> u64 {
        let key = path.as_str().to_string();
        if let Some(&ino) = self.path_to_ino.get(&key) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(key.clone(), ino);
        self.ino_to_path.insert(ino, key);
        ino
    }

    fn forget_path(&mut self, path: &RemotePathBuf) {
        if let Some(ino) = self.path_to_ino.remove(path.as_str()) {
            self.ino_to_path.remove(&ino);
        }
    }
}

fn mode_to_filetype(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn wire_time_to_system(t: WireTime) -> SystemTime {
    if t.seconds >= 0 {
        UNIX_EPOCH + Duration::new(t.seconds as u64, t.nanos.max(0) as u32)
    } else {
        UNIX_EPOCH - Duration::new((-t.seconds) as u64, 0)
    }
}

fn system_to_wire_time(t: SystemTime) -> WireTime {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => WireTime { seconds: d.as_secs() as i64, nanos: d.subsec_nanos() as i64 },
        Err(_) => WireTime { seconds: 0, nanos: 0 },
    }
}

fn stat_to_attr(ino: u64, stat: Stat) -> FileAttr {
    let file = stat.file;
    let kind = mode_to_filetype(file.mode);
    FileAttr {
        ino,
        size: file.size.max(0) as u64,
        blocks: (file.size.max(0) as u64).div_ceil(512),
        atime: wire_time_to_system(file.atime),
        mtime: wire_time_to_system(file.mtime),
        ctime: wire_time_to_system(file.ctime),
        crtime: wire_time_to_system(file.ctime),
        kind,
        perm: (file.mode & 0o7777) as u16,
        nlink: file.links.max(1),
        uid: file.uid,
        gid: file.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn errno(e: Error) -> i32 {
    e.to_fuser_errno()
}

/// `fuser::Filesystem` implementation delegating everything to the
/// orchestrator's core over path-addressed tree calls.
pub struct MadbfsFs {
    orchestrator: Orchestrator,
    inodes: Arc<Mutex<InodeTable>>,
}

impl MadbfsFs {
    pub fn new(orchestrator: Orchestrator) -> Self {
        MadbfsFs { orchestrator, inodes: Arc::new(Mutex::new(InodeTable::new())) }
    }

    fn path_for(&self, ino: u64) -> Result<RemotePathBuf, i32> {
        self.inodes.lock().unwrap().path_of(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<RemotePathBuf, i32> {
        let parent_path = self.path_for(parent)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        parent_path.extend_copy(name).map_err(|e| errno(e))
    }

    fn intern(&self, path: &RemotePathBuf) -> u64 {
        self.inodes.lock().unwrap().intern(path)
    }
}

/// Run `f` on the orchestrator's core, blocking this callback thread.
fn run<F, T>(orch: &Orchestrator, f: F) -> Result<T, i32>
where
    F: FnOnce(std::rc::Rc<Core>) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, Error>>>>
        + Send
        + 'static,
    T: Send + 'static,
{
    orch.block_on(f).map_err(errno).and_then(|r| r.map_err(errno))
}

impl Filesystem for MadbfsFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let for_stat = path.clone();
        match run(&self.orchestrator, move |core| Box::pin(async move { core.tree.getattr(&for_stat).await })) {
            Ok(stat) => {
                let ino = self.intern(&path);
                reply.entry(&ATTR_TTL, &stat_to_attr(ino, stat), 0)
            }
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match run(&self.orchestrator, move |core| Box::pin(async move { core.tree.getattr(&path).await })) {
            Ok(stat) => reply.attr(&ATTR_TTL, &stat_to_attr(ino, stat)),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        let to_timespec = |t: Option<TimeOrNow>| match t {
            None => TimeSpec::Omit,
            Some(TimeOrNow::Now) => TimeSpec::Now,
            Some(TimeOrNow::SpecificTime(t)) => TimeSpec::Set(system_to_wire_time(t)),
        };
        let atime = to_timespec(atime);
        let mtime = to_timespec(mtime);

        let path2 = path.clone();
        let result: Result<(), i32> = (|| {
            if let Some(size) = size {
                run(&self.orchestrator, {
                    let path = path2.clone();
                    move |core| Box::pin(async move { core.tree.truncate(&path, size as i64).await })
                })?;
            }
            if atime != TimeSpec::Omit || mtime != TimeSpec::Omit {
                run(&self.orchestrator, {
                    let path = path2.clone();
                    move |core| Box::pin(async move { core.tree.utimens(&path, atime, mtime).await })
                })?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            return reply.error(e);
        }

        match run(&self.orchestrator, move |core| Box::pin(async move { core.tree.getattr(&path).await })) {
            Ok(stat) => reply.attr(&ATTR_TTL, &stat_to_attr(ino, stat)),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match run(&self.orchestrator, move |core| Box::pin(async move { core.tree.readlink(&path).await })) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let for_tree = path.clone();
        match run(&self.orchestrator, move |core| {
            Box::pin(async move { core.tree.mknod(&for_tree, mode, rdev as u64).await })
        }) {
            Ok(stat) => {
                let ino = self.intern(&path);
                reply.entry(&ATTR_TTL, &stat_to_attr(ino, stat), 0)
            }
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let for_tree = path.clone();
        match run(&self.orchestrator, move |core| Box::pin(async move { core.tree.mkdir(&for_tree, mode).await })) {
            Ok(stat) => {
                let ino = self.intern(&path);
                reply.entry(&ATTR_TTL, &stat_to_attr(ino, stat), 0)
            }
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let for_tree = path.clone();
        match run(&self.orchestrator, move |core| Box::pin(async move { core.tree.unlink(&for_tree).await })) {
            Ok(()) => {
                self.inodes.lock().unwrap().forget_path(&path);
                reply.ok()
            }
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let for_tree = path.clone();
        match run(&self.orchestrator, move |core| Box::pin(async move { core.tree.rmdir(&for_tree).await })) {
            Ok(()) => {
                self.inodes.lock().unwrap().forget_path(&path);
                reply.ok()
            }
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let to = match self.child_path(newparent, newname) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let rename_flags = if flags & libc::RENAME_EXCHANGE as u32 != 0 {
            RenameFlags::Exchange
        } else if flags & libc::RENAME_NOREPLACE as u32 != 0 {
            RenameFlags::NoReplace
        } else {
            RenameFlags::None
        };

        let (from2, to2) = (from.clone(), to.clone());
        match run(&self.orchestrator, move |core| {
            Box::pin(async move { core.tree.rename(&from2, &to2, rename_flags).await })
        }) {
            Ok(()) => {
                let mut table = self.inodes.lock().unwrap();
                if let Some(ino) = table.path_to_ino.remove(from.as_str()) {
                    table.ino_to_path.insert(ino, to.as_str().to_string());
                    table.path_to_ino.insert(to.as_str().to_string(), ino);
                }
                reply.ok()
            }
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match run(&self.orchestrator, move |core| Box::pin(async move { core.tree.open(&path, flags).await })) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let result: Result<Vec<u8>, i32> = run(&self.orchestrator, move |core| {
            Box::pin(async move {
                let mut buf = vec![0u8; size as usize];
                let n = core.tree.read(&path, fh, &mut buf, offset).await?;
                buf.truncate(n);
                Ok(buf)
            })
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let data = data.to_vec();
        match run(&self.orchestrator, move |core| {
            Box::pin(async move { core.tree.write(&path, fh, &data, offset).await })
        }) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match run(&self.orchestrator, move |core| Box::pin(async move { core.tree.flush(&path, fh).await })) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match run(&self.orchestrator, move |core| Box::pin(async move { core.tree.release(&path, fh).await })) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let for_tree = path.clone();
        let children: Result<Vec<(String, u32)>, i32> = run(&self.orchestrator, move |core| {
            Box::pin(async move {
                let mut children = Vec::new();
                core.tree.readdir(&for_tree, &mut |name, mode| children.push((name.to_string(), mode))).await?;
                Ok(children)
            })
        });

        let children = match children {
            Ok(c) => c,
            Err(e) => return reply.error(e),
        };

        let parent_ino = if path.is_root() { ROOT_INO } else { self.intern(&path.parent_path()) };
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for (name, mode) in children {
            let child_path = match path.extend_copy(&name) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let child_ino = self.intern(&child_path);
            entries.push((child_ino, mode_to_filetype(mode), name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        ino_in: u64,
        _fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        _fh_out: u64,
        offset_out: i64,
        len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        let in_path = match self.path_for(ino_in) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let out_path = match self.path_for(ino_out) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match run(&self.orchestrator, move |core| {
            Box::pin(async move { core.tree.copy_file_range(&in_path, offset_in, &out_path, offset_out, len).await })
        }) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e),
        }
    }

    fn destroy(&mut self) {
        self.orchestrator.stop();
    }
}
