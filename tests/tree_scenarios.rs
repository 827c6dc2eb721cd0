//! End-to-end scenarios against the public `FileTree`/`PageCache` API, using
//! a fake `Connection` in place of a real device (spec §8 scenarios 1, 5, 6).

use std::collections::HashMap as Map;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use madbfs::cache::PageCache;
use madbfs::connection::Connection;
use madbfs::error::{Error, Result};
use madbfs::path::PathBuf;
use madbfs::tree::FileTree;
use madbfs::wire::{FileStat, RenameFlags, TimeSpec};

struct FakeConnection {
    entries: Mutex<Map<String, FileStat>>,
    children: Mutex<Map<String, Vec<String>>>,
    size_bumped: AtomicBool,
}

impl FakeConnection {
    fn new() -> Self {
        FakeConnection { entries: Mutex::new(Map::new()), children: Mutex::new(Map::new()), size_bumped: AtomicBool::new(false) }
    }

    fn add_dir(&self, path: &str) {
        self.entries.lock().unwrap().insert(path.to_string(), FileStat { mode: libc::S_IFDIR | 0o755, ..Default::default() });
    }

    fn add_file(&self, path: &str, size: i64) {
        self.entries.lock().unwrap().insert(path.to_string(), FileStat { mode: libc::S_IFREG | 0o644, size, ..Default::default() });
    }

    fn link_child(&self, parent: &str, name: &str) {
        self.children.lock().unwrap().entry(parent.to_string()).or_default().push(name.to_string());
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn statdir(&self, path: &str) -> Result<Vec<(String, FileStat)>> {
        let children = self.children.lock().unwrap();
        let entries = self.entries.lock().unwrap();
        let Some(names) = children.get(path) else { return Ok(Vec::new()) };
        Ok(names
            .iter()
            .filter_map(|name| {
                let child = if path == "/" { format!("/{name}") } else { format!("{path}/{name}") };
                entries.get(&child).map(|stat| (name.clone(), *stat))
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        if path == "/e" && self.size_bumped.load(Ordering::SeqCst) {
            return Ok(FileStat { mode: libc::S_IFREG | 0o644, size: 20, ..Default::default() });
        }
        self.entries.lock().unwrap().get(path).copied().ok_or(Error::NotFound)
    }

    async fn readlink(&self, _path: &str) -> Result<String> {
        Err(Error::InvalidArgument)
    }

    async fn mknod(&self, path: &str, mode: u32, _dev: u64) -> Result<()> {
        self.entries.lock().unwrap().insert(path.to_string(), FileStat { mode, ..Default::default() });
        let parent = PathBuf::new(path).unwrap().parent().to_string();
        let name = PathBuf::new(path).unwrap().filename().to_string();
        self.link_child(&parent, &name);
        Ok(())
    }

    async fn mkdir(&self, path: &str, _mode: u32) -> Result<()> {
        self.add_dir(path);
        let parent = PathBuf::new(path).unwrap().parent().to_string();
        let name = PathBuf::new(path).unwrap().filename().to_string();
        self.link_child(&parent, &name);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(path);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        let has_children = self.children.lock().unwrap().get(path).is_some_and(|c| !c.is_empty());
        if has_children {
            return Err(Error::DirectoryNotEmpty);
        }
        self.entries.lock().unwrap().remove(path);
        Ok(())
    }

    async fn rename(&self, _from: &str, _to: &str, _flags: RenameFlags) -> Result<()> {
        Ok(())
    }

    async fn truncate(&self, _path: &str, _size: i64) -> Result<()> {
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

fn build_tree(conn: Rc<FakeConnection>, ttl: Duration) -> FileTree {
    let conn: Rc<dyn Connection> = conn;
    let cache = Rc::new(PageCache::new(conn.clone(), 64 * 1024, 128));
    FileTree::new(conn, cache, ttl)
}

#[tokio::test]
async fn scenario_create_write_read_back() {
    let fake = Rc::new(FakeConnection::new());
    fake.add_dir("/");
    let tree = build_tree(fake, Duration::from_secs(30));

    let path = PathBuf::new("/a.txt").unwrap();
    tree.mknod(&path, libc::S_IFREG | 0o644, 0).await.unwrap();

    let fd = tree.open(&path, libc::O_RDWR).await.unwrap();
    let n = tree.write(&path, fd, b"hello", 0).await.unwrap();
    assert_eq!(n, 5);

    let mut buf = vec![0u8; 5];
    let n = tree.read(&path, fd, &mut buf, 0).await.unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf, b"hello");

    tree.release(&path, fd).await.unwrap();

    let stat = tree.getattr(&path).await.unwrap();
    assert_eq!(stat.file.size, 5);
}

#[tokio::test]
async fn scenario_directory_not_empty() {
    let fake = Rc::new(FakeConnection::new());
    fake.add_dir("/");
    let tree = build_tree(fake, Duration::from_secs(30));

    let dir = PathBuf::new("/d").unwrap();
    tree.mkdir(&dir, 0o755).await.unwrap();

    let file = PathBuf::new("/d/f").unwrap();
    tree.mknod(&file, libc::S_IFREG | 0o644, 0).await.unwrap();

    let err = tree.rmdir(&dir).await.unwrap_err();
    assert!(matches!(err, Error::DirectoryNotEmpty));

    tree.unlink(&file).await.unwrap();
    tree.rmdir(&dir).await.unwrap();
}

#[tokio::test]
async fn scenario_expiry_refresh_detects_external_change() {
    let fake = Rc::new(FakeConnection::new());
    fake.add_dir("/");
    fake.add_file("/e", 10);
    let ttl = Duration::from_millis(50);
    let tree = build_tree(fake.clone(), ttl);

    let path = PathBuf::new("/e").unwrap();
    let first = tree.getattr(&path).await.unwrap();
    assert_eq!(first.file.size, 10);

    fake.size_bumped.store(true, Ordering::SeqCst);

    let still_cached = tree.getattr(&path).await.unwrap();
    assert_eq!(still_cached.file.size, 10, "within TTL, stale size should still be reported");

    tokio::time::sleep(ttl + Duration::from_millis(50)).await;

    let refreshed = tree.getattr(&path).await.unwrap();
    assert_eq!(refreshed.file.size, 20, "past TTL, getattr should observe the external change");
}
