//! Id-keyed, page-indexed LRU cache with single-flight fills (spec C6).
//!
//! The cache lives entirely on the single-threaded executor the rest of the
//! core runs on (spec §5: "no locks required"), so its state is guarded by a
//! plain [`RefCell`] rather than an async mutex. Every method is careful to
//! drop its borrow before crossing an `.await` point — two RefCell borrows
//! would otherwise conflict if a second cooperative task ran while the first
//! was suspended mid-fill.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use tokio::sync::watch;
use tracing::warn;

use crate::connection::Connection;
use crate::error::{Error, Result};

type PageKey = (u64, usize);

struct Page {
    data: Vec<u8>,
    len: usize,
    dirty: bool,
}

impl Page {
    fn blank(page_size: usize) -> Self {
        Page { data: vec![0u8; page_size], len: 0, dirty: false }
    }

    fn read(&self, out: &mut [u8], offset: usize) -> usize {
        if offset >= self.len {
            return 0;
        }
        let n = (self.len - offset).min(out.len());
        out[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }

    fn write(&mut self, data: &[u8], offset: usize) -> usize {
        if offset >= self.data.len() {
            return 0;
        }
        let n = (self.data.len() - offset).min(data.len());
        self.data[offset..offset + n].copy_from_slice(&data[..n]);
        self.len = self.len.max(offset + n);
        n
    }

    fn truncate(&mut self, size: usize) {
        self.len = self.len.min(size);
    }
}

struct LruEntry {
    key: PageKey,
    page: Page,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Arena-backed doubly linked list: O(1) insert-front, touch, and
/// tail-eviction without the aliasing issues an intrusive `std::list`-style
/// structure would run into under the borrow checker.
struct Lru {
    slots: Vec<Option<LruEntry>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl Lru {
    fn new() -> Self {
        Lru { slots: Vec::new(), free: Vec::new(), head: None, tail: None, len: 0 }
    }

    fn insert_front(&mut self, key: PageKey, page: Page) -> usize {
        let idx = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[idx] = Some(LruEntry { key, page, prev: None, next: self.head });
        if let Some(h) = self.head {
            self.slots[h].as_mut().expect("head slot present").prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.len += 1;
        idx
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let e = self.slots[idx].as_ref().expect("slot present");
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().expect("prev present").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().expect("next present").prev = prev,
            None => self.tail = prev,
        }
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        let old_head = self.head;
        {
            let entry = self.slots[idx].as_mut().expect("slot present");
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h].as_mut().expect("head present").prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn remove(&mut self, idx: usize) -> Page {
        self.unlink(idx);
        let entry = self.slots[idx].take().expect("slot present");
        self.free.push(idx);
        self.len -= 1;
        entry.page
    }

    fn pop_back(&mut self) -> Option<(PageKey, Page)> {
        let idx = self.tail?;
        self.unlink(idx);
        let entry = self.slots[idx].take().expect("tail slot present");
        self.free.push(idx);
        self.len -= 1;
        Some((entry.key, entry.page))
    }

    fn page(&self, idx: usize) -> &Page {
        &self.slots[idx].as_ref().expect("slot present").page
    }

    fn page_mut(&mut self, idx: usize) -> &mut Page {
        &mut self.slots[idx].as_mut().expect("slot present").page
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }
}

struct FileEntry {
    pages: BTreeMap<usize, usize>,
    path: String,
}

type FillResult = Option<std::result::Result<(), Error>>;

struct CacheState {
    lru: Lru,
    files: HashMap<u64, FileEntry>,
    inflight: HashMap<PageKey, watch::Receiver<FillResult>>,
    page_size: usize,
    max_pages: usize,
}

/// Round up to the next power of two, with a floor (spec requires page size
/// `>= 64 KiB`, enforced by callers before construction).
fn next_pow2(x: usize) -> usize {
    if x <= 1 {
        1
    } else {
        1usize << (usize::BITS - (x - 1).leading_zeros())
    }
}

/// Page cache for regular-file I/O (spec C6).
pub struct PageCache {
    connection: Rc<dyn Connection>,
    state: RefCell<CacheState>,
}

impl PageCache {
    pub fn new(connection: Rc<dyn Connection>, page_size: usize, max_pages: usize) -> Self {
        let state = CacheState {
            lru: Lru::new(),
            files: HashMap::new(),
            inflight: HashMap::new(),
            page_size: next_pow2(page_size),
            max_pages,
        };
        Self { connection, state: RefCell::new(state) }
    }

    pub fn page_size(&self) -> usize {
        self.state.borrow().page_size
    }

    pub fn max_pages(&self) -> usize {
        self.state.borrow().max_pages
    }

    /// Fill (or wait for a concurrent fill of) a page needed for a read.
    async fn ensure_page_filled(&self, id: u64, path: &str, index: usize) -> Result<()> {
        loop {
            enum Probe {
                Ready,
                Wait(watch::Receiver<FillResult>),
                Fill(watch::Sender<FillResult>),
            }

            let probe = {
                let mut state = self.state.borrow_mut();
                if state.files.get(&id).and_then(|f| f.pages.get(&index)).is_some() {
                    Probe::Ready
                } else if let Some(rx) = state.inflight.get(&(id, index)) {
                    Probe::Wait(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    state.inflight.insert((id, index), rx);
                    Probe::Fill(tx)
                }
            };

            match probe {
                Probe::Ready => return Ok(()),
                Probe::Wait(mut rx) => {
                    rx.changed().await.map_err(|_| Error::OperationCanceled)?;
                    match rx.borrow().clone() {
                        Some(Err(e)) => return Err(e),
                        _ => continue,
                    }
                }
                Probe::Fill(tx) => {
                    let page_size = self.state.borrow().page_size;
                    let mut buf = vec![0u8; page_size];
                    let offset = (index * page_size) as i64;
                    let result = self.connection.read(path, &mut buf, offset).await;

                    let mut state = self.state.borrow_mut();
                    state.inflight.remove(&(id, index));

                    match result {
                        Ok(n) => {
                            let page = Page { data: buf, len: n, dirty: false };
                            let slot = state.lru.insert_front((id, index), page);
                            state
                                .files
                                .entry(id)
                                .or_insert_with(|| FileEntry { pages: BTreeMap::new(), path: path.to_string() })
                                .pages
                                .insert(index, slot);
                            let over = state.lru.len.saturating_sub(state.max_pages);
                            let _ = tx.send(Some(Ok(())));
                            drop(state);
                            if over > 0 {
                                self.evict(over).await;
                            }
                            return Ok(());
                        }
                        Err(e) => {
                            let _ = tx.send(Some(Err(e)));
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Materialize (or wait for a concurrent fill of) a page needed for a
    /// write. Unlike reads, a miss never fetches from the remote: a write
    /// covering only part of a brand-new page leaves the rest zero-filled,
    /// matching the reference implementation.
    async fn ensure_page_for_write(&self, id: u64, path: &str, index: usize) -> Result<()> {
        loop {
            enum Probe {
                Ready,
                Wait(watch::Receiver<FillResult>),
                Create,
            }

            let probe = {
                let state = self.state.borrow();
                if state.files.get(&id).and_then(|f| f.pages.get(&index)).is_some() {
                    Probe::Ready
                } else if let Some(rx) = state.inflight.get(&(id, index)) {
                    Probe::Wait(rx.clone())
                } else {
                    Probe::Create
                }
            };

            match probe {
                Probe::Ready => return Ok(()),
                Probe::Wait(mut rx) => {
                    rx.changed().await.map_err(|_| Error::OperationCanceled)?;
                    match rx.borrow().clone() {
                        Some(Err(e)) => return Err(e),
                        _ => continue,
                    }
                }
                Probe::Create => {
                    let mut state = self.state.borrow_mut();
                    let page_size = state.page_size;
                    let page = Page::blank(page_size);
                    let slot = state.lru.insert_front((id, index), page);
                    state
                        .files
                        .entry(id)
                        .or_insert_with(|| FileEntry { pages: BTreeMap::new(), path: path.to_string() })
                        .pages
                        .insert(index, slot);
                    let over = state.lru.len.saturating_sub(state.max_pages);
                    drop(state);
                    if over > 0 {
                        self.evict(over).await;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Evict from the LRU tail until `count` pages have been dropped,
    /// force-flushing dirty ones first. Flush failure is logged, not
    /// propagated — eviction always proceeds (spec §4.5).
    async fn evict(&self, mut count: usize) {
        while count > 0 {
            let popped = {
                let mut state = self.state.borrow_mut();
                state.lru.pop_back()
            };
            let Some((key, page)) = popped else { break };
            count -= 1;
            let (id, index) = key;

            let path = {
                let mut state = self.state.borrow_mut();
                let path = state.files.get(&id).map(|f| f.path.clone());
                if let Some(file) = state.files.get_mut(&id) {
                    file.pages.remove(&index);
                    if file.pages.is_empty() {
                        state.files.remove(&id);
                    }
                }
                path
            };

            if page.dirty {
                if let Some(path) = path {
                    let page_size = self.state.borrow().page_size;
                    let offset = (index * page_size) as i64;
                    if let Err(e) = self.connection.write(&path, &page.data[..page.len], offset).await {
                        warn!(id, index, error = ?e, "failed to force-flush evicted page");
                    }
                }
            }
        }
    }

    /// Read `out.len()` bytes of file `id` at `offset`, fanning out across
    /// however many pages the range spans (spec §4.5, §8 page-boundary law).
    pub async fn read(&self, id: u64, path: &str, out: &mut [u8], offset: i64) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let page_size = self.state.borrow().page_size;
        let offset = offset.max(0) as usize;
        let first = offset / page_size;
        let last = (offset + out.len() - 1) / page_size;
        let off = offset % page_size;

        let mut total = 0usize;
        for index in first..=last {
            self.ensure_page_filled(id, path, index).await?;

            let mut state = self.state.borrow_mut();
            let slot = *state
                .files
                .get(&id)
                .and_then(|f| f.pages.get(&index))
                .expect("page just filled");
            state.lru.touch(slot);

            let mut local_offset = 0usize;
            let mut local_size = page_size;
            if index == first {
                local_offset = off;
                local_size -= local_offset;
            }
            if index == last {
                local_size = (out.len() + off - 1) % page_size + 1;
                local_size -= local_offset;
            }
            let out_off = if index > first { (index - first) * page_size - off } else { 0 };

            let n = state.lru.page(slot).read(&mut out[out_off..out_off + local_size], local_offset);
            total += n;
        }
        Ok(total)
    }

    /// Write `data` to file `id` at `offset`, creating pages as needed
    /// (spec §4.5).
    pub async fn write(&self, id: u64, path: &str, data: &[u8], offset: i64) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let page_size = self.state.borrow().page_size;
        let offset = offset.max(0) as usize;
        let first = offset / page_size;
        let last = (offset + data.len() - 1) / page_size;

        let mut total = 0usize;
        for index in first..=last {
            self.ensure_page_for_write(id, path, index).await?;

            let mut state = self.state.borrow_mut();
            let slot = *state
                .files
                .get(&id)
                .and_then(|f| f.pages.get(&index))
                .expect("page just created");
            state.lru.touch(slot);

            let local_offset = if index == first { offset % page_size } else { 0 };
            let write_len = (page_size - local_offset).min(data.len() - total);

            let page = state.lru.page_mut(slot);
            let n = page.write(&data[total..total + write_len], local_offset);
            page.dirty = true;
            total += n;
        }
        Ok(total)
    }

    /// Write back all dirty pages of `id`, in ascending page-index order
    /// (spec §4.5, §8: dirty bit cleared only after successful write).
    pub async fn flush(&self, id: u64) -> Result<()> {
        let num_pages = match self.state.borrow().files.get(&id) {
            Some(file) => file.pages.keys().next_back().map(|&i| i + 1).unwrap_or(0),
            None => return Ok(()),
        };

        for index in 0..num_pages {
            let (path, dirty_bytes) = {
                let state = self.state.borrow();
                let Some(file) = state.files.get(&id) else { return Ok(()) };
                let path = file.path.clone();
                match file.pages.get(&index) {
                    Some(&slot) => {
                        let page = state.lru.page(slot);
                        if page.dirty {
                            (path, Some(page.data[..page.len].to_vec()))
                        } else {
                            (path, None)
                        }
                    }
                    None => (path, None),
                }
            };

            if let Some(bytes) = dirty_bytes {
                let page_size = self.state.borrow().page_size;
                let offset = (index * page_size) as i64;
                self.connection.write(&path, &bytes, offset).await?;

                let mut state = self.state.borrow_mut();
                if let Some(&slot) = state.files.get(&id).and_then(|f| f.pages.get(&index)) {
                    state.lru.page_mut(slot).dirty = false;
                }
            }
        }
        Ok(())
    }

    /// Drop pages beyond the new size; clamp the new last page's occupancy.
    /// Discarded dirty data is never written back (spec §4.5).
    pub fn truncate(&self, id: u64, new_size: i64) {
        let new_size = new_size.max(0) as usize;
        let mut state = self.state.borrow_mut();
        let page_size = state.page_size;
        let keep_last: Option<usize> = if new_size == 0 { None } else { Some((new_size - 1) / page_size) };

        let to_drop: Vec<usize> = match state.files.get(&id) {
            Some(file) => file
                .pages
                .keys()
                .copied()
                .filter(|&idx| keep_last.map(|k| idx > k).unwrap_or(true))
                .collect(),
            None => Vec::new(),
        };

        for idx in to_drop {
            if let Some(slot) = state.files.get_mut(&id).and_then(|f| f.pages.remove(&idx)) {
                state.lru.remove(slot);
            }
        }

        if let Some(keep_idx) = keep_last {
            if let Some(&slot) = state.files.get(&id).and_then(|f| f.pages.get(&keep_idx)) {
                let local_len = new_size - keep_idx * page_size;
                state.lru.page_mut(slot).truncate(local_len);
            }
        }
    }

    /// Update the stored path for `id`. Does nothing if `id` has no cached
    /// pages (spec §4.5: "updates the stored path only").
    pub fn rename(&self, id: u64, new_path: &str) {
        let mut state = self.state.borrow_mut();
        if let Some(file) = state.files.get_mut(&id) {
            file.path = new_path.to_string();
        }
    }

    /// Remove all pages for `id`, optionally flushing dirty ones first.
    pub async fn invalidate_one(&self, id: u64, should_flush: bool) -> Result<()> {
        if should_flush {
            self.flush(id).await?;
        }
        let mut state = self.state.borrow_mut();
        if let Some(file) = state.files.remove(&id) {
            for (_, slot) in file.pages {
                state.lru.remove(slot);
            }
        }
        Ok(())
    }

    /// Flush everything dirty, then drop every page.
    pub async fn invalidate_all(&self) -> Result<()> {
        let ids: Vec<u64> = self.state.borrow().files.keys().copied().collect();
        for id in ids {
            self.flush(id).await?;
        }
        let mut state = self.state.borrow_mut();
        state.files.clear();
        state.lru.clear();
        state.inflight.clear();
        Ok(())
    }

    /// Change the page size. Drops cached content without flushing, matching
    /// the reference implementation's behavior for this rare admin action.
    pub fn set_page_size(&self, new_page_size: usize) {
        let mut state = self.state.borrow_mut();
        state.page_size = next_pow2(new_page_size);
        state.files.clear();
        state.lru.clear();
        state.inflight.clear();
    }

    /// Change the max page budget. Drops cached content without flushing.
    pub fn set_max_pages(&self, new_max_pages: usize) {
        let mut state = self.state.borrow_mut();
        state.max_pages = new_max_pages;
        state.files.clear();
        state.lru.clear();
        state.inflight.clear();
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
        files: Mutex<Map<String, Vec<u8>>>,
        read_calls: AtomicU32,
    }

    impl FakeConnection {
        fn new() -> Self {
            FakeConnection { files: Mutex::new(Map::new()), read_calls: AtomicU32::new(0) }
        }

        fn seed(&self, path: &str, data: Vec<u8>) {
            self.files.lock().unwrap().insert(path.to_string(), data);
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn statdir(&self, _: &str) -> Result<Vec<(String, crate::wire::FileStat)>> {
            unimplemented!()
        }
        async fn stat(&self, _: &str) -> Result<crate::wire::FileStat> {
            unimplemented!()
        }
        async fn readlink(&self, _: &str) -> Result<String> {
            unimplemented!()
        }
        async fn mknod(&self, _: &str, _: u32, _: u64) -> Result<()> {
            unimplemented!()
        }
        async fn mkdir(&self, _: &str, _: u32) -> Result<()> {
            unimplemented!()
        }
        async fn unlink(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn rmdir(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn rename(&self, _: &str, _: &str, _: crate::wire::RenameFlags) -> Result<()> {
            unimplemented!()
        }
        async fn truncate(&self, _: &str, _: i64) -> Result<()> {
            unimplemented!()
        }
        async fn read(&self, path: &str, buf: &mut [u8], offset: i64) -> Result<usize> {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            let files = self.files.lock().unwrap();
            let Some(data) = files.get(path) else { return Err(Error::NotFound) };
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = (data.len() - offset).min(buf.len());
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }
        async fn write(&self, path: &str, data: &[u8], offset: i64) -> Result<usize> {
            let mut files = self.files.lock().unwrap();
            let entry = files.entry(path.to_string()).or_default();
            let offset = offset as usize;
            if entry.len() < offset + data.len() {
                entry.resize(offset + data.len(), 0);
            }
            entry[offset..offset + data.len()].copy_from_slice(data);
            Ok(data.len())
        }
        async fn utimens(&self, _: &str, _: crate::wire::TimeSpec, _: crate::wire::TimeSpec) -> Result<()> {
            unimplemented!()
        }
        async fn copy_file_range(&self, _: &str, _: i64, _: &str, _: i64, _: u64) -> Result<u64> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn write_then_read_same_range_round_trips() {
        let conn: Rc<dyn Connection> = Rc::new(FakeConnection::new());
        let cache = PageCache::new(conn, 64 * 1024, 128);

        let data = b"hello world";
        let n = cache.write(1, "/a.txt", data, 0).await.unwrap();
        assert_eq!(n, data.len());

        let mut out = vec![0u8; data.len()];
        let n = cache.read(1, "/a.txt", &mut out, 0).await.unwrap();
        assert_eq!(n, data.len());
        assert_eq!(&out, data);
    }

    #[tokio::test]
    async fn page_boundary_write_and_read() {
        let conn: Rc<dyn Connection> = Rc::new(FakeConnection::new());
        let page_size = 64 * 1024;
        let cache = PageCache::new(conn, page_size, 128);

        let total = 100 * 1024;
        let pattern: Vec<u8> = (0..total).map(|i| (i % 256) as u8).collect();
        cache.write(1, "/b.bin", &pattern, 0).await.unwrap();

        let mut out = vec![0u8; total];
        cache.read(1, "/b.bin", &mut out, 0).await.unwrap();
        assert_eq!(out, pattern);

        let mut tail = vec![0u8; 4096];
        cache.read(1, "/b.bin", &mut tail, page_size as i64).await.unwrap();
        let expected: Vec<u8> = (page_size..page_size + 4096).map(|i| (i % 256) as u8).collect();
        assert_eq!(tail, expected);
    }

    #[tokio::test]
    async fn single_flight_fill_issues_one_connection_read() {
        let fake = Rc::new(FakeConnection::new());
        fake.seed("/c.bin", vec![7u8; 200 * 1024]);
        let conn: Rc<dyn Connection> = fake.clone();
        let cache = Rc::new(PageCache::new(conn, 64 * 1024, 128));

        let c1 = cache.clone();
        let c2 = cache.clone();
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let t1 = tokio::task::spawn_local(async move {
                    let mut out = vec![0u8; 4096];
                    c1.read(1, "/c.bin", &mut out, 0).await.unwrap();
                    out
                });
                let t2 = tokio::task::spawn_local(async move {
                    let mut out = vec![0u8; 4096];
                    c2.read(1, "/c.bin", &mut out, 0).await.unwrap();
                    out
                });
                let (a, b) = tokio::join!(t1, t2);
                assert_eq!(a.unwrap(), b.unwrap());
            })
            .await;

        assert_eq!(fake.read_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn truncate_drops_trailing_pages_and_clamps_last() {
        let conn: Rc<dyn Connection> = Rc::new(FakeConnection::new());
        let page_size = 64 * 1024;
        let cache = PageCache::new(conn, page_size, 128);

        let data = vec![1u8; page_size * 2];
        cache.write(1, "/d.bin", &data, 0).await.unwrap();
        cache.truncate(1, (page_size + 10) as i64);

        let mut out = vec![0u8; page_size];
        let n = cache.read(1, "/d.bin", &mut out, page_size as i64).await.unwrap();
        assert_eq!(n, 10);
    }

    #[tokio::test]
    async fn flush_clears_dirty_bit() {
        let conn: Rc<dyn Connection> = Rc::new(FakeConnection::new());
        let cache = PageCache::new(conn, 64 * 1024, 128);
        cache.write(1, "/e.txt", b"data", 0).await.unwrap();
        cache.flush(1).await.unwrap();
        cache.invalidate_one(1, true).await.unwrap();
    }
}
