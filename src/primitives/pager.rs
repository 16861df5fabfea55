#![forbid(unsafe_code)]

//! Paged access to the store file.
//!
//! A [`PagedFile`] layers two tables over positional I/O: an LRU cache of
//! clean frames and a staging table of copy-on-write pages waiting for the
//! next checkpoint. Staged pages shadow the on-disk content until
//! [`PagedFile::flush_staged`] writes them out.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::Result;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::PageId;

/// Tree page size used when the configuration leaves `page_size` at 0.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Pages written between two [`FlushLimiter::pause`] calls during a flush.
const FLUSH_BATCH: usize = 64;

/// Immutable reference to one page frame. Cheap to clone; holders keep the
/// frame alive across cache eviction.
#[derive(Clone)]
pub struct PageRef(Arc<Vec<u8>>);

impl PageRef {
    pub fn new(buf: Vec<u8>) -> Self {
        Self(Arc::new(buf))
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }

    fn same_frame(a: &PageRef, b: &PageRef) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

/// Throttle for checkpoint flushes.
pub trait FlushLimiter {
    /// Called between batches with the number of pages written so far.
    fn pause(&self, pages_flushed: usize);
}

/// No throttling.
pub struct Unlimited;

impl FlushLimiter for Unlimited {
    fn pause(&self, _pages_flushed: usize) {}
}

/// Frame-budget configuration handed to [`PageCache::map`].
pub struct PageCache {
    frames: usize,
}

impl PageCache {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: frames.max(1),
        }
    }

    /// Map `path` as a paged file. Creates the file when `writable` and it
    /// does not exist yet.
    pub fn map(&self, path: &Path, page_size: usize, writable: bool) -> Result<PagedFile> {
        let io = StdFileIo::open(path, writable)?;
        let frames = NonZeroUsize::new(self.frames).expect("frame budget clamped to >= 1");
        Ok(PagedFile {
            io,
            path: path.to_path_buf(),
            page_size,
            cache: Mutex::new(LruCache::new(frames)),
            staged: RwLock::new(HashMap::new()),
        })
    }
}

pub struct PagedFile {
    io: StdFileIo,
    path: PathBuf,
    page_size: usize,
    cache: Mutex<LruCache<PageId, PageRef>>,
    staged: RwLock<HashMap<PageId, PageRef>>,
}

impl PagedFile {
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Read a page: staging table first, then the clean cache, then disk.
    pub fn read_page(&self, id: PageId) -> Result<PageRef> {
        if let Some(frame) = self.staged.read().get(&id) {
            return Ok(frame.clone());
        }
        if let Some(frame) = self.cache.lock().get(&id) {
            return Ok(frame.clone());
        }
        let mut buf = vec![0u8; self.page_size];
        self.io.read_at(id.0 * self.page_size as u64, &mut buf)?;
        let frame = PageRef::new(buf);
        self.cache.lock().put(id, frame.clone());
        Ok(frame)
    }

    /// Stage new content for a page. Visible to subsequent reads, durable
    /// only after [`flush_staged`](Self::flush_staged).
    pub fn stage_page(&self, id: PageId, buf: Vec<u8>) {
        debug_assert_eq!(buf.len(), self.page_size);
        self.staged.write().insert(id, PageRef::new(buf));
        // Drop any stale clean frame for the same id.
        self.cache.lock().pop(&id);
    }

    /// Forget staged content for the given pages (writer abort).
    pub fn discard_staged(&self, ids: &[PageId]) {
        let mut staged = self.staged.write();
        for id in ids {
            staged.remove(id);
        }
    }

    /// Write all staged pages to disk in id order and fsync. Pages re-staged
    /// concurrently keep their new content for the next flush.
    pub fn flush_staged(&self, limiter: &dyn FlushLimiter) -> Result<usize> {
        let snapshot: Vec<(PageId, PageRef)> = {
            let staged = self.staged.read();
            let mut pages: Vec<_> = staged.iter().map(|(k, v)| (*k, v.clone())).collect();
            pages.sort_by_key(|(id, _)| *id);
            pages
        };
        for (flushed, (id, frame)) in snapshot.iter().enumerate() {
            self.io
                .write_at(id.0 * self.page_size as u64, frame.data())?;
            if flushed > 0 && flushed % FLUSH_BATCH == 0 {
                limiter.pause(flushed);
            }
        }
        self.io.sync_all()?;
        let mut staged = self.staged.write();
        let mut cache = self.cache.lock();
        for (id, frame) in snapshot.iter() {
            match staged.get(id) {
                Some(current) if PageRef::same_frame(current, frame) => {
                    staged.remove(id);
                    cache.put(*id, frame.clone());
                }
                // Re-staged mid-flush; leave it for the next checkpoint.
                _ => {}
            }
        }
        debug!(pages = snapshot.len(), "flushed staged pages");
        Ok(snapshot.len())
    }

    /// Uncached read used for the meta and state pages.
    pub fn read_page_direct(&self, id: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        self.io.read_at(id.0 * self.page_size as u64, &mut buf)?;
        Ok(buf)
    }

    /// Uncached write-and-sync used for the meta and state pages.
    pub fn write_page_direct(&self, id: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        self.io.write_at(id.0 * self.page_size as u64, buf)?;
        self.io.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mapped(dir: &Path) -> PagedFile {
        PageCache::new(4)
            .map(&dir.join("pages"), 128, true)
            .unwrap()
    }

    #[test]
    fn staged_pages_shadow_disk_until_flushed() {
        let dir = tempdir().unwrap();
        let file = mapped(dir.path());
        file.write_page_direct(PageId(0), &[1u8; 128]).unwrap();
        file.stage_page(PageId(0), vec![2u8; 128]);
        assert_eq!(file.read_page(PageId(0)).unwrap().data()[0], 2);
        file.flush_staged(&Unlimited).unwrap();
        assert_eq!(file.read_page_direct(PageId(0)).unwrap()[0], 2);
    }

    #[test]
    fn discard_restores_disk_content() {
        let dir = tempdir().unwrap();
        let file = mapped(dir.path());
        file.write_page_direct(PageId(3), &[7u8; 128]).unwrap();
        file.stage_page(PageId(3), vec![9u8; 128]);
        file.discard_staged(&[PageId(3)]);
        assert_eq!(file.read_page(PageId(3)).unwrap().data()[0], 7);
    }

    #[test]
    fn eviction_keeps_held_frames_alive() {
        let dir = tempdir().unwrap();
        let file = mapped(dir.path());
        for id in 0..8u64 {
            file.write_page_direct(PageId(id), &[id as u8; 128]).unwrap();
        }
        let held = file.read_page(PageId(0)).unwrap();
        for id in 1..8u64 {
            file.read_page(PageId(id)).unwrap();
        }
        assert_eq!(held.data()[0], 0);
    }
}
