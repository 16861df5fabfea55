use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{FarolError, Result};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::pager::{FlushLimiter, PageCache, PagedFile, Unlimited, DEFAULT_PAGE_SIZE};
use crate::types::PageId;

use super::cleanup::{self, CleanupWorkCollector, TreeEvent, TreeEventSink};
use super::cursor::Seeker;
use super::layout::Layout;
use super::node::{self, NodeKind};
use super::state::{
    self, Meta, MetaRead, TreeState, FIRST_DATA_PAGE, USER_HEADER_CAP,
};
use super::writer::TreeWriter;

/// Copy-on-write B+ tree over a paged file.
///
/// One writer at a time holds the seat; its pages become visible to readers
/// only when it closes and the root is swapped. Durability is the
/// checkpoint: [`Tree::checkpoint`] flushes staged pages and records the new
/// state page atomically, so a crash rolls the tree back to the last
/// checkpoint, never to a torn intermediate.
pub struct Tree<L: Layout> {
    pub(crate) layout: L,
    pub(crate) file: Arc<PagedFile>,
    pub(crate) page_size: usize,
    pub(crate) read_only: bool,
    pub(crate) seat: AtomicBool,
    pub(crate) visible_root: AtomicU64,
    pub(crate) readers: AtomicUsize,
    pub(crate) stable: Arc<Mutex<Bookkeeping>>,
    pub(crate) events: Option<TreeEventSink>,
}

/// Mutable bookkeeping behind one lock: allocation watermark, the two-phase
/// free list, checkpoint sequence and the writer generation counter.
pub(crate) struct Bookkeeping {
    pub next_page: u64,
    /// Reusable now: unreachable from the published root and from the state
    /// on disk.
    pub free: Vec<PageId>,
    /// Freed since the last checkpoint; the previous on-disk state may still
    /// reference these, so they must not be rewritten before the next state
    /// page lands.
    pub pending_free: Vec<PageId>,
    pub sequence: u64,
    pub writer_generation: u64,
    /// Last durably written checkpoint; the dirty stamp re-publishes it
    /// with `clean = false`.
    pub checkpointed: TreeState,
    /// Whether the current checkpoint interval has already been stamped.
    pub dirty_stamped: bool,
}

pub struct TreeOptions {
    /// 0 adopts the stored page size (or the default when creating).
    pub page_size: usize,
    pub read_only: bool,
    /// User header written into the state page when the file is created.
    pub initial_header: Vec<u8>,
    pub events: Option<TreeEventSink>,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            page_size: 0,
            read_only: false,
            initial_header: Vec::new(),
            events: None,
        }
    }
}

/// Tagged open outcome. Unreadable metadata or state is `Mismatch` — the
/// caller decides whether that means rebuild; it is not an `Err`.
pub enum TreeOpen<L: Layout> {
    Opened {
        tree: Tree<L>,
        created: bool,
        /// User header bytes from the state page.
        header: Vec<u8>,
        /// False when the file records mutations after its last checkpoint:
        /// the tree content rolled back and the owner must recover.
        clean: bool,
    },
    Mismatch,
}

impl<L: Layout> Tree<L> {
    /// Open or create the tree file. A missing file is created unless the
    /// options say read-only, in which case it is `FileMissing`.
    pub fn open(
        cache: &PageCache,
        path: &Path,
        layout: L,
        options: TreeOptions,
        cleanup: Option<&dyn CleanupWorkCollector>,
    ) -> Result<TreeOpen<L>> {
        if options.initial_header.len() > USER_HEADER_CAP {
            return Err(FarolError::corruption("user header exceeds state page slot"));
        }
        let probe = match StdFileIo::open(path, !options.read_only) {
            Ok(io) => io,
            Err(FarolError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FarolError::FileMissing(path.to_path_buf()));
            }
            Err(err) => return Err(err),
        };
        let file_len = probe.len()?;
        drop(probe);
        if file_len == 0 {
            if options.read_only {
                return Err(FarolError::FileMissing(path.to_path_buf()));
            }
            return Self::create(cache, path, layout, options);
        }

        let meta = {
            let probe = StdFileIo::open(path, false)?;
            let mut head = [0u8; state::META_PROBE_LEN];
            if file_len < state::META_PROBE_LEN as u64 {
                return Ok(TreeOpen::Mismatch);
            }
            probe.read_at(0, &mut head)?;
            match state::meta_from_bytes(&head) {
                MetaRead::Ok(meta) => meta,
                MetaRead::Mismatch => return Ok(TreeOpen::Mismatch),
            }
        };
        if meta.layout_id != layout.identifier() || meta.layout_version != layout.version() {
            return Err(FarolError::LayoutMismatch {
                expected: layout.identifier(),
                found: meta.layout_id,
            });
        }
        if options.page_size != 0 && options.page_size != meta.page_size as usize {
            return Ok(TreeOpen::Mismatch);
        }
        let page_size = meta.page_size as usize;
        let file = Arc::new(cache.map(path, page_size, !options.read_only)?);
        let Some(persisted) = state::read_state(&file)? else {
            return Ok(TreeOpen::Mismatch);
        };
        let header = persisted.user_header.clone();
        let clean = persisted.clean;
        let tree = Self::from_state(layout, file, page_size, options.read_only, persisted, options.events);
        if !tree.read_only {
            tree.register_cleanup(cleanup);
        }
        Ok(TreeOpen::Opened {
            tree,
            created: false,
            header,
            clean,
        })
    }

    fn create(
        cache: &PageCache,
        path: &Path,
        layout: L,
        options: TreeOptions,
    ) -> Result<TreeOpen<L>> {
        let page_size = if options.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            options.page_size
        };
        if page_size < 128
            || node::leaf_capacity(page_size, layout.key_size(), layout.value_size()) < 4
            || node::internal_capacity(page_size, layout.key_size()) < 2
        {
            return Err(FarolError::corruption("page size too small for this layout"));
        }
        let file = Arc::new(cache.map(path, page_size, true)?);
        state::write_meta(
            &file,
            &Meta {
                page_size: page_size as u32,
                layout_id: layout.identifier(),
                layout_version: layout.version(),
            },
        )?;
        let root = PageId(FIRST_DATA_PAGE);
        let mut root_buf = vec![0u8; page_size];
        node::init(&mut root_buf, NodeKind::Leaf, 0);
        file.stage_page(root, root_buf);
        file.flush_staged(&Unlimited)?;
        let initial = TreeState {
            sequence: 1,
            root,
            next_page: FIRST_DATA_PAGE + 1,
            writer_generation: 0,
            clean: true,
            user_header: options.initial_header.clone(),
            free_list: Vec::new(),
        };
        state::write_state(&file, &initial)?;
        debug!(path = %path.display(), page_size, "created tree file");
        let header = initial.user_header.clone();
        let tree = Self::from_state(layout, file, page_size, false, initial, options.events);
        Ok(TreeOpen::Opened {
            tree,
            created: true,
            header,
            clean: true,
        })
    }

    fn from_state(
        layout: L,
        file: Arc<PagedFile>,
        page_size: usize,
        read_only: bool,
        persisted: TreeState,
        events: Option<TreeEventSink>,
    ) -> Self {
        Self {
            layout,
            file,
            page_size,
            read_only,
            seat: AtomicBool::new(false),
            visible_root: AtomicU64::new(persisted.root.0),
            readers: AtomicUsize::new(0),
            stable: Arc::new(Mutex::new(Bookkeeping {
                next_page: persisted.next_page,
                free: persisted.free_list.clone(),
                pending_free: Vec::new(),
                sequence: persisted.sequence,
                writer_generation: persisted.writer_generation,
                dirty_stamped: !persisted.clean,
                checkpointed: persisted,
            })),
            events,
        }
    }

    fn register_cleanup(&self, collector: Option<&dyn CleanupWorkCollector>) {
        let Some(collector) = collector else {
            return;
        };
        let (next_page, known_free) = {
            let stable = self.stable.lock();
            (stable.next_page, stable.free.clone())
        };
        if let Some(sink) = &self.events {
            sink(TreeEvent::CleanupRegistered);
        }
        collector.add(cleanup::reclamation_job(
            Arc::clone(&self.file),
            Arc::clone(&self.stable),
            self.events.clone(),
            PageId(self.visible_root.load(Ordering::SeqCst)),
            next_page,
            known_free,
            self.layout.key_size(),
        ));
    }

    pub fn layout(&self) -> &L {
        &self.layout
    }

    /// Ordered scan over `[lo, hi]` under the layout's total order. An empty
    /// range yields an empty seeker.
    pub fn seek(&self, lo: Bound<L::Key>, hi: Bound<L::Key>) -> Result<Seeker<'_, L>> {
        Seeker::new(self, lo, hi)
    }

    /// Greatest entry in the tree: right-edge descent from the visible root.
    pub fn last_entry(&self) -> Result<Option<(L::Key, L::Value)>> {
        let ks = self.layout.key_size();
        let vs = self.layout.value_size();
        let mut id = PageId(self.visible_root.load(Ordering::SeqCst));
        loop {
            let page = self.file.read_page(id)?;
            let data = page.data();
            match node::kind(data)? {
                NodeKind::Internal => {
                    id = node::internal_child(data, ks, node::count(data));
                }
                NodeKind::Leaf => {
                    let count = node::count(data);
                    if count == 0 {
                        return Ok(None);
                    }
                    let key = self
                        .layout
                        .read_key(node::leaf_key_slice(data, ks, vs, count - 1));
                    let value = self
                        .layout
                        .read_value(node::leaf_value_slice(data, ks, vs, count - 1));
                    return Ok(Some((key, value)));
                }
            }
        }
    }

    /// Acquire the single writer seat. Non-blocking: a live writer makes
    /// this `WriterBusy`.
    pub fn writer(&self) -> Result<TreeWriter<'_, L>> {
        if self.read_only {
            return Err(FarolError::NotWritable);
        }
        if self
            .seat
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FarolError::WriterBusy);
        }
        let generation = {
            let mut stable = self.stable.lock();
            stable.writer_generation += 1;
            stable.writer_generation
        };
        Ok(TreeWriter::new(self, generation))
    }

    /// Flush staged pages and atomically record a new state page carrying
    /// `user_header`. After this returns, the on-disk file alone reproduces
    /// the current published content.
    pub fn checkpoint(&self, limiter: &dyn FlushLimiter, user_header: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FarolError::NotWritable);
        }
        if user_header.len() > USER_HEADER_CAP {
            return Err(FarolError::corruption("user header exceeds state page slot"));
        }
        let mut stable = self.stable.lock();
        if self.readers.load(Ordering::SeqCst) == 0 {
            let mut pending = std::mem::take(&mut stable.pending_free);
            stable.free.append(&mut pending);
        }
        self.file.flush_staged(limiter)?;
        let sequence = stable.sequence + 1;
        let capacity = state::free_list_capacity(self.page_size);
        if stable.free.len() > capacity {
            debug!(
                overflow = stable.free.len() - capacity,
                "free list exceeds state page capacity; overflow stays in memory"
            );
        }
        let checkpoint = TreeState {
            sequence,
            root: PageId(self.visible_root.load(Ordering::SeqCst)),
            next_page: stable.next_page,
            writer_generation: stable.writer_generation,
            clean: true,
            user_header: user_header.to_vec(),
            free_list: stable.free.iter().copied().take(capacity).collect(),
        };
        state::write_state(&self.file, &checkpoint)?;
        stable.sequence = sequence;
        stable.checkpointed = checkpoint;
        stable.dirty_stamped = false;
        Ok(())
    }

    /// Called before the first mutation of a checkpoint interval: persist a
    /// `clean = false` copy of the last checkpoint so a crash from here on
    /// is visible to the next open.
    pub(crate) fn ensure_dirty_stamp(&self) -> Result<()> {
        let mut stable = self.stable.lock();
        if stable.dirty_stamped {
            return Ok(());
        }
        let mut stamp = stable.checkpointed.clone();
        stamp.sequence = stable.sequence + 1;
        stamp.clean = false;
        state::write_state(&self.file, &stamp)?;
        stable.sequence = stamp.sequence;
        stable.checkpointed = stamp;
        stable.dirty_stamped = true;
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
