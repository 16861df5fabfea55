//! Store lifecycle: init, rebuild, force, drop, shutdown.

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{FarolError, Result};
use crate::primitives::pager::{FlushLimiter, PageCache, Unlimited};
use crate::tree::{
    CleanupWorkCollector, Tree, TreeEvent, TreeEventSink, TreeOpen, TreeOptions,
};
use crate::types::NodeId;

use super::bulk::BulkAppendWriter;
use super::layout::LabelScanLayout;
use super::monitor::{IndexEvent, Monitors};
use super::reader::{AllLabelRanges, LabelScanReader};
use super::update::{FullStoreChangeStream, NodeLabelUpdate};
use super::write_monitor::{NoopWriteMonitor, WriteLog, WriteMonitor};
use super::writer::LabelScanWriter;

/// Header byte: store content matches the tree as of the last checkpoint.
pub const CLEAN: u8 = 0x00;
/// Header byte: the store must be rebuilt from the change stream before it
/// serves writes.
pub const NEEDS_REBUILD: u8 = 0x01;

/// Conventional file name of the single backing file.
pub const LABEL_SCAN_STORE_FILE_NAME: &str = "labelscan.db";

/// The store file inside a database directory.
pub fn label_scan_store_file(directory: &Path) -> PathBuf {
    directory.join(LABEL_SCAN_STORE_FILE_NAME)
}

/// Persistent, recoverable index answering "which nodes carry label L?".
///
/// Exactly one writer is allowed at any point in time; readers are
/// unbounded and see the snapshot of the last closed writer. `force` is
/// what makes the store recoverable: it checkpoints the tree and writes the
/// `CLEAN` header, after which reopening needs no external replay. A store
/// that was never forced reopens with the rebuild flag still set and is
/// repopulated from the [`FullStoreChangeStream`].
pub struct LabelScanStore {
    path: PathBuf,
    config: StoreConfig,
    page_cache: PageCache,
    change_stream: Mutex<Box<dyn FullStoreChangeStream>>,
    monitors: Monitors,
    cleanup: Arc<dyn CleanupWorkCollector>,
    write_monitor: Arc<dyn WriteMonitor>,
    tree: Option<Tree<LabelScanLayout>>,
    needs_rebuild: bool,
}

enum Instantiated {
    Opened { dirty: bool },
    Mismatch,
}

impl LabelScanStore {
    pub fn new(
        page_cache: PageCache,
        path: impl Into<PathBuf>,
        change_stream: Box<dyn FullStoreChangeStream>,
        config: StoreConfig,
        monitors: Monitors,
        cleanup: Arc<dyn CleanupWorkCollector>,
    ) -> Self {
        Self {
            path: path.into(),
            config,
            page_cache,
            change_stream: Mutex::new(change_stream),
            monitors,
            cleanup,
            write_monitor: Arc::new(NoopWriteMonitor),
            tree: None,
            needs_rebuild: false,
        }
    }

    /// Instantiate the tree and decide whether a rebuild is due. A missing
    /// file or a dirty/unreadable one schedules the rebuild for
    /// [`start`](Self::start).
    pub fn init(&mut self) -> Result<()> {
        self.monitors.emit(IndexEvent::Init);
        let store_exists = self.has_store();
        self.needs_rebuild = !store_exists;
        if !store_exists {
            if self.config.read_only {
                return Err(FarolError::FileMissing(self.path.clone()));
            }
            self.monitors.emit(IndexEvent::NoIndex);
            debug!(path = %self.path.display(), "no label scan store file, will rebuild");
        }
        let dirty = match self.instantiate_tree()? {
            Instantiated::Opened { dirty } => dirty,
            Instantiated::Mismatch => true,
        };
        self.write_monitor = if self.config.write_monitor_enabled {
            Arc::new(WriteLog::open(&self.path)?)
        } else {
            Arc::new(NoopWriteMonitor)
        };
        if dirty {
            self.monitors.emit(IndexEvent::NotValidIndex);
            warn!(path = %self.path.display(), "label scan store not valid, scheduling rebuild");
            if !self.config.read_only {
                self.drop_strict()?;
                match self.instantiate_tree()? {
                    Instantiated::Opened { .. } => {}
                    Instantiated::Mismatch => {
                        return Err(FarolError::corruption(
                            "freshly created label scan store failed to open",
                        ))
                    }
                }
            } else if self.tree.is_none() {
                return Err(FarolError::corruption(
                    "label scan store unreadable and read-only",
                ));
            }
            self.needs_rebuild = true;
        }
        Ok(())
    }

    fn instantiate_tree(&mut self) -> Result<Instantiated> {
        let layout = LabelScanLayout::new(self.config.range_width);
        let monitors = self.monitors.clone();
        let events: TreeEventSink = Arc::new(move |event| monitors.emit(map_tree_event(event)));
        let options = TreeOptions {
            page_size: self.config.page_size,
            read_only: self.config.read_only,
            initial_header: vec![NEEDS_REBUILD],
            events: Some(events),
        };
        match Tree::open(
            &self.page_cache,
            &self.path,
            layout,
            options,
            Some(self.cleanup.as_ref()),
        )? {
            TreeOpen::Opened {
                tree,
                created,
                header,
                clean,
            } => {
                // Creation writes NEEDS_REBUILD by design; only a
                // pre-existing file counts as dirty here. An unclean tree
                // means content rolled back to its last checkpoint, which
                // this store recovers from by rebuilding.
                let dirty = !created && (!clean || header.first().copied() != Some(CLEAN));
                self.tree = Some(tree);
                Ok(Instantiated::Opened { dirty })
            }
            TreeOpen::Mismatch => Ok(Instantiated::Mismatch),
        }
    }

    /// Rebuild from the change stream when scheduled, then checkpoint with a
    /// clean header. On a read-only store the rebuild is skipped and the
    /// store stays degraded: readers serve the last checkpoint, writers
    /// refuse.
    pub fn start(&mut self) -> Result<()> {
        if self.needs_rebuild && !self.config.read_only {
            self.monitors.emit(IndexEvent::Rebuilding);
            info!(path = %self.path.display(), "rebuilding label scan store");
            let nodes = {
                let tree = tree_of(&self.tree)?;
                let mut bulk = BulkAppendWriter::new(
                    tree.writer()?,
                    *tree.layout(),
                    Arc::clone(&self.write_monitor),
                );
                let nodes = self.change_stream.lock().apply_to(&mut bulk)?;
                bulk.close()?;
                nodes
            };
            tree_of(&self.tree)?.checkpoint(&Unlimited, &[CLEAN])?;
            self.needs_rebuild = false;
            self.monitors.emit(IndexEvent::Rebuilt { nodes });
            info!(nodes, "label scan store rebuild complete");
        }
        Ok(())
    }

    /// Checkpoint with a clean header; the durability point of this store.
    pub fn force(&self, limiter: &dyn FlushLimiter) -> Result<()> {
        if self.config.read_only {
            debug!("force on read-only label scan store is a no-op");
            return Ok(());
        }
        if self.needs_rebuild {
            return Err(FarolError::StoreDirty);
        }
        self.tree()?.checkpoint(limiter, &[CLEAN])?;
        self.write_monitor.force();
        Ok(())
    }

    pub fn new_reader(&self) -> Result<LabelScanReader<'_>> {
        Ok(LabelScanReader::new(self.tree()?))
    }

    /// Batching writer. Refuses on read-only stores and before a scheduled
    /// rebuild has run.
    pub fn new_writer(&self) -> Result<LabelScanWriter<'_>> {
        self.assert_writable()?;
        if self.needs_rebuild {
            return Err(FarolError::StoreDirty);
        }
        let tree = self.tree()?;
        Ok(LabelScanWriter::new(
            tree.writer()?,
            *tree.layout(),
            self.config.writer_batch_size,
            Arc::clone(&self.write_monitor),
        ))
    }

    /// Append-only writer for initial population; input must be sorted by
    /// node id and the tree empty.
    pub fn new_bulk_append_writer(&self) -> Result<BulkAppendWriter<'_>> {
        self.assert_writable()?;
        let tree = self.tree()?;
        Ok(BulkAppendWriter::new(
            tree.writer()?,
            *tree.layout(),
            Arc::clone(&self.write_monitor),
        ))
    }

    /// Open a writer, drain `updates`, close.
    pub fn apply_updates(
        &self,
        updates: impl IntoIterator<Item = NodeLabelUpdate>,
    ) -> Result<()> {
        let mut writer = self.new_writer()?;
        for update in updates {
            writer.write(&update)?;
        }
        writer.close()
    }

    /// Every `(label, range)` entry across all labels.
    pub fn all_node_label_ranges(&self) -> Result<AllLabelRanges<'_>> {
        self.all_node_label_ranges_in(NodeId(0), NodeId(u64::MAX))
    }

    /// Entries whose range overlaps `[from, to)`. Bounds select whole
    /// ranges; bits are not masked here.
    pub fn all_node_label_ranges_in(
        &self,
        from: NodeId,
        to: NodeId,
    ) -> Result<AllLabelRanges<'_>> {
        AllLabelRanges::new(self.tree()?, from, to)
    }

    pub fn is_empty(&self) -> Result<bool> {
        let mut seeker = self.tree()?.seek(Bound::Unbounded, Bound::Unbounded)?;
        Ok(seeker.next()?.is_none())
    }

    /// Close the tree and delete the backing file; a missing file is fine.
    pub fn drop_store(&mut self) -> Result<()> {
        match self.drop_strict() {
            Err(FarolError::FileMissing(_)) => Ok(()),
            other => other,
        }
    }

    fn drop_strict(&mut self) -> Result<()> {
        self.tree = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FarolError::FileMissing(self.path.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Nothing to quiesce between `force` and `shutdown`.
    pub fn stop(&self) {}

    /// Close the tree and the write monitor. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.tree.take().is_some() {
            self.write_monitor.close();
            debug!(path = %self.path.display(), "label scan store shut down");
        }
        Ok(())
    }

    /// The single backing file.
    pub fn snapshot_store_files(&self) -> impl Iterator<Item = PathBuf> {
        std::iter::once(self.path.clone())
    }

    pub fn has_store(&self) -> bool {
        self.path.exists()
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn assert_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(FarolError::NotWritable);
        }
        Ok(())
    }

    pub(super) fn tree(&self) -> Result<&Tree<LabelScanLayout>> {
        tree_of(&self.tree)
    }
}

fn tree_of(tree: &Option<Tree<LabelScanLayout>>) -> Result<&Tree<LabelScanLayout>> {
    tree.as_ref()
        .ok_or_else(|| FarolError::corruption("label scan store is not open"))
}

fn map_tree_event(event: TreeEvent) -> IndexEvent {
    match event {
        TreeEvent::CleanupRegistered => IndexEvent::CleanupRegistered,
        TreeEvent::CleanupStarted => IndexEvent::CleanupStarted,
        TreeEvent::CleanupFinished {
            pages_visited,
            tree_nodes,
            pages_reclaimed,
            duration,
        } => IndexEvent::CleanupFinished {
            pages_visited,
            tree_nodes,
            pages_reclaimed,
            duration,
        },
        TreeEvent::CleanupClosed => IndexEvent::CleanupClosed,
        TreeEvent::CleanupFailed { error } => IndexEvent::CleanupFailed { error },
    }
}
