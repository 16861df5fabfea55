//! Rebuild-only append writer.
//!
//! Consumes a node-id-sorted change stream and emits each `(label, range)`
//! bitset as a direct put, never merging with existing entries. The
//! preconditions are the caller's contract: sorted input over an empty
//! tree. Anything else leaves undefined persisted content.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::tree::TreeWriter;
use crate::types::{LabelId, NodeId};

use super::layout::{LabelScanKey, LabelScanLayout, LabelScanValue};
use super::update::NodeLabelUpdate;
use super::write_monitor::WriteMonitor;

pub struct BulkAppendWriter<'a> {
    tree_writer: Option<TreeWriter<'a, LabelScanLayout>>,
    layout: LabelScanLayout,
    /// Range currently being accumulated.
    range: Option<u64>,
    /// Per-label bitmask for the current range; BTreeMap keeps the emit
    /// order label-ascending.
    masks: BTreeMap<LabelId, u64>,
    monitor: Arc<dyn WriteMonitor>,
    last_node: Option<NodeId>,
}

impl<'a> BulkAppendWriter<'a> {
    pub(crate) fn new(
        tree_writer: TreeWriter<'a, LabelScanLayout>,
        layout: LabelScanLayout,
        monitor: Arc<dyn WriteMonitor>,
    ) -> Self {
        Self {
            tree_writer: Some(tree_writer),
            layout,
            range: None,
            masks: BTreeMap::new(),
            monitor,
            last_node: None,
        }
    }

    pub fn write(&mut self, update: &NodeLabelUpdate) -> Result<()> {
        debug_assert!(
            self.last_node.map_or(true, |last| last <= update.node()),
            "bulk append input must be sorted by node id"
        );
        self.last_node = Some(update.node());
        let range = self.layout.range_of(update.node());
        if self.range != Some(range) {
            self.flush_range()?;
            self.range = Some(range);
        }
        let bit = self.layout.bit(self.layout.offset_of(update.node()));
        for &label in update.after() {
            *self.masks.entry(label).or_insert(0) |= bit;
        }
        Ok(())
    }

    fn flush_range(&mut self) -> Result<()> {
        let Some(range) = self.range else {
            return Ok(());
        };
        let writer = self
            .tree_writer
            .as_mut()
            .expect("flush after writer close");
        for (&label, &bits) in &self.masks {
            writer.put(
                &LabelScanKey::new(label, range),
                &LabelScanValue::new(bits),
            )?;
            self.monitor.merge(label, range, bits, 0, bits);
        }
        self.masks.clear();
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush_range()?;
        self.tree_writer
            .take()
            .expect("close after writer close")
            .close()
    }
}
