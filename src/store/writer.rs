//! The batching writer.
//!
//! Translates per-node label deltas into the minimum number of bitset
//! merges against the tree. Updates coalesce in a bounded buffer keyed by
//! `(label, range)`; a full buffer or `close` sorts the pending tuples and
//! applies them through one monotonic pass of the tree writer, which turns
//! random per-node traffic into sequential tree I/O.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{FarolError, Result};
use crate::tree::TreeWriter;
use crate::types::{LabelId, NodeId};

use super::layout::{LabelScanKey, LabelScanLayout, LabelScanValue};
use super::update::NodeLabelUpdate;
use super::write_monitor::WriteMonitor;

pub struct LabelScanWriter<'a> {
    tree_writer: Option<TreeWriter<'a, LabelScanLayout>>,
    layout: LabelScanLayout,
    pending: Vec<PendingTuple>,
    slots: HashMap<LabelScanKey, usize>,
    batch_size: usize,
    monitor: Arc<dyn WriteMonitor>,
}

struct PendingTuple {
    key: LabelScanKey,
    add: u64,
    remove: u64,
}

type LabelDelta = SmallVec<[LabelId; 8]>;

/// Split an update into added and removed labels by merge-walking the
/// sorted before/after sets. A label landing on both sides is corrupt
/// input.
fn label_deltas(update: &NodeLabelUpdate) -> Result<(LabelDelta, LabelDelta)> {
    let before = update.before();
    let after = update.after();
    let mut added = LabelDelta::new();
    let mut removed = LabelDelta::new();
    let (mut i, mut j) = (0, 0);
    while i < before.len() && j < after.len() {
        match before[i].cmp(&after[j]) {
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                removed.push(before[i]);
                i += 1;
            }
            Ordering::Greater => {
                added.push(after[j]);
                j += 1;
            }
        }
    }
    removed.extend_from_slice(&before[i..]);
    added.extend_from_slice(&after[j..]);

    let (mut i, mut j) = (0, 0);
    while i < added.len() && j < removed.len() {
        match added[i].cmp(&removed[j]) {
            Ordering::Equal => {
                return Err(FarolError::InvalidUpdate {
                    node: update.node(),
                    label: added[i],
                })
            }
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
        }
    }
    Ok((added, removed))
}

impl<'a> LabelScanWriter<'a> {
    pub(crate) fn new(
        tree_writer: TreeWriter<'a, LabelScanLayout>,
        layout: LabelScanLayout,
        batch_size: usize,
        monitor: Arc<dyn WriteMonitor>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            tree_writer: Some(tree_writer),
            layout,
            pending: Vec::with_capacity(batch_size),
            slots: HashMap::with_capacity(batch_size),
            batch_size,
            monitor,
        }
    }

    pub fn write(&mut self, update: &NodeLabelUpdate) -> Result<()> {
        let (added, removed) = label_deltas(update)?;
        for label in removed {
            self.offer(label, update.node(), false);
        }
        for label in added {
            self.offer(label, update.node(), true);
        }
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Coalesce one bit into the pending buffer. Later updates override
    /// earlier ones for the same node and label, so the masks stay disjoint
    /// and replay arrival order.
    fn offer(&mut self, label: LabelId, node: NodeId, is_add: bool) {
        let key = LabelScanKey::new(label, self.layout.range_of(node));
        let bit = self.layout.bit(self.layout.offset_of(node));
        let slot = match self.slots.get(&key) {
            Some(&slot) => slot,
            None => {
                self.pending.push(PendingTuple {
                    key,
                    add: 0,
                    remove: 0,
                });
                let slot = self.pending.len() - 1;
                self.slots.insert(key, slot);
                slot
            }
        };
        let tuple = &mut self.pending[slot];
        if is_add {
            tuple.add |= bit;
            tuple.remove &= !bit;
        } else {
            tuple.remove |= bit;
            tuple.add &= !bit;
        }
    }

    /// Apply the pending buffer in key order: read the current bitset, fold
    /// the masks in, write back nonzero results and remove emptied keys.
    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.pending.sort_by_key(|tuple| tuple.key);
        let writer = self
            .tree_writer
            .as_mut()
            .expect("flush after writer close");
        for tuple in &self.pending {
            let current = writer.get(&tuple.key)?.map(|value| value.bits).unwrap_or(0);
            let result = (current | tuple.add) & !tuple.remove;
            if result != current {
                if result == 0 {
                    writer.remove(&tuple.key)?;
                } else {
                    writer.put(&tuple.key, &LabelScanValue::new(result))?;
                }
            }
            self.monitor
                .merge(tuple.key.label, tuple.key.range, tuple.add, tuple.remove, result);
        }
        let tuples = self.pending.len();
        self.pending.clear();
        self.slots.clear();
        self.monitor.flushed(tuples);
        Ok(())
    }

    /// Flush the remainder and publish the session. Dropping the writer
    /// without closing discards everything it wrote.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.tree_writer
            .take()
            .expect("close after writer close")
            .close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_come_from_the_set_difference() {
        let update = NodeLabelUpdate::new(
            NodeId(1),
            [LabelId(1), LabelId(2), LabelId(3)],
            [LabelId(2), LabelId(4)],
        );
        let (added, removed) = label_deltas(&update).unwrap();
        assert_eq!(added.as_slice(), &[LabelId(4)]);
        assert_eq!(removed.as_slice(), &[LabelId(1), LabelId(3)]);
    }

    #[test]
    fn unchanged_label_sets_produce_no_delta() {
        let update = NodeLabelUpdate::new(NodeId(1), [LabelId(7)], [LabelId(7)]);
        let (added, removed) = label_deltas(&update).unwrap();
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn corrupt_unsorted_input_is_rejected() {
        // An unsorted pre-image makes the merge walk see label 7 as both
        // added and removed; `from_sorted` trusted the caller too much.
        let update = NodeLabelUpdate::from_sorted(
            NodeId(5),
            [LabelId(9), LabelId(7)],
            [LabelId(7), LabelId(9)],
        );
        let err = label_deltas(&update).unwrap_err();
        assert!(matches!(
            err,
            FarolError::InvalidUpdate {
                node: NodeId(5),
                label: LabelId(7)
            }
        ));
    }
}
