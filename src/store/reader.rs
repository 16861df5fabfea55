//! Read side: node-id streams per label and the all-ranges scan.
//!
//! Every stream is a snapshot as of its creation; writers closing later are
//! not visible. Streams are fallible iterators (`next` returns `Result`)
//! because every step may fault a page in.

use std::ops::Bound;

use crate::error::Result;
use crate::tree::{Seeker, Tree};
use crate::types::{LabelId, NodeId};

use super::layout::{LabelScanKey, LabelScanLayout, RangeWidth};

pub struct LabelScanReader<'a> {
    tree: &'a Tree<LabelScanLayout>,
}

impl<'a> LabelScanReader<'a> {
    pub(crate) fn new(tree: &'a Tree<LabelScanLayout>) -> Self {
        Self { tree }
    }

    /// All nodes carrying `label`, ascending.
    pub fn nodes_with_label(&self, label: LabelId) -> Result<NodeIdStream<'a>> {
        let layout = *self.tree.layout();
        let seeker = self.tree.seek(
            Bound::Included(LabelScanKey::new(label, 0)),
            Bound::Included(LabelScanKey::new(label, u64::MAX)),
        )?;
        Ok(NodeIdStream {
            seeker,
            layout,
            clamp: None,
            current: None,
        })
    }

    /// Nodes carrying `label` within `[from, to)`, ascending.
    pub fn nodes_with_label_in_range(
        &self,
        label: LabelId,
        from: NodeId,
        to: NodeId,
    ) -> Result<NodeIdStream<'a>> {
        let layout = *self.tree.layout();
        if from >= to {
            // Deliberately inverted bounds make the seeker empty.
            let key = LabelScanKey::new(label, 0);
            let seeker = self
                .tree
                .seek(Bound::Excluded(key), Bound::Excluded(key))?;
            return Ok(NodeIdStream {
                seeker,
                layout,
                clamp: None,
                current: None,
            });
        }
        let first = layout.range_of(from);
        let last = layout.range_of(NodeId(to.0 - 1));
        let seeker = self.tree.seek(
            Bound::Included(LabelScanKey::new(label, first)),
            Bound::Included(LabelScanKey::new(label, last)),
        )?;
        Ok(NodeIdStream {
            seeker,
            layout,
            clamp: Some((from, to)),
            current: None,
        })
    }
}

/// Ascending stream of node ids decoded from matching bitsets.
pub struct NodeIdStream<'a> {
    seeker: Seeker<'a, LabelScanLayout>,
    layout: LabelScanLayout,
    /// `[from, to)` node bounds; the first and last range are masked.
    clamp: Option<(NodeId, NodeId)>,
    current: Option<(u64, u64)>,
}

impl NodeIdStream<'_> {
    pub fn next(&mut self) -> Result<Option<NodeId>> {
        let layout = self.layout;
        loop {
            if let Some((range, bits)) = &mut self.current {
                if *bits != 0 {
                    let offset = bits.trailing_zeros();
                    *bits &= *bits - 1;
                    return Ok(Some(layout.node_at(*range, offset)));
                }
                self.current = None;
            }
            match self.seeker.next()? {
                None => return Ok(None),
                Some((key, value)) => {
                    let mut bits = value.bits;
                    if let Some((from, to)) = self.clamp {
                        if key.range == layout.range_of(from) {
                            bits &= layout.mask_from(layout.offset_of(from));
                        }
                        let last_node = NodeId(to.0 - 1);
                        if key.range == layout.range_of(last_node) {
                            bits &= layout.mask_below(layout.offset_of(last_node) + 1);
                        }
                    }
                    self.current = Some((key.range, bits));
                }
            }
        }
    }

    pub fn to_vec(mut self) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        while let Some(node) = self.next()? {
            out.push(node);
        }
        Ok(out)
    }
}

/// One `(label, range)` entry surfaced by the all-ranges scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LabelRange {
    pub label: LabelId,
    pub range: u64,
    pub bits: u64,
    width: RangeWidth,
}

impl LabelRange {
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        let base = self.range * self.width.bits() as u64;
        let mut bits = self.bits;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let offset = bits.trailing_zeros() as u64;
            bits &= bits - 1;
            Some(NodeId(base + offset))
        })
    }
}

/// Walks every stored `(label, range)` entry, label-major, from label 0 to
/// the highest label present at creation time.
pub struct AllLabelRanges<'a> {
    tree: &'a Tree<LabelScanLayout>,
    /// Range window `[first, last_exclusive)` derived from the node bounds.
    first_range: u64,
    end_range: u64,
    next_label: u32,
    highest_label: Option<u32>,
    seeker: Option<Seeker<'a, LabelScanLayout>>,
}

impl<'a> AllLabelRanges<'a> {
    pub(crate) fn new(
        tree: &'a Tree<LabelScanLayout>,
        from: NodeId,
        to: NodeId,
    ) -> Result<Self> {
        let layout = tree.layout();
        let highest_label = match tree.last_entry()? {
            Some((key, _)) => Some(key.label.0),
            None => None,
        };
        let (first_range, end_range) = if from >= to {
            (0, 0)
        } else {
            (
                layout.range_of(from),
                layout.range_of(NodeId(to.0 - 1)) + 1,
            )
        };
        Ok(Self {
            tree,
            first_range,
            end_range,
            next_label: 0,
            highest_label,
            seeker: None,
        })
    }

    pub fn next(&mut self) -> Result<Option<LabelRange>> {
        let width = self.tree.layout().width();
        loop {
            if let Some(seeker) = &mut self.seeker {
                if let Some((key, value)) = seeker.next()? {
                    return Ok(Some(LabelRange {
                        label: key.label,
                        range: key.range,
                        bits: value.bits,
                        width,
                    }));
                }
                self.seeker = None;
                self.next_label += 1;
            }
            let Some(highest) = self.highest_label else {
                return Ok(None);
            };
            if self.next_label > highest || self.first_range >= self.end_range {
                return Ok(None);
            }
            let label = LabelId(self.next_label);
            self.seeker = Some(self.tree.seek(
                Bound::Included(LabelScanKey::new(label, self.first_range)),
                Bound::Excluded(LabelScanKey::new(label, self.end_range)),
            )?);
        }
    }

    pub fn to_vec(mut self) -> Result<Vec<LabelRange>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next()? {
            out.push(entry);
        }
        Ok(out)
    }
}
