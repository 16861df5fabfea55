//! Node label change records and the rebuild change stream.

use smallvec::SmallVec;

use crate::error::Result;
use crate::types::{LabelId, NodeId};

use super::bulk::BulkAppendWriter;

type LabelSet = SmallVec<[LabelId; 8]>;

/// One node's label change: the full label set before and after. Writers
/// work from the delta between the two. Both sets are kept sorted; a label
/// appearing on both sides of the delta marks the update as corrupt and is
/// rejected by the writer, not here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeLabelUpdate {
    node: NodeId,
    before: LabelSet,
    after: LabelSet,
}

impl NodeLabelUpdate {
    pub fn new(
        node: NodeId,
        before: impl IntoIterator<Item = LabelId>,
        after: impl IntoIterator<Item = LabelId>,
    ) -> Self {
        let mut before: LabelSet = before.into_iter().collect();
        let mut after: LabelSet = after.into_iter().collect();
        before.sort_unstable();
        after.sort_unstable();
        Self {
            node,
            before,
            after,
        }
    }

    /// A node seen for the first time: no pre-image.
    pub fn labeled(node: NodeId, labels: impl IntoIterator<Item = LabelId>) -> Self {
        Self::new(node, [], labels)
    }

    /// Trusts the caller to supply sorted label sets; decoders that already
    /// hold them sorted use this to skip the re-sort. A violation surfaces
    /// at the writer as `InvalidUpdate`.
    pub fn from_sorted(
        node: NodeId,
        before: impl IntoIterator<Item = LabelId>,
        after: impl IntoIterator<Item = LabelId>,
    ) -> Self {
        Self {
            node,
            before: before.into_iter().collect(),
            after: after.into_iter().collect(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn before(&self) -> &[LabelId] {
        &self.before
    }

    pub fn after(&self) -> &[LabelId] {
        &self.after
    }
}

/// Source of the full node population during rebuild. Must produce updates
/// in ascending node-id order; returns the number of nodes streamed.
pub trait FullStoreChangeStream: Send {
    fn apply_to(&mut self, writer: &mut BulkAppendWriter<'_>) -> Result<u64>;
}

/// In-memory change stream; reusable across rebuilds.
#[derive(Default)]
pub struct VecChangeStream {
    updates: Vec<NodeLabelUpdate>,
}

impl VecChangeStream {
    pub fn new(mut updates: Vec<NodeLabelUpdate>) -> Self {
        updates.sort_by_key(|update| update.node());
        Self { updates }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl FullStoreChangeStream for VecChangeStream {
    fn apply_to(&mut self, writer: &mut BulkAppendWriter<'_>) -> Result<u64> {
        for update in &self.updates {
            writer.write(update)?;
        }
        Ok(self.updates.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_sets_are_sorted_on_construction() {
        let update = NodeLabelUpdate::new(
            NodeId(9),
            [LabelId(5), LabelId(1)],
            [LabelId(4), LabelId(2), LabelId(9)],
        );
        assert_eq!(update.before(), &[LabelId(1), LabelId(5)]);
        assert_eq!(update.after(), &[LabelId(2), LabelId(4), LabelId(9)]);
    }
}
