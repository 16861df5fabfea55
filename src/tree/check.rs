//! Structural consistency check.
//!
//! Walks the tree from the published root with the key interval each parent
//! proves for its children, reporting faults to a [`CheckVisitor`]. A hook
//! lets the caller validate decoded values, which is where the store layers
//! its own invariant.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;

use crate::error::{FarolError, Result};
use crate::types::PageId;

use super::core::Tree;
use super::layout::Layout;
use super::node::{self, NodeKind};
use super::state::FIRST_DATA_PAGE;

#[derive(Debug)]
pub enum CheckFault {
    KeyOrderViolation { page: PageId, slot: usize },
    DuplicateKey { page: PageId, slot: usize },
    ChildOutOfBounds { page: PageId, child: PageId },
    PageVisitedTwice { page: PageId },
    OrphanedPage { page: PageId },
    CorruptNode { page: PageId, detail: String },
    InvalidValue { page: PageId, detail: String },
}

impl fmt::Display for CheckFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckFault::KeyOrderViolation { page, slot } => {
                write!(f, "key order violation in page {page} at slot {slot}")
            }
            CheckFault::DuplicateKey { page, slot } => {
                write!(f, "duplicate key in page {page} at slot {slot}")
            }
            CheckFault::ChildOutOfBounds { page, child } => {
                write!(f, "page {page} references child {child} outside the file")
            }
            CheckFault::PageVisitedTwice { page } => {
                write!(f, "page {page} is reachable through two paths")
            }
            CheckFault::OrphanedPage { page } => {
                write!(f, "page {page} is neither reachable nor free")
            }
            CheckFault::CorruptNode { page, detail } => {
                write!(f, "corrupt node in page {page}: {detail}")
            }
            CheckFault::InvalidValue { page, detail } => {
                write!(f, "invalid value in page {page}: {detail}")
            }
        }
    }
}

pub trait CheckVisitor {
    fn fault(&mut self, fault: CheckFault);
}

/// Visitor that keeps every fault; handy for reporting and tests.
#[derive(Default)]
pub struct CollectingVisitor {
    pub faults: Vec<CheckFault>,
}

impl CheckVisitor for CollectingVisitor {
    fn fault(&mut self, fault: CheckFault) {
        self.faults.push(fault);
    }
}

/// Per-entry value validator; returns a description of the violation.
pub type ValueCheck<'a, K, V> = &'a mut dyn FnMut(&K, &V) -> Option<String>;

struct Checker<'a, 'b, L: Layout> {
    tree: &'a Tree<L>,
    visitor: &'b mut dyn CheckVisitor,
    value_check: Option<ValueCheck<'b, L::Key, L::Value>>,
    visited: HashSet<PageId>,
    next_page: u64,
    faults: usize,
    leaf_depth: Option<usize>,
}

impl<L: Layout> Tree<L> {
    /// Structural walk plus an optional per-entry value validator. Returns
    /// `true` when no fault was reported.
    pub fn consistency_check<'a>(
        &self,
        visitor: &'a mut dyn CheckVisitor,
        value_check: Option<ValueCheck<'a, L::Key, L::Value>>,
    ) -> Result<bool> {
        let (next_page, accounted) = {
            let stable = self.stable.lock();
            let mut accounted: HashSet<PageId> = stable.free.iter().copied().collect();
            accounted.extend(stable.pending_free.iter().copied());
            (stable.next_page, accounted)
        };
        let mut checker = Checker {
            tree: self,
            visitor,
            value_check,
            visited: HashSet::new(),
            next_page,
            faults: 0,
            leaf_depth: None,
        };
        let root = PageId(self.visible_root.load(AtomicOrdering::SeqCst));
        checker.walk(root, None, None, 0)?;
        for id in (FIRST_DATA_PAGE..next_page).map(PageId) {
            if !checker.visited.contains(&id) && !accounted.contains(&id) {
                checker.report(CheckFault::OrphanedPage { page: id });
            }
        }
        Ok(checker.faults == 0)
    }
}

fn key_slice<'d>(kind: NodeKind, data: &'d [u8], ks: usize, vs: usize, slot: usize) -> &'d [u8] {
    match kind {
        NodeKind::Leaf => node::leaf_key_slice(data, ks, vs, slot),
        NodeKind::Internal => node::internal_key_slice(data, ks, slot),
    }
}

impl<L: Layout> Checker<'_, '_, L> {
    fn report(&mut self, fault: CheckFault) {
        self.faults += 1;
        self.visitor.fault(fault);
    }

    fn walk(
        &mut self,
        id: PageId,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
        depth: usize,
    ) -> Result<()> {
        if !self.visited.insert(id) {
            self.report(CheckFault::PageVisitedTwice { page: id });
            return Ok(());
        }
        let layout = &self.tree.layout;
        let ks = layout.key_size();
        let vs = layout.value_size();
        let page = match self.tree.file.read_page(id) {
            Ok(page) => page,
            Err(FarolError::Io(err)) => {
                self.report(CheckFault::CorruptNode {
                    page: id,
                    detail: format!("unreadable: {err}"),
                });
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let data = page.data();
        let kind = match node::kind(data) {
            Ok(kind) => kind,
            Err(err) => {
                self.report(CheckFault::CorruptNode {
                    page: id,
                    detail: err.to_string(),
                });
                return Ok(());
            }
        };
        let count = node::count(data);
        let capacity = match kind {
            NodeKind::Leaf => node::leaf_capacity(self.tree.page_size, ks, vs),
            NodeKind::Internal => node::internal_capacity(self.tree.page_size, ks),
        };
        if count > capacity {
            self.report(CheckFault::CorruptNode {
                page: id,
                detail: format!("count {count} exceeds capacity {capacity}"),
            });
            return Ok(());
        }
        for slot in 0..count {
            let key = key_slice(kind, data, ks, vs, slot);
            if slot > 0 {
                match layout.compare_encoded(key_slice(kind, data, ks, vs, slot - 1), key) {
                    std::cmp::Ordering::Less => {}
                    std::cmp::Ordering::Equal => {
                        self.report(CheckFault::DuplicateKey { page: id, slot })
                    }
                    std::cmp::Ordering::Greater => {
                        self.report(CheckFault::KeyOrderViolation { page: id, slot })
                    }
                }
            }
            if let Some(lower) = &lower {
                if layout.compare_encoded(key, lower) == std::cmp::Ordering::Less {
                    self.report(CheckFault::KeyOrderViolation { page: id, slot });
                }
            }
            if let Some(upper) = &upper {
                if layout.compare_encoded(key, upper) != std::cmp::Ordering::Less {
                    self.report(CheckFault::KeyOrderViolation { page: id, slot });
                }
            }
        }
        match kind {
            NodeKind::Leaf => {
                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        self.report(CheckFault::CorruptNode {
                            page: id,
                            detail: format!("leaf at depth {depth}, expected {expected}"),
                        });
                    }
                    Some(_) => {}
                }
                if let Some(mut check) = self.value_check.take() {
                    for slot in 0..count {
                        let key = layout.read_key(node::leaf_key_slice(data, ks, vs, slot));
                        let value = layout.read_value(node::leaf_value_slice(data, ks, vs, slot));
                        if let Some(detail) = check(&key, &value) {
                            self.report(CheckFault::InvalidValue { page: id, detail });
                        }
                    }
                    self.value_check = Some(check);
                }
            }
            NodeKind::Internal => {
                for child_idx in 0..=count {
                    let child = node::internal_child(data, ks, child_idx);
                    if child.0 < FIRST_DATA_PAGE || child.0 >= self.next_page {
                        self.report(CheckFault::ChildOutOfBounds { page: id, child });
                        continue;
                    }
                    let child_lower = if child_idx == 0 {
                        lower.clone()
                    } else {
                        Some(key_slice(kind, data, ks, vs, child_idx - 1).to_vec())
                    };
                    let child_upper = if child_idx == count {
                        upper.clone()
                    } else {
                        Some(key_slice(kind, data, ks, vs, child_idx).to_vec())
                    };
                    self.walk(child, child_lower, child_upper, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}
