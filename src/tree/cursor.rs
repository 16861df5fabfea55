use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::Ordering as AtomicOrdering;

use crate::error::Result;
use crate::primitives::pager::PageRef;
use crate::types::PageId;

use super::core::Tree;
use super::layout::Layout;
use super::node::{self, NodeKind};

/// Ordered ascending cursor over one snapshot of the tree.
///
/// The root is captured at construction, so a seeker never observes writers
/// that close after it was created. Frames on the descent stack pin their
/// pages; there are no sibling pointers to chase, exhausted leaves ascend
/// through the stack instead.
pub struct Seeker<'a, L: Layout> {
    tree: &'a Tree<L>,
    upper: Bound<L::Key>,
    stack: Vec<Frame>,
    leaf: Option<(PageRef, usize)>,
    done: bool,
}

struct Frame {
    page: PageRef,
    /// Child index currently descended into, `0..=count`.
    child: usize,
}

impl<'a, L: Layout> Seeker<'a, L> {
    pub(crate) fn new(tree: &'a Tree<L>, lo: Bound<L::Key>, hi: Bound<L::Key>) -> Result<Self> {
        tree.readers.fetch_add(1, AtomicOrdering::SeqCst);
        let mut seeker = Self {
            tree,
            upper: hi,
            stack: Vec::new(),
            leaf: None,
            done: false,
        };
        if Self::range_is_empty(tree, &lo, &seeker.upper) {
            seeker.done = true;
            return Ok(seeker);
        }
        seeker.descend_to(&lo)?;
        Ok(seeker)
    }

    fn range_is_empty(tree: &Tree<L>, lo: &Bound<L::Key>, hi: &Bound<L::Key>) -> bool {
        let (Some(lo_key), Some(hi_key)) = (bound_key(lo), bound_key(hi)) else {
            return false;
        };
        match tree.layout.compare(lo_key, hi_key) {
            Ordering::Greater => true,
            Ordering::Equal => !matches!((lo, hi), (Bound::Included(_), Bound::Included(_))),
            Ordering::Less => false,
        }
    }

    fn descend_to(&mut self, lo: &Bound<L::Key>) -> Result<()> {
        let layout = &self.tree.layout;
        let ks = layout.key_size();
        let vs = layout.value_size();
        let mut id = PageId(self.tree.visible_root.load(AtomicOrdering::SeqCst));
        loop {
            let page = self.tree.file.read_page(id)?;
            let data = page.data();
            match node::kind(data)? {
                NodeKind::Internal => {
                    let child = match bound_key(lo) {
                        None => 0,
                        Some(key) => node::internal_descend_index(data, ks, |slot| {
                            layout.compare(&layout.read_key(slot), key)
                        }),
                    };
                    id = node::internal_child(data, ks, child);
                    self.stack.push(Frame { page, child });
                }
                NodeKind::Leaf => {
                    let count = node::count(data);
                    let idx = match lo {
                        Bound::Unbounded => 0,
                        Bound::Included(key) => node::search(count, |slot| {
                            layout.compare(&layout.read_key(node::leaf_key_slice(data, ks, vs, slot)), key)
                        })
                        .unwrap_or_else(|insert_at| insert_at),
                        Bound::Excluded(key) => match node::search(count, |slot| {
                            layout.compare(&layout.read_key(node::leaf_key_slice(data, ks, vs, slot)), key)
                        }) {
                            Ok(found) => found + 1,
                            Err(insert_at) => insert_at,
                        },
                    };
                    self.leaf = Some((page, idx));
                    return Ok(());
                }
            }
        }
    }

    pub fn next(&mut self) -> Result<Option<(L::Key, L::Value)>> {
        if self.done {
            return Ok(None);
        }
        let layout = &self.tree.layout;
        let ks = layout.key_size();
        let vs = layout.value_size();
        loop {
            let entry = match &self.leaf {
                None => {
                    self.finish();
                    return Ok(None);
                }
                Some((page, idx)) => {
                    let data = page.data();
                    if *idx >= node::count(data) {
                        None
                    } else {
                        let key = layout.read_key(node::leaf_key_slice(data, ks, vs, *idx));
                        let value = layout.read_value(node::leaf_value_slice(data, ks, vs, *idx));
                        Some((key, value))
                    }
                }
            };
            match entry {
                Some((key, value)) => {
                    if self.past_upper(&key) {
                        self.finish();
                        return Ok(None);
                    }
                    if let Some((_, idx)) = &mut self.leaf {
                        *idx += 1;
                    }
                    return Ok(Some((key, value)));
                }
                None => {
                    if !self.advance_leaf()? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn advance_leaf(&mut self) -> Result<bool> {
        let ks = self.tree.layout.key_size();
        let mut id = loop {
            let Some(top) = self.stack.last_mut() else {
                self.finish();
                return Ok(false);
            };
            if top.child >= node::count(top.page.data()) {
                self.stack.pop();
                continue;
            }
            top.child += 1;
            break node::internal_child(top.page.data(), ks, top.child);
        };
        loop {
            let page = self.tree.file.read_page(id)?;
            match node::kind(page.data())? {
                NodeKind::Internal => {
                    id = node::internal_child(page.data(), ks, 0);
                    self.stack.push(Frame { page, child: 0 });
                }
                NodeKind::Leaf => {
                    self.leaf = Some((page, 0));
                    return Ok(true);
                }
            }
        }
    }

    fn past_upper(&self, key: &L::Key) -> bool {
        match &self.upper {
            Bound::Unbounded => false,
            Bound::Included(bound) => {
                self.tree.layout.compare(key, bound) == Ordering::Greater
            }
            Bound::Excluded(bound) => self.tree.layout.compare(key, bound) != Ordering::Less,
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.leaf = None;
        self.stack.clear();
    }
}

impl<L: Layout> Drop for Seeker<'_, L> {
    fn drop(&mut self) {
        self.tree.readers.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

fn bound_key<K>(bound: &Bound<K>) -> Option<&K> {
    match bound {
        Bound::Unbounded => None,
        Bound::Included(key) | Bound::Excluded(key) => Some(key),
    }
}
