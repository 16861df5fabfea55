use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;

use tracing::debug;

use crate::error::Result;
use crate::types::PageId;

use super::core::Tree;
use super::layout::Layout;
use super::node::{self, NodeKind};

/// Exclusive mutation session against the tree.
///
/// Copy-on-write discipline: a page stamped with an older generation is
/// copied to a fresh id before the first mutation, pages stamped with this
/// writer's generation are re-staged in place. Nothing a writer does is
/// reachable from the published root until [`TreeWriter::close`] swaps it;
/// dropping the writer without closing aborts the session and recycles its
/// allocations.
pub struct TreeWriter<'a, L: Layout> {
    tree: &'a Tree<L>,
    generation: u64,
    root: PageId,
    leaf_capacity: usize,
    internal_capacity: usize,
    allocated: Vec<PageId>,
    freed: Vec<PageId>,
    hint: Option<LeafHint>,
    closed: bool,
}

/// Last leaf touched, with the encoded key interval its parent chain proved.
/// Valid while the leaf keeps its id, which holds for every in-place
/// mutation of an own-generation page; structural changes clear it.
struct LeafHint {
    leaf: PageId,
    /// Inclusive lower bound; `None` means leftmost.
    lower: Option<Vec<u8>>,
    /// Exclusive upper bound; `None` means rightmost.
    upper: Option<Vec<u8>>,
}

struct PathEntry {
    page: PageId,
    /// Child index the descent took, `0..=count`.
    child: usize,
}

struct Descent {
    path: Vec<PathEntry>,
    leaf: PageId,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
}

impl<'a, L: Layout> TreeWriter<'a, L> {
    pub(crate) fn new(tree: &'a Tree<L>, generation: u64) -> Self {
        let ks = tree.layout.key_size();
        let vs = tree.layout.value_size();
        Self {
            tree,
            generation,
            root: PageId(tree.visible_root.load(AtomicOrdering::SeqCst)),
            leaf_capacity: node::leaf_capacity(tree.page_size, ks, vs),
            internal_capacity: node::internal_capacity(tree.page_size, ks),
            allocated: Vec::new(),
            freed: Vec::new(),
            hint: None,
            closed: false,
        }
    }

    /// Read through this writer's working root: sees the writer's own
    /// uncommitted puts.
    pub fn get(&self, key: &L::Key) -> Result<Option<L::Value>> {
        let layout = &self.tree.layout;
        let ks = layout.key_size();
        let vs = layout.value_size();
        let mut encoded = vec![0u8; ks];
        layout.write_key(key, &mut encoded);
        let leaf = match self.hint_covers(&encoded)? {
            Some(leaf) => leaf,
            None => self.locate(key)?.leaf,
        };
        let page = self.tree.file.read_page(leaf)?;
        let data = page.data();
        match self.search_leaf(data, key) {
            Ok(found) => Ok(Some(
                layout.read_value(node::leaf_value_slice(data, ks, vs, found)),
            )),
            Err(_) => Ok(None),
        }
    }

    pub fn put(&mut self, key: &L::Key, value: &L::Value) -> Result<()> {
        self.tree.ensure_dirty_stamp()?;
        let layout = &self.tree.layout;
        let ks = layout.key_size();
        let vs = layout.value_size();
        let mut ke = vec![0u8; ks];
        layout.write_key(key, &mut ke);
        let mut ve = vec![0u8; vs];
        layout.write_value(value, &mut ve);

        if let Some(leaf) = self.hint_covers(&ke)? {
            let page = self.tree.file.read_page(leaf)?;
            let mut buf = page.data().to_vec();
            let count = node::count(&buf);
            match self.search_leaf(&buf, key) {
                Ok(found) => {
                    node::leaf_set_value(&mut buf, ks, vs, found, &ve);
                    self.tree.file.stage_page(leaf, buf);
                    return Ok(());
                }
                Err(at) if count < self.leaf_capacity => {
                    node::leaf_insert(&mut buf, ks, vs, at, &ke, &ve);
                    self.tree.file.stage_page(leaf, buf);
                    return Ok(());
                }
                Err(_) => self.hint = None,
            }
        }

        let descent = self.locate(key)?;
        let (leaf_id, mut buf) = self.ensure_writable(descent.leaf)?;
        let count = node::count(&buf);
        match self.search_leaf(&buf, key) {
            Ok(found) => {
                node::leaf_set_value(&mut buf, ks, vs, found, &ve);
                self.tree.file.stage_page(leaf_id, buf);
                self.fix_parents(&descent.path, descent.leaf, leaf_id, None)?;
                self.hint = Some(LeafHint {
                    leaf: leaf_id,
                    lower: descent.lower,
                    upper: descent.upper,
                });
            }
            Err(at) if count < self.leaf_capacity => {
                node::leaf_insert(&mut buf, ks, vs, at, &ke, &ve);
                self.tree.file.stage_page(leaf_id, buf);
                self.fix_parents(&descent.path, descent.leaf, leaf_id, None)?;
                self.hint = Some(LeafHint {
                    leaf: leaf_id,
                    lower: descent.lower,
                    upper: descent.upper,
                });
            }
            Err(_) => {
                let right_id = self.alloc();
                let mut right = vec![0u8; self.tree.page_size];
                node::init(&mut right, NodeKind::Leaf, self.generation);
                let separator = node::leaf_split(&mut buf, &mut right, ks, vs);
                let target = if layout.compare_encoded(&ke, &separator) == Ordering::Less {
                    &mut buf
                } else {
                    &mut right
                };
                let at = match self.search_leaf(target, key) {
                    Ok(_) => unreachable!("split of a leaf already holding the key"),
                    Err(at) => at,
                };
                node::leaf_insert(target, ks, vs, at, &ke, &ve);
                self.tree.file.stage_page(leaf_id, buf);
                self.tree.file.stage_page(right_id, right);
                self.hint = None;
                self.fix_parents(
                    &descent.path,
                    descent.leaf,
                    leaf_id,
                    Some((separator, right_id)),
                )?;
            }
        }
        Ok(())
    }

    /// Remove `key`. Empty leaves are unlinked from their parents; the root
    /// may collapse by one level.
    pub fn remove(&mut self, key: &L::Key) -> Result<bool> {
        self.tree.ensure_dirty_stamp()?;
        let layout = &self.tree.layout;
        let ks = layout.key_size();
        let vs = layout.value_size();
        let mut ke = vec![0u8; ks];
        layout.write_key(key, &mut ke);

        if let Some(leaf) = self.hint_covers(&ke)? {
            let page = self.tree.file.read_page(leaf)?;
            let mut buf = page.data().to_vec();
            match self.search_leaf(&buf, key) {
                Err(_) => return Ok(false),
                Ok(found) if node::count(&buf) > 1 => {
                    node::leaf_remove(&mut buf, ks, vs, found);
                    self.tree.file.stage_page(leaf, buf);
                    return Ok(true);
                }
                // Leaf would empty out; take the structural path below.
                Ok(_) => self.hint = None,
            }
        }

        let descent = self.locate(key)?;
        let page = self.tree.file.read_page(descent.leaf)?;
        let found = match self.search_leaf(page.data(), key) {
            Err(_) => return Ok(false),
            Ok(found) => found,
        };
        if node::count(page.data()) > 1 || descent.path.is_empty() {
            let (leaf_id, mut buf) = self.ensure_writable(descent.leaf)?;
            node::leaf_remove(&mut buf, ks, vs, found);
            let emptied_root = node::count(&buf) == 0;
            self.tree.file.stage_page(leaf_id, buf);
            self.fix_parents(&descent.path, descent.leaf, leaf_id, None)?;
            self.hint = (!emptied_root).then_some(LeafHint {
                leaf: leaf_id,
                lower: descent.lower,
                upper: descent.upper,
            });
        } else {
            self.release_node(descent.leaf)?;
            self.hint = None;
            self.remove_child(&descent.path)?;
        }
        Ok(true)
    }

    /// Publish this session: the working root becomes visible and freed
    /// pages enter the pending list for the next checkpoint.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        {
            let mut stable = self.tree.stable.lock();
            self.tree.visible_root.store(self.root.0, AtomicOrdering::SeqCst);
            stable.pending_free.append(&mut self.freed);
        }
        self.tree.seat.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    // --- internals --------------------------------------------------------

    fn search_leaf(&self, data: &[u8], key: &L::Key) -> std::result::Result<usize, usize> {
        let layout = &self.tree.layout;
        let ks = layout.key_size();
        let vs = layout.value_size();
        node::search(node::count(data), |idx| {
            layout.compare(
                &layout.read_key(node::leaf_key_slice(data, ks, vs, idx)),
                key,
            )
        })
    }

    fn locate(&self, key: &L::Key) -> Result<Descent> {
        let layout = &self.tree.layout;
        let ks = layout.key_size();
        let mut id = self.root;
        let mut path = Vec::new();
        let mut lower = None;
        let mut upper = None;
        loop {
            let page = self.tree.file.read_page(id)?;
            let data = page.data();
            match node::kind(data)? {
                NodeKind::Internal => {
                    let child = node::internal_descend_index(data, ks, |slot| {
                        layout.compare(&layout.read_key(slot), key)
                    });
                    if child > 0 {
                        lower = Some(node::internal_key_slice(data, ks, child - 1).to_vec());
                    }
                    if child < node::count(data) {
                        upper = Some(node::internal_key_slice(data, ks, child).to_vec());
                    }
                    path.push(PathEntry { page: id, child });
                    id = node::internal_child(data, ks, child);
                }
                NodeKind::Leaf => {
                    return Ok(Descent {
                        path,
                        leaf: id,
                        lower,
                        upper,
                    })
                }
            }
        }
    }

    fn hint_covers(&self, encoded_key: &[u8]) -> Result<Option<PageId>> {
        let layout = &self.tree.layout;
        let Some(hint) = &self.hint else {
            return Ok(None);
        };
        if let Some(lower) = &hint.lower {
            if layout.compare_encoded(encoded_key, lower) == Ordering::Less {
                return Ok(None);
            }
        }
        if let Some(upper) = &hint.upper {
            if layout.compare_encoded(encoded_key, upper) != Ordering::Less {
                return Ok(None);
            }
        }
        Ok(Some(hint.leaf))
    }

    fn alloc(&mut self) -> PageId {
        let id = {
            let mut stable = self.tree.stable.lock();
            stable.free.pop().unwrap_or_else(|| {
                let id = PageId(stable.next_page);
                stable.next_page += 1;
                id
            })
        };
        self.allocated.push(id);
        id
    }

    /// Working copy of a page. Own-generation pages keep their id; older
    /// pages move to a fresh id and the predecessor is queued for freeing.
    fn ensure_writable(&mut self, id: PageId) -> Result<(PageId, Vec<u8>)> {
        let page = self.tree.file.read_page(id)?;
        let mut buf = page.data().to_vec();
        if node::generation(&buf) == self.generation {
            return Ok((id, buf));
        }
        node::set_generation(&mut buf, self.generation);
        let new_id = self.alloc();
        self.freed.push(id);
        Ok((new_id, buf))
    }

    /// Queue a node for freeing and drop any staged content it had.
    fn release_node(&mut self, id: PageId) -> Result<()> {
        let page = self.tree.file.read_page(id)?;
        if node::generation(page.data()) == self.generation {
            self.tree.file.discard_staged(&[id]);
        }
        self.freed.push(id);
        Ok(())
    }

    /// Propagate a child id change and/or a split upward through `path`.
    fn fix_parents(
        &mut self,
        path: &[PathEntry],
        mut old_child: PageId,
        mut new_child: PageId,
        mut insert: Option<(Vec<u8>, PageId)>,
    ) -> Result<()> {
        let ks = self.tree.layout.key_size();
        for entry in path.iter().rev() {
            if old_child == new_child && insert.is_none() {
                return Ok(());
            }
            let (new_id, mut buf) = self.ensure_writable(entry.page)?;
            if old_child != new_child {
                node::internal_set_child(&mut buf, ks, entry.child, new_child);
            }
            if let Some((separator, right)) = insert.take() {
                let (mut seps, mut children) = node::internal_read(&buf, ks);
                seps.insert(entry.child, separator);
                children.insert(entry.child + 1, right);
                if seps.len() <= self.internal_capacity {
                    node::internal_write(&mut buf, ks, &seps, &children);
                } else {
                    let mid = seps.len() / 2;
                    let promoted = seps[mid].clone();
                    let right_seps = seps.split_off(mid + 1);
                    seps.pop();
                    let right_children = children.split_off(mid + 1);
                    let right_id = self.alloc();
                    let mut right_buf = vec![0u8; self.tree.page_size];
                    node::init(&mut right_buf, NodeKind::Internal, self.generation);
                    node::internal_write(&mut right_buf, ks, &right_seps, &right_children);
                    node::internal_write(&mut buf, ks, &seps, &children);
                    self.tree.file.stage_page(right_id, right_buf);
                    insert = Some((promoted, right_id));
                }
            }
            self.tree.file.stage_page(new_id, buf);
            old_child = entry.page;
            new_child = new_id;
        }
        if let Some((separator, right)) = insert {
            let root_id = self.alloc();
            let mut buf = vec![0u8; self.tree.page_size];
            node::internal_init_root(&mut buf, ks, self.generation, &separator, new_child, right);
            self.tree.file.stage_page(root_id, buf);
            self.root = root_id;
        } else if new_child != old_child {
            self.root = new_child;
        }
        Ok(())
    }

    /// Unlink the child `path` descends into from its parent, releasing
    /// ancestors that empty out along the way.
    fn remove_child(&mut self, path: &[PathEntry]) -> Result<()> {
        let ks = self.tree.layout.key_size();
        let mut depth = path.len();
        loop {
            if depth == 0 {
                // Every ancestor emptied: the tree shrinks to an empty root.
                let root_id = self.alloc();
                let mut buf = vec![0u8; self.tree.page_size];
                node::init(&mut buf, NodeKind::Leaf, self.generation);
                self.tree.file.stage_page(root_id, buf);
                self.root = root_id;
                return Ok(());
            }
            let entry = &path[depth - 1];
            let page = self.tree.file.read_page(entry.page)?;
            if node::count(page.data()) == 0 {
                // Only child is the one being removed; release and ascend.
                self.release_node(entry.page)?;
                depth -= 1;
                continue;
            }
            let (new_id, mut buf) = self.ensure_writable(entry.page)?;
            let (mut seps, mut children) = node::internal_read(&buf, ks);
            children.remove(entry.child);
            let sep_idx = entry.child.saturating_sub(1);
            seps.remove(sep_idx);
            if depth == 1 && children.len() == 1 {
                // Root internal left with a single child: collapse a level.
                self.unwind_copy(entry.page, new_id);
                self.root = children[0];
                return Ok(());
            }
            node::internal_write(&mut buf, ks, &seps, &children);
            self.tree.file.stage_page(new_id, buf);
            self.fix_parents(&path[..depth - 1], entry.page, new_id, None)?;
            return Ok(());
        }
    }

    /// Undo an `ensure_writable` whose result turned out unnecessary.
    fn unwind_copy(&mut self, old: PageId, new: PageId) {
        if new == old {
            self.tree.file.discard_staged(&[old]);
            self.freed.push(old);
        } else {
            // `old` is already queued; hand the fresh copy straight back.
            self.tree.file.discard_staged(&[new]);
            self.allocated.retain(|&id| id != new);
            self.tree.stable.lock().free.push(new);
        }
    }
}

impl<L: Layout> Drop for TreeWriter<'_, L> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Abort: nothing this session staged is reachable from the
        // published root, so discard it all and recycle the ids.
        self.tree.file.discard_staged(&self.allocated);
        {
            let mut stable = self.tree.stable.lock();
            stable.free.append(&mut self.allocated);
        }
        self.tree.seat.store(false, AtomicOrdering::SeqCst);
        debug!("tree writer aborted without close");
    }
}
