use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

use crate::error::FarolError;
use crate::primitives::pager::{PageCache, Unlimited};

use super::layout::Layout;
use super::{CollectingVisitor, Tree, TreeOpen, TreeOptions};

struct U64Layout;

impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    fn key_size(&self) -> usize {
        8
    }

    fn value_size(&self) -> usize {
        8
    }

    fn identifier(&self) -> u64 {
        0x7465_7374_0001
    }

    fn version(&self) -> u8 {
        1
    }

    fn write_key(&self, key: &u64, dst: &mut [u8]) {
        dst.copy_from_slice(&key.to_be_bytes());
    }

    fn read_key(&self, src: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(src);
        u64::from_be_bytes(raw)
    }

    fn write_value(&self, value: &u64, dst: &mut [u8]) {
        dst.copy_from_slice(&value.to_be_bytes());
    }

    fn read_value(&self, src: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(src);
        u64::from_be_bytes(raw)
    }

    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }
}

fn open_tree(path: &Path, page_size: usize) -> Tree<U64Layout> {
    open_tree_with_header(path, page_size, vec![]).0
}

fn open_tree_with_header(
    path: &Path,
    page_size: usize,
    initial_header: Vec<u8>,
) -> (Tree<U64Layout>, Vec<u8>, bool) {
    let cache = PageCache::new(64);
    let options = TreeOptions {
        page_size,
        initial_header,
        ..TreeOptions::default()
    };
    match Tree::open(&cache, path, U64Layout, options, None).unwrap() {
        TreeOpen::Opened {
            tree,
            created,
            header,
            ..
        } => (tree, header, created),
        TreeOpen::Mismatch => panic!("unexpected metadata mismatch"),
    }
}

fn scan_all(tree: &Tree<U64Layout>) -> Vec<(u64, u64)> {
    let mut seeker = tree.seek(Bound::Unbounded, Bound::Unbounded).unwrap();
    let mut out = Vec::new();
    while let Some(entry) = seeker.next().unwrap() {
        out.push(entry);
    }
    out
}

#[test]
fn random_ops_match_reference() {
    let dir = tempdir().unwrap();
    let tree = open_tree(&dir.path().join("t"), 256);
    let mut reference = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xfa201);
    for _round in 0..40 {
        let mut writer = tree.writer().unwrap();
        for _ in 0..50 {
            let key = rng.gen_range(0..400u64);
            if rng.gen_bool(0.7) {
                let value = rng.gen::<u64>();
                writer.put(&key, &value).unwrap();
                reference.insert(key, value);
            } else {
                let removed = writer.remove(&key).unwrap();
                assert_eq!(removed, reference.remove(&key).is_some());
            }
            assert_eq!(writer.get(&key).unwrap(), reference.get(&key).copied());
        }
        writer.close().unwrap();
        let expected: Vec<(u64, u64)> = reference.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(scan_all(&tree), expected);
    }
    let mut visitor = CollectingVisitor::default();
    assert!(tree.consistency_check(&mut visitor, None).unwrap());
    assert!(visitor.faults.is_empty());
}

#[test]
fn sorted_batch_exercises_leaf_hint() {
    let dir = tempdir().unwrap();
    let tree = open_tree(&dir.path().join("t"), 256);
    let mut writer = tree.writer().unwrap();
    for key in 0..500u64 {
        writer.put(&key, &(key * 3)).unwrap();
    }
    for key in (0..500u64).step_by(2) {
        assert!(writer.remove(&key).unwrap());
    }
    writer.close().unwrap();
    let expected: Vec<(u64, u64)> = (0..500u64)
        .filter(|k| k % 2 == 1)
        .map(|k| (k, k * 3))
        .collect();
    assert_eq!(scan_all(&tree), expected);
}

#[test]
fn seek_respects_bounds() {
    let dir = tempdir().unwrap();
    let tree = open_tree(&dir.path().join("t"), 256);
    let mut writer = tree.writer().unwrap();
    for key in (0..100u64).map(|k| k * 3) {
        writer.put(&key, &key).unwrap();
    }
    writer.close().unwrap();

    let collect = |lo: Bound<u64>, hi: Bound<u64>| {
        let mut seeker = tree.seek(lo, hi).unwrap();
        let mut keys = Vec::new();
        while let Some((key, _)) = seeker.next().unwrap() {
            keys.push(key);
        }
        keys
    };

    assert_eq!(
        collect(Bound::Included(9), Bound::Excluded(21)),
        vec![9, 12, 15, 18]
    );
    assert_eq!(
        collect(Bound::Excluded(9), Bound::Included(15)),
        vec![12, 15]
    );
    assert_eq!(
        collect(Bound::Included(10), Bound::Excluded(12)),
        Vec::<u64>::new()
    );
    // lo > hi yields an empty seeker.
    assert_eq!(
        collect(Bound::Included(50), Bound::Included(10)),
        Vec::<u64>::new()
    );
    assert_eq!(
        collect(Bound::Included(297), Bound::Unbounded),
        vec![297]
    );
}

#[test]
fn readers_see_the_snapshot_at_creation() {
    let dir = tempdir().unwrap();
    let tree = open_tree(&dir.path().join("t"), 256);
    let mut writer = tree.writer().unwrap();
    writer.put(&1, &10).unwrap();
    writer.close().unwrap();

    let mut old_reader = tree.seek(Bound::Unbounded, Bound::Unbounded).unwrap();
    let mut writer = tree.writer().unwrap();
    writer.put(&2, &20).unwrap();
    // Not yet closed: fresh readers still see the old root.
    assert_eq!(scan_all(&tree), vec![(1, 10)]);
    writer.close().unwrap();

    // Created before the close, still pinned to the old snapshot.
    let mut old_keys = Vec::new();
    while let Some((key, _)) = old_reader.next().unwrap() {
        old_keys.push(key);
    }
    assert_eq!(old_keys, vec![1]);
    assert_eq!(scan_all(&tree), vec![(1, 10), (2, 20)]);
}

#[test]
fn dropped_writer_discards_its_session() {
    let dir = tempdir().unwrap();
    let tree = open_tree(&dir.path().join("t"), 256);
    {
        let mut writer = tree.writer().unwrap();
        for key in 0..50u64 {
            writer.put(&key, &key).unwrap();
        }
        // No close.
    }
    assert_eq!(scan_all(&tree), vec![]);
    // The seat is free again.
    let mut writer = tree.writer().unwrap();
    writer.put(&7, &7).unwrap();
    writer.close().unwrap();
    assert_eq!(scan_all(&tree), vec![(7, 7)]);
}

#[test]
fn second_writer_is_refused_without_blocking() {
    let dir = tempdir().unwrap();
    let tree = open_tree(&dir.path().join("t"), 256);
    let writer = tree.writer().unwrap();
    assert!(matches!(tree.writer(), Err(FarolError::WriterBusy)));
    drop(writer);
    assert!(tree.writer().is_ok());
}

#[test]
fn checkpoint_then_reopen_restores_content_and_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t");
    let (tree, header, created) = open_tree_with_header(&path, 256, vec![0x01]);
    assert!(created);
    assert_eq!(header, vec![0x01]);
    let mut writer = tree.writer().unwrap();
    for key in 0..200u64 {
        writer.put(&key, &(key + 1)).unwrap();
    }
    writer.close().unwrap();
    tree.checkpoint(&Unlimited, &[0x00]).unwrap();

    // Updates after the checkpoint are lost on reopen.
    let mut writer = tree.writer().unwrap();
    writer.put(&999, &999).unwrap();
    writer.close().unwrap();
    drop(tree);

    let (tree, header, created) = open_tree_with_header(&path, 0, vec![]);
    assert!(!created);
    assert_eq!(header, vec![0x00]);
    let expected: Vec<(u64, u64)> = (0..200u64).map(|k| (k, k + 1)).collect();
    assert_eq!(scan_all(&tree), expected);
}

#[test]
fn draining_the_tree_collapses_to_an_empty_root() {
    let dir = tempdir().unwrap();
    let tree = open_tree(&dir.path().join("t"), 128);
    let mut writer = tree.writer().unwrap();
    for key in 0..300u64 {
        writer.put(&key, &key).unwrap();
    }
    writer.close().unwrap();
    let mut writer = tree.writer().unwrap();
    for key in 0..300u64 {
        assert!(writer.remove(&key).unwrap());
        assert!(!writer.remove(&key).unwrap());
    }
    writer.close().unwrap();
    assert_eq!(scan_all(&tree), vec![]);
    assert!(tree.last_entry().unwrap().is_none());
    let mut visitor = CollectingVisitor::default();
    assert!(tree.consistency_check(&mut visitor, None).unwrap());

    let mut writer = tree.writer().unwrap();
    writer.put(&42, &42).unwrap();
    writer.close().unwrap();
    assert_eq!(tree.last_entry().unwrap(), Some((42, 42)));
}

#[test]
fn checkpoints_recycle_freed_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t");
    let tree = open_tree(&path, 256);
    for round in 0..30u64 {
        let mut writer = tree.writer().unwrap();
        for key in 0..100u64 {
            writer.put(&key, &(round * 1000 + key)).unwrap();
        }
        writer.close().unwrap();
        tree.checkpoint(&Unlimited, &[]).unwrap();
    }
    // Rewriting the same 100 keys thirty times must not grow the file
    // thirty-fold; freed pages come back through the free list.
    let pages = std::fs::metadata(&path).unwrap().len() / 256;
    assert!(pages < 200, "file grew to {pages} pages");
}

#[test]
fn layout_disagreement_is_fatal() {
    struct OtherLayout;
    impl Layout for OtherLayout {
        type Key = u64;
        type Value = u64;
        fn key_size(&self) -> usize {
            8
        }
        fn value_size(&self) -> usize {
            8
        }
        fn identifier(&self) -> u64 {
            0xdead
        }
        fn version(&self) -> u8 {
            1
        }
        fn write_key(&self, key: &u64, dst: &mut [u8]) {
            dst.copy_from_slice(&key.to_be_bytes());
        }
        fn read_key(&self, src: &[u8]) -> u64 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(src);
            u64::from_be_bytes(raw)
        }
        fn write_value(&self, value: &u64, dst: &mut [u8]) {
            dst.copy_from_slice(&value.to_be_bytes());
        }
        fn read_value(&self, src: &[u8]) -> u64 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(src);
            u64::from_be_bytes(raw)
        }
        fn compare(&self, a: &u64, b: &u64) -> Ordering {
            a.cmp(b)
        }
    }

    let dir = tempdir().unwrap();
    let path = dir.path().join("t");
    drop(open_tree(&path, 256));
    let cache = PageCache::new(16);
    let result = Tree::open(&cache, &path, OtherLayout, TreeOptions::default(), None);
    assert!(matches!(
        result,
        Err(FarolError::LayoutMismatch { .. })
    ));
}

#[test]
fn unreadable_metadata_reports_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t");
    drop(open_tree(&path, 256));
    // Clobber the magic.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] = b'?';
    std::fs::write(&path, &bytes).unwrap();
    let cache = PageCache::new(16);
    let outcome = Tree::open(&cache, &path, U64Layout, TreeOptions::default(), None).unwrap();
    assert!(matches!(outcome, TreeOpen::Mismatch));
}

#[test]
fn explicit_page_size_change_reports_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t");
    drop(open_tree(&path, 256));
    let cache = PageCache::new(16);
    let options = TreeOptions {
        page_size: 512,
        ..TreeOptions::default()
    };
    let outcome = Tree::open(&cache, &path, U64Layout, options, None).unwrap();
    assert!(matches!(outcome, TreeOpen::Mismatch));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn operation_sequences_match_reference(
        ops in proptest::collection::vec((any::<bool>(), 0..200u64, any::<u64>()), 1..300)
    ) {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t"), 256);
        let mut reference = BTreeMap::new();
        let mut writer = tree.writer().unwrap();
        for (is_put, key, value) in ops {
            if is_put {
                writer.put(&key, &value).unwrap();
                reference.insert(key, value);
            } else {
                let removed = writer.remove(&key).unwrap();
                prop_assert_eq!(removed, reference.remove(&key).is_some());
            }
        }
        writer.close().unwrap();
        let expected: Vec<(u64, u64)> = reference.into_iter().collect();
        prop_assert_eq!(scan_all(&tree), expected);
    }
}
