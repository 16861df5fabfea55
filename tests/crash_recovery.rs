//! Crash, rebuild, and recovery-cleanup scenarios.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::tempdir;

use farol::store::{
    label_scan_store_file, LabelScanLayout, RangeWidth, VecChangeStream, CLEAN, NEEDS_REBUILD,
};
use farol::tree::{Tree, TreeOpen, TreeOptions};
use farol::{
    CheckFault, CollectingVisitor, DeferredCleanup, FarolError, ImmediateCleanup, IndexEvent,
    LabelId, LabelScanStore, MonitorSink, Monitors, NodeId, PageCache, StoreConfig, Unlimited,
};

fn build_store(
    path: PathBuf,
    config: StoreConfig,
    stream: VecChangeStream,
    monitors: Monitors,
    cleanup: Arc<dyn farol::CleanupWorkCollector>,
) -> LabelScanStore {
    let mut store = LabelScanStore::new(
        PageCache::new(256),
        path,
        Box::new(stream),
        config,
        monitors,
        cleanup,
    );
    store.init().unwrap();
    store.start().unwrap();
    store
}

fn open_store(dir: &Path, config: StoreConfig, stream: VecChangeStream) -> LabelScanStore {
    build_store(
        label_scan_store_file(dir),
        config,
        stream,
        Monitors::new(),
        Arc::new(ImmediateCleanup),
    )
}

fn nodes_with_label(store: &LabelScanStore, label: u32) -> Vec<u64> {
    store
        .new_reader()
        .unwrap()
        .nodes_with_label(LabelId(label))
        .unwrap()
        .to_vec()
        .unwrap()
        .into_iter()
        .map(|node| node.0)
        .collect()
}

fn add(node: u64, label: u32) -> farol::NodeLabelUpdate {
    farol::NodeLabelUpdate::new(NodeId(node), [], [LabelId(label)])
}

#[derive(Default)]
struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl MonitorSink for EventLog {
    fn notify(&self, event: &IndexEvent) {
        self.0.lock().unwrap().push(format!("{event:?}"));
    }
}

/// A change stream that must never be consulted.
struct PanicStream;

impl farol::FullStoreChangeStream for PanicStream {
    fn apply_to(&mut self, _writer: &mut farol::store::BulkAppendWriter<'_>) -> farol::Result<u64> {
        panic!("rebuild ran on a store that was forced clean");
    }
}

#[test]
fn crash_before_force_rebuilds_from_the_change_stream() {
    let dir = tempdir().unwrap();
    let updates: Vec<_> = (0..1000u64).map(|node| add(node, 3)).collect();
    {
        let mut store = open_store(dir.path(), StoreConfig::default(), VecChangeStream::empty());
        store.apply_updates(updates.clone()).unwrap();
        assert_eq!(nodes_with_label(&store, 3).len(), 1000);
        // Crash: shutdown without force. On disk the tree rolls back to the
        // empty start-time checkpoint, and the dirty stamp written at the
        // first update makes the next open notice.
        store.shutdown().unwrap();
    }

    // Replay through a rebuild-capable reopen: content must come back even
    // though the updates themselves were never checkpointed.
    let monitors = Monitors::new();
    let log = Arc::new(EventLog::default());
    monitors.register(log.clone());
    let store = build_store(
        label_scan_store_file(dir.path()),
        StoreConfig::default(),
        VecChangeStream::new(updates),
        monitors,
        Arc::new(ImmediateCleanup),
    );
    assert_eq!(nodes_with_label(&store, 3), (0..1000).collect::<Vec<u64>>());
}

#[test]
fn crash_before_any_force_reopens_dirty() {
    let dir = tempdir().unwrap();
    let path = label_scan_store_file(dir.path());
    // Create the tree directly with the rebuild flag, mimicking a store
    // that crashed after creation but before its first force.
    {
        let cache = PageCache::new(64);
        let options = TreeOptions {
            initial_header: vec![NEEDS_REBUILD],
            ..TreeOptions::default()
        };
        let opened = Tree::open(
            &cache,
            &path,
            LabelScanLayout::new(RangeWidth::W64),
            options,
            None,
        )
        .unwrap();
        match opened {
            TreeOpen::Opened { tree, created, .. } => {
                assert!(created);
                drop(tree);
            }
            TreeOpen::Mismatch => panic!("fresh tree failed to open"),
        }
    }

    let monitors = Monitors::new();
    let log = Arc::new(EventLog::default());
    monitors.register(log.clone());
    let store = build_store(
        label_scan_store_file(dir.path()),
        StoreConfig::default(),
        VecChangeStream::new(vec![add(7, 2)]),
        monitors,
        Arc::new(ImmediateCleanup),
    );
    let entries = log.entries();
    assert!(entries.iter().any(|entry| entry == "NotValidIndex"));
    assert!(entries.iter().any(|entry| entry == "Rebuilding"));
    assert_eq!(nodes_with_label(&store, 2), vec![7]);
}

#[test]
fn forced_store_reopens_without_replay() {
    let dir = tempdir().unwrap();
    let updates: Vec<_> = (0..500u64).map(|node| add(node, 4)).collect();
    {
        let mut store = open_store(dir.path(), StoreConfig::default(), VecChangeStream::empty());
        store.apply_updates(updates).unwrap();
        store.force(&Unlimited).unwrap();
        store.shutdown().unwrap();
    }

    // PanicStream proves no rebuild happens on a cleanly forced store.
    let mut store = LabelScanStore::new(
        PageCache::new(256),
        label_scan_store_file(dir.path()),
        Box::new(PanicStream),
        StoreConfig::default(),
        Monitors::new(),
        Arc::new(ImmediateCleanup),
    );
    store.init().unwrap();
    store.start().unwrap();
    assert_eq!(nodes_with_label(&store, 4), (0..500).collect::<Vec<u64>>());
    assert!(!store.is_empty().unwrap());
}

#[test]
fn empty_change_stream_rebuild_yields_a_clean_empty_store() {
    let dir = tempdir().unwrap();
    {
        let mut store = open_store(dir.path(), StoreConfig::default(), VecChangeStream::empty());
        assert!(store.is_empty().unwrap());
        store.shutdown().unwrap();
    }
    // The start-time checkpoint wrote CLEAN: reopening must not rebuild.
    let mut store = LabelScanStore::new(
        PageCache::new(64),
        label_scan_store_file(dir.path()),
        Box::new(PanicStream),
        StoreConfig::default(),
        Monitors::new(),
        Arc::new(ImmediateCleanup),
    );
    store.init().unwrap();
    store.start().unwrap();
    assert!(store.is_empty().unwrap());
}

#[test]
fn corrupted_header_on_a_read_only_store_degrades_gracefully() {
    let dir = tempdir().unwrap();
    let path = label_scan_store_file(dir.path());
    {
        let mut store = open_store(dir.path(), StoreConfig::default(), VecChangeStream::empty());
        store.apply_updates([add(1, 1), add(2, 1)]).unwrap();
        store.force(&Unlimited).unwrap();
        store.shutdown().unwrap();
    }
    // Flip the header back to NEEDS_REBUILD behind the store's back.
    {
        let cache = PageCache::new(64);
        let opened = Tree::open(
            &cache,
            &path,
            LabelScanLayout::new(RangeWidth::W64),
            TreeOptions::default(),
            None,
        )
        .unwrap();
        match opened {
            TreeOpen::Opened { tree, header, .. } => {
                assert_eq!(header, vec![CLEAN]);
                tree.checkpoint(&Unlimited, &[NEEDS_REBUILD]).unwrap();
            }
            TreeOpen::Mismatch => panic!("expected a valid tree"),
        }
    }

    // Read-only: start succeeds, writers refuse, the last checkpoint is
    // still served.
    let store = open_store(dir.path(), StoreConfig::read_only(), VecChangeStream::empty());
    assert!(matches!(store.new_writer(), Err(FarolError::NotWritable)));
    assert_eq!(nodes_with_label(&store, 1), vec![1, 2]);

    // Writable: the dirty header triggers drop + rebuild instead.
    drop(store);
    let store = open_store(
        dir.path(),
        StoreConfig::default(),
        VecChangeStream::new(vec![add(9, 1)]),
    );
    assert_eq!(nodes_with_label(&store, 1), vec![9]);
}

#[test]
fn rebuild_is_idempotent() {
    let updates: Vec<_> = (0..700u64)
        .map(|node| farol::NodeLabelUpdate::new(NodeId(node), [], [LabelId((node % 4) as u32)]))
        .collect();
    let mut all_ranges = Vec::new();
    for _ in 0..2 {
        let dir = tempdir().unwrap();
        let store = open_store(
            dir.path(),
            StoreConfig::default(),
            VecChangeStream::new(updates.clone()),
        );
        all_ranges.push(store.all_node_label_ranges().unwrap().to_vec().unwrap());
    }
    assert_eq!(all_ranges[0], all_ranges[1]);
}

#[test]
fn cleanup_reclaims_pages_leaked_by_a_crashed_writer() {
    let dir = tempdir().unwrap();
    let path = label_scan_store_file(dir.path());
    {
        let config = StoreConfig {
            writer_batch_size: 8,
            ..StoreConfig::default()
        };
        let store = build_store(
            path.clone(),
            config,
            VecChangeStream::empty(),
            Monitors::new(),
            Arc::new(ImmediateCleanup),
        );
        store.apply_updates((0..600u64).map(|node| add(node, 1))).unwrap();
        store.force(&Unlimited).unwrap();

        // A writer flushes batches into the tree, a force checkpoints its
        // in-flight pages, then the writer dies without closing: the pages
        // are on disk but unreachable from the checkpointed root.
        let mut writer = store.new_writer().unwrap();
        for node in 600..900u64 {
            writer.write(&add(node, 2)).unwrap();
        }
        store.force(&Unlimited).unwrap();
        drop(writer);
        // Crash: no further force.
    }

    let cleanup = Arc::new(DeferredCleanup::new());
    let monitors = Monitors::new();
    let log = Arc::new(EventLog::default());
    monitors.register(log.clone());
    let store = build_store(
        path,
        StoreConfig::default(),
        VecChangeStream::empty(),
        monitors,
        cleanup.clone(),
    );
    assert_eq!(nodes_with_label(&store, 1).len(), 600);
    assert_eq!(nodes_with_label(&store, 2), Vec::<u64>::new());

    // Before the cleanup job runs, the leaked pages show up as orphans.
    let mut visitor = CollectingVisitor::default();
    assert!(!store.consistency_check(&mut visitor).unwrap());
    assert!(visitor
        .faults
        .iter()
        .all(|fault| matches!(fault, CheckFault::OrphanedPage { .. })));
    assert!(!visitor.faults.is_empty());

    cleanup.run_pending();
    let entries = log.entries();
    assert!(entries.iter().any(|entry| entry == "CleanupRegistered"));
    assert!(entries.iter().any(|entry| entry.contains("CleanupFinished")));

    let mut visitor = CollectingVisitor::default();
    assert!(store.consistency_check(&mut visitor).unwrap());
}

#[test]
fn planted_zero_bitset_fails_the_consistency_check() {
    let dir = tempdir().unwrap();
    let path = label_scan_store_file(dir.path());
    {
        let cache = PageCache::new(64);
        let options = TreeOptions {
            initial_header: vec![CLEAN],
            ..TreeOptions::default()
        };
        let opened = Tree::open(
            &cache,
            &path,
            LabelScanLayout::new(RangeWidth::W64),
            options,
            None,
        )
        .unwrap();
        let TreeOpen::Opened { tree, .. } = opened else {
            panic!("fresh tree failed to open");
        };
        let mut writer = tree.writer().unwrap();
        writer
            .put(
                &farol::store::LabelScanKey::new(LabelId(3), 0),
                &farol::store::LabelScanValue::new(0),
            )
            .unwrap();
        writer.close().unwrap();
        tree.checkpoint(&Unlimited, &[CLEAN]).unwrap();
    }

    let store = open_store(dir.path(), StoreConfig::default(), VecChangeStream::empty());
    let mut visitor = CollectingVisitor::default();
    assert!(!store.consistency_check(&mut visitor).unwrap());
    assert!(visitor
        .faults
        .iter()
        .any(|fault| matches!(fault, CheckFault::InvalidValue { .. })));
}
