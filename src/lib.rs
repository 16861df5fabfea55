//! farol — a persistent, recoverable label-scan index for graph stores.
//!
//! Answers "which nodes carry label L?" from a `(label, node-id-range) →
//! bitset` mapping kept in a copy-on-write B+ tree over a single paged
//! file. Single writer, unbounded snapshot readers, checkpoint-based
//! durability with a header-bit rebuild protocol for crash recovery.

pub mod config;
pub mod error;
pub mod primitives;
pub mod store;
pub mod tree;
pub mod types;

pub use crate::config::StoreConfig;
pub use crate::error::{FarolError, Result};
pub use crate::primitives::pager::{FlushLimiter, PageCache, Unlimited};
pub use crate::store::{
    label_scan_store_file, FullStoreChangeStream, IndexEvent, LabelRange, LabelScanReader,
    LabelScanStore, LabelScanWriter, MonitorSink, Monitors, NodeLabelUpdate, RangeWidth,
    VecChangeStream, LABEL_SCAN_STORE_FILE_NAME,
};
pub use crate::tree::{
    CheckFault, CheckVisitor, CleanupWorkCollector, CollectingVisitor, DeferredCleanup,
    ImmediateCleanup,
};
pub use crate::types::{LabelId, NodeId};
