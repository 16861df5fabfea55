//! The label scan store: `(label, node-id-range) → bitset` atop the tree.

pub mod bulk;
pub mod check;
pub mod layout;
pub mod monitor;
pub mod reader;
mod store;
pub mod update;
pub mod write_monitor;
pub mod writer;

pub use bulk::BulkAppendWriter;
pub use check::indexed_part_name;
pub use layout::{LabelScanKey, LabelScanLayout, LabelScanValue, RangeWidth};
pub use monitor::{IndexEvent, MonitorSink, Monitors};
pub use reader::{AllLabelRanges, LabelRange, LabelScanReader, NodeIdStream};
pub use store::{
    label_scan_store_file, LabelScanStore, CLEAN, LABEL_SCAN_STORE_FILE_NAME, NEEDS_REBUILD,
};
pub use update::{FullStoreChangeStream, NodeLabelUpdate, VecChangeStream};
pub use write_monitor::{NoopWriteMonitor, WriteLog, WriteMonitor};
pub use writer::LabelScanWriter;
