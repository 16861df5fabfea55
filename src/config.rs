use crate::store::layout::RangeWidth;

/// Store configuration. Plain data; every knob has a sensible default.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Refuse all writer acquisitions and permit a dirty open without
    /// rebuild.
    pub read_only: bool,
    /// Tree page size in bytes; 0 picks the page-cache default.
    pub page_size: usize,
    /// Bits per bitset value. Fixed at store creation.
    pub range_width: RangeWidth,
    /// Maximum pending tuples in a batching writer before an auto-flush.
    pub writer_batch_size: usize,
    /// Emit per-merge audit records to an append-only log beside the store
    /// file.
    pub write_monitor_enabled: bool,
    /// Page-cache frame budget.
    pub cache_frames: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            page_size: 0,
            range_width: RangeWidth::W64,
            writer_batch_size: 1000,
            write_monitor_enabled: false,
            cache_frames: 1024,
        }
    }
}

impl StoreConfig {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn audited() -> Self {
        Self {
            write_monitor_enabled: true,
            ..Self::default()
        }
    }
}
