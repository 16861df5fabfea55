//! Consistency check entry point.

use tracing::info;

use crate::error::Result;
use crate::tree::CheckVisitor;

use super::layout::{LabelScanKey, LabelScanValue};
use super::store::LabelScanStore;

/// Progress part name for one checking pass over a store file. Unique and
/// human readable per store: the file name alone for the default pass, or
/// `{file}_pass_{prefix}` for a named pass.
pub fn indexed_part_name(store_file_name: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        store_file_name.to_string()
    } else {
        format!("{store_file_name}_pass_{prefix}")
    }
}

impl LabelScanStore {
    /// Structural tree check plus the store's own invariant: no stored
    /// bitset is zero. Faults go to the visitor, the verdict comes back as
    /// a boolean.
    pub fn consistency_check(&self, visitor: &mut dyn CheckVisitor) -> Result<bool> {
        let file_name = self
            .path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("labelscan");
        let part = indexed_part_name(file_name, "");
        info!(part = %part, "label scan store consistency check");
        let mut no_zero = |key: &LabelScanKey, value: &LabelScanValue| -> Option<String> {
            value.is_empty().then(|| {
                format!(
                    "empty bitset stored for label {} range {}",
                    key.label, key.range
                )
            })
        };
        self.tree()?.consistency_check(visitor, Some(&mut no_zero))
    }
}
