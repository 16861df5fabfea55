use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{LabelId, NodeId};

pub type Result<T> = std::result::Result<T, FarolError>;

#[derive(Debug, Error)]
pub enum FarolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("store is read-only")]
    NotWritable,
    #[error("another writer is already open")]
    WriterBusy,
    #[error("store needs rebuild before it accepts writes")]
    StoreDirty,
    #[error("layout mismatch: file carries {found:#018x}, expected {expected:#018x}")]
    LayoutMismatch { expected: u64, found: u64 },
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("store file missing: {}", .0.display())]
    FileMissing(PathBuf),
    #[error("update both adds and removes label {label} for node {node}")]
    InvalidUpdate { node: NodeId, label: LabelId },
}

impl FarolError {
    pub(crate) fn corruption(detail: impl Into<String>) -> Self {
        FarolError::Corruption(detail.into())
    }
}
