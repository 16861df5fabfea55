//! Per-merge audit trail.
//!
//! When enabled, every tuple the batching writer applies is appended as one
//! JSON line to a log beside the store file. The monitor never fails a
//! write: log trouble is reported through `tracing` and the merge proceeds.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::types::LabelId;

pub trait WriteMonitor: Send + Sync {
    fn merge(&self, label: LabelId, range: u64, add: u64, remove: u64, result: u64);
    fn flushed(&self, tuples: usize) {
        let _ = tuples;
    }
    fn force(&self) {}
    fn close(&self) {}
}

pub struct NoopWriteMonitor;

impl WriteMonitor for NoopWriteMonitor {
    fn merge(&self, _label: LabelId, _range: u64, _add: u64, _remove: u64, _result: u64) {}
}

#[derive(Serialize)]
struct MergeRecord {
    label: u32,
    range: u64,
    add: u64,
    remove: u64,
    result: u64,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ControlRecord {
    Flushed { tuples: usize },
    Forced,
}

/// Append-only JSON-lines audit log.
pub struct WriteLog {
    out: Mutex<Option<BufWriter<std::fs::File>>>,
    path: PathBuf,
}

impl WriteLog {
    /// Opens `<store file>.writelog` next to the store file.
    pub fn open(store_file: &Path) -> Result<Self> {
        let mut name = store_file
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".writelog");
        let path = store_file.with_file_name(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            out: Mutex::new(Some(BufWriter::new(file))),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append<T: Serialize>(&self, record: &T) {
        let mut guard = self.out.lock();
        let Some(out) = guard.as_mut() else {
            return;
        };
        let outcome = serde_json::to_writer(&mut *out, record)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"));
        if let Err(err) = outcome {
            warn!(path = %self.path.display(), error = %err, "write monitor append failed");
        }
    }
}

impl WriteMonitor for WriteLog {
    fn merge(&self, label: LabelId, range: u64, add: u64, remove: u64, result: u64) {
        self.append(&MergeRecord {
            label: label.0,
            range,
            add,
            remove,
            result,
        });
    }

    fn flushed(&self, tuples: usize) {
        self.append(&ControlRecord::Flushed { tuples });
    }

    fn force(&self) {
        self.append(&ControlRecord::Forced);
        if let Some(out) = self.out.lock().as_mut() {
            let _ = out.flush();
        }
    }

    fn close(&self) {
        let mut guard = self.out.lock();
        if let Some(mut out) = guard.take() {
            let _ = out.flush();
        }
    }
}
