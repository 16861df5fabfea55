//! Recovery cleanup plumbing.
//!
//! Opening an existing writable tree registers a reclamation job with the
//! caller-supplied collector: pages that are unreachable from the root and
//! absent from the free lists are leaked (a crash between the data flush and
//! the state write, or an aborted writer whose pages were checkpointed) and
//! are returned to the free list. The collector decides where and when jobs
//! run; the tree never schedules threads.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::primitives::pager::PagedFile;
use crate::types::PageId;

use super::core::Bookkeeping;
use super::node::{self, NodeKind};
use super::state::FIRST_DATA_PAGE;

/// Notifications emitted around cleanup work.
#[derive(Clone, Debug)]
pub enum TreeEvent {
    CleanupRegistered,
    CleanupStarted,
    CleanupFinished {
        pages_visited: u64,
        tree_nodes: u64,
        pages_reclaimed: u64,
        duration: Duration,
    },
    CleanupClosed,
    CleanupFailed { error: String },
}

pub type TreeEventSink = Arc<dyn Fn(TreeEvent) + Send + Sync>;

pub type CleanupJob = Box<dyn FnOnce() + Send + 'static>;

/// Accepts background cleanup jobs from the tree.
pub trait CleanupWorkCollector: Send + Sync {
    fn add(&self, job: CleanupJob);
}

/// Runs each job on the registering thread, immediately.
pub struct ImmediateCleanup;

impl CleanupWorkCollector for ImmediateCleanup {
    fn add(&self, job: CleanupJob) {
        job();
    }
}

/// Queues jobs until the owner drains them on its own worker pool.
#[derive(Default)]
pub struct DeferredCleanup {
    queue: Mutex<Vec<CleanupJob>>,
}

impl DeferredCleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_pending(&self) {
        let jobs = std::mem::take(&mut *self.queue.lock());
        for job in jobs {
            job();
        }
    }
}

impl CleanupWorkCollector for DeferredCleanup {
    fn add(&self, job: CleanupJob) {
        self.queue.lock().push(job);
    }
}

fn notify(events: &Option<TreeEventSink>, event: TreeEvent) {
    if let Some(sink) = events {
        sink(event);
    }
}

/// Build the reclamation job for one opened tree. The snapshot arguments fix
/// the scan to open-time state, so the job stays correct even when writers
/// run before the collector gets around to it: pages allocated later are
/// either above the watermark or taken from the known free list.
#[allow(clippy::too_many_arguments)]
pub(crate) fn reclamation_job(
    file: Arc<PagedFile>,
    stable: Arc<Mutex<Bookkeeping>>,
    events: Option<TreeEventSink>,
    root: PageId,
    next_page: u64,
    known_free: Vec<PageId>,
    key_size: usize,
) -> CleanupJob {
    Box::new(move || {
        notify(&events, TreeEvent::CleanupStarted);
        let started = Instant::now();
        match scan_reachable(&file, root, key_size) {
            Ok(reachable) => {
                let known: HashSet<PageId> = known_free.into_iter().collect();
                let leaked: Vec<PageId> = (FIRST_DATA_PAGE..next_page)
                    .map(PageId)
                    .filter(|id| !reachable.contains(id) && !known.contains(id))
                    .collect();
                let reclaimed = leaked.len() as u64;
                if reclaimed > 0 {
                    debug!(pages = reclaimed, "reclaimed leaked pages");
                    stable.lock().free.extend(leaked);
                }
                notify(
                    &events,
                    TreeEvent::CleanupFinished {
                        pages_visited: next_page.saturating_sub(FIRST_DATA_PAGE),
                        tree_nodes: reachable.len() as u64,
                        pages_reclaimed: reclaimed,
                        duration: started.elapsed(),
                    },
                );
            }
            Err(err) => {
                warn!(error = %err, "recovery cleanup failed");
                notify(
                    &events,
                    TreeEvent::CleanupFailed {
                        error: err.to_string(),
                    },
                );
            }
        }
        notify(&events, TreeEvent::CleanupClosed);
    })
}

fn scan_reachable(file: &PagedFile, root: PageId, key_size: usize) -> Result<HashSet<PageId>> {
    let mut reachable = HashSet::new();
    let mut pending = vec![root];
    while let Some(id) = pending.pop() {
        if !reachable.insert(id) {
            continue;
        }
        let page = file.read_page(id)?;
        if node::kind(page.data())? == NodeKind::Internal {
            let count = node::count(page.data());
            for idx in 0..=count {
                pending.push(node::internal_child(page.data(), key_size, idx));
            }
        }
    }
    Ok(reachable)
}
