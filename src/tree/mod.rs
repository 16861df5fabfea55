#![forbid(unsafe_code)]

//! Copy-on-write B+ tree over a paged file.
//!
//! Fixed-width entries, a single compare-and-set writer seat, snapshot
//! readers, and checkpoint-as-durability: flushing staged pages and landing
//! one of the two alternating state pages is the only moment content becomes
//! recoverable.

pub mod check;
pub mod cleanup;
mod core;
mod cursor;
pub mod layout;
pub mod node;
mod state;
mod writer;

pub use check::{CheckFault, CheckVisitor, CollectingVisitor};
pub use cleanup::{
    CleanupJob, CleanupWorkCollector, DeferredCleanup, ImmediateCleanup, TreeEvent, TreeEventSink,
};
pub use self::core::{Tree, TreeOpen, TreeOptions};
pub use cursor::Seeker;
pub use layout::Layout;
pub use state::USER_HEADER_CAP;
pub use writer::TreeWriter;

#[cfg(test)]
mod tests;
