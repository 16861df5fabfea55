//! Low-level primitives underneath the tree.
//!
//! Positional I/O and the paging layer. Durability here is the checkpoint:
//! there is no write-ahead log, the tree above is copy-on-write.

/// I/O abstractions and utilities.
pub mod io;

/// Paging subsystem: frame cache and copy-on-write staging.
pub mod pager;
