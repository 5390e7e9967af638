//! TickDB Core - append-only time-series storage engine
//!
//! A single-file storage engine for monotonically timestamped numeric
//! samples, built around four pieces:
//!
//! - **Binary format**: a versioned 10-byte header followed by fixed-width,
//!   CRC-protected 20-byte records
//! - **Monotonic append**: duplicate and out-of-order timestamps are
//!   rejected at the gate, so the on-disk array is always strictly sorted
//! - **Asynchronous durability**: producers enqueue into an in-memory
//!   buffer that a background flusher thread drains to disk
//! - **Sparse index**: an in-memory timestamp locator giving
//!   `O(log(N/step) + step)` range and point lookups over the sorted file

pub mod storage;

mod error;
mod types;

pub use error::{Result, TickError};
pub use storage::{DataFile, Engine, EngineConfig, FileHeader, SparseIndex};
pub use types::{IndexEntry, Record, Timestamp, RECORD_SIZE};

/// TickDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Records between consecutive sparse index entries
    pub const SPARSE_INDEX_STEP: usize = 1024;

    /// Background flusher wake-up interval in milliseconds
    pub const FLUSH_INTERVAL_MS: u64 = 5;
}
