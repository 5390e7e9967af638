//! Error types for TickDB

use thiserror::Error;

/// Result type alias for TickDB operations
pub type Result<T> = std::result::Result<T, TickError>;

/// TickDB error types
#[derive(Error, Debug)]
pub enum TickError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Existing file is shorter than the fixed header
    #[error("File too small to contain a valid header: {path}")]
    FileTooSmall { path: String },

    /// Header magic bytes do not spell TSDB
    #[error("Invalid magic bytes in {path}: expected TSDB, got {found:?}")]
    InvalidMagic { path: String, found: [u8; 4] },

    /// Header carries a format version this build cannot read
    #[error("Unsupported file version in {path}: {version}")]
    UnsupportedVersion { path: String, version: u8 },

    /// Header record size differs from this build's record layout
    #[error("Record size mismatch in {path}: expected {expected}, got {found}")]
    RecordSizeMismatch {
        path: String,
        expected: u16,
        found: u16,
    },

    /// Data section is not a whole number of records even after recovery
    #[error("Corrupted file: misaligned record section in {path}")]
    MisalignedData { path: String },

    /// CRC mismatch on a read record
    #[error("Data corruption: CRC mismatch at timestamp {timestamp}")]
    Corruption { timestamp: i64 },

    /// Range query called with start after end
    #[error("Invalid range: start {start} is after end {end}")]
    InvalidRange { start: i64, end: i64 },

    /// Point read past the persisted record count
    #[error("Record index {index} out of range (record count {count})")]
    OutOfRange { index: usize, count: usize },
}

impl TickError {
    /// Check if error indicates on-disk corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TickError::Corruption { .. } | TickError::MisalignedData { .. }
        )
    }
}
