//! File manager
//!
//! Owns the on-disk layout `[header][record_0]…[record_{N-1}]` and exposes
//! positioned reads and batched appends over it. Every operation opens its
//! own handle; writes are serialized structurally because only the flusher
//! thread appends.

use crate::error::{Result, TickError};
use crate::storage::header::{FileHeader, HEADER_SIZE};
use crate::types::{Record, Timestamp, RECORD_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Handle to a validated (or freshly created) data file
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    header: FileHeader,
}

impl DataFile {
    /// Open the backing file, creating it with a fresh header when missing.
    ///
    /// On an existing file the header is validated and a torn record tail
    /// left by a crashed writer is truncated away. Returns the handle
    /// together with the number of whole records on disk.
    pub fn open(path: &Path) -> Result<(Self, usize)> {
        if !path.exists() {
            let header = FileHeader::new();
            let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
            file.write_all(&header.encode())?;
            return Ok((
                Self {
                    path: path.to_path_buf(),
                    header,
                },
                0,
            ));
        }

        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE as u64 {
            return Err(TickError::FileTooSmall {
                path: path.display().to_string(),
            });
        }

        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut buf)?;
        let header = FileHeader::decode(&buf, path)?;

        let mut data_size = file_size - HEADER_SIZE as u64;
        if data_size % RECORD_SIZE as u64 != 0 {
            data_size = Self::recover_torn_tail(path, data_size)?;
            if data_size % RECORD_SIZE as u64 != 0 {
                return Err(TickError::MisalignedData {
                    path: path.display().to_string(),
                });
            }
        }

        let record_count = (data_size / RECORD_SIZE as u64) as usize;
        Ok((
            Self {
                path: path.to_path_buf(),
                header,
            },
            record_count,
        ))
    }

    /// Drop a trailing byte run shorter than one record.
    ///
    /// Appends are single end-of-file writes, so a misaligned tail can only
    /// be the torn remainder of a crashed batch and never a committed record.
    fn recover_torn_tail(path: &Path, data_size: u64) -> Result<u64> {
        let stray = data_size % RECORD_SIZE as u64;
        let whole = data_size - stray;
        warn!(
            "Truncating {} stray bytes left by a torn write in {:?}",
            stray, path
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(HEADER_SIZE as u64 + whole)?;
        Ok(whole)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The validated header
    pub fn header(&self) -> FileHeader {
        self.header
    }

    /// Read the record at `index` and verify its checksum.
    ///
    /// The caller is responsible for bounds-checking `index` against the
    /// persisted record count.
    pub fn read_record(&self, index: usize) -> Result<Record> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(record_offset(index)))?;
        let mut buf = [0u8; RECORD_SIZE];
        file.read_exact(&mut buf)?;
        verify(Record::decode(&buf))
    }

    /// Read only the 8-byte timestamp field of the record at `index`.
    ///
    /// Used for index building, where payload integrity is deferred to
    /// query time.
    pub fn read_timestamp(&self, index: usize) -> Result<Timestamp> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(record_offset(index)))?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf)?;
        Ok(Timestamp::from_le_bytes(buf))
    }

    /// Read the final record on disk, or `None` when the file holds no
    /// records. The checksum is verified.
    pub fn read_last_record(&self) -> Result<Option<Record>> {
        let mut file = File::open(&self.path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + RECORD_SIZE) as u64 {
            return Ok(None);
        }
        file.seek(SeekFrom::End(-(RECORD_SIZE as i64)))?;
        let mut buf = [0u8; RECORD_SIZE];
        file.read_exact(&mut buf)?;
        verify(Record::decode(&buf)).map(Some)
    }

    /// Read every record in file order, verifying each checksum
    pub fn read_all(&self) -> Result<Vec<Record>> {
        let mut cursor = self.cursor_at(0)?;
        let mut records = Vec::with_capacity(cursor.remaining());
        while let Some(record) = cursor.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Sequential cursor positioned at `index`.
    ///
    /// The cursor snapshots the file length at creation, so a concurrent
    /// flush extends the file without the cursor running into it.
    pub fn cursor_at(&self, index: usize) -> Result<RecordCursor> {
        let file = File::open(&self.path)?;
        let file_size = file.metadata()?.len();
        let on_disk = ((file_size - HEADER_SIZE as u64) / RECORD_SIZE as u64) as usize;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(record_offset(index)))?;
        Ok(RecordCursor {
            reader,
            remaining: on_disk.saturating_sub(index),
        })
    }

    /// Append the batch as one contiguous end-of-file write.
    ///
    /// The handle closes on return, handing the bytes to the OS before the
    /// caller advertises the records as persisted.
    pub fn append_records(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(records.len() * RECORD_SIZE);
        for record in records {
            buf.extend_from_slice(&record.encode());
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&buf)?;
        Ok(())
    }
}

/// Forward scanner over the record section
pub struct RecordCursor {
    reader: BufReader<File>,
    remaining: usize,
}

impl RecordCursor {
    /// Records left in the snapshot this cursor was created from
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// The next record in file order, or `None` past the snapshot end.
    /// Checksums are verified; a mismatch aborts the scan.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; RECORD_SIZE];
        self.reader.read_exact(&mut buf)?;
        self.remaining -= 1;
        verify(Record::decode(&buf)).map(Some)
    }
}

fn record_offset(index: usize) -> u64 {
    (HEADER_SIZE + index * RECORD_SIZE) as u64
}

fn verify(record: Record) -> Result<Record> {
    if !record.verify_crc() {
        return Err(TickError::Corruption {
            timestamp: record.timestamp,
        });
    }
    Ok(record)
}
