//! Write-ahead log for the mapping tables.
//!
//! Every mutation is appended (and optionally fsynced) before it is applied
//! in memory. An insert batch is a single entry, so a crash either keeps the
//! whole batch or none of it.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec frame]
//! [ENTRY 2: codec frame]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mapping::{AliasMappingRecord, EnrichmentIndexRecord, IndexKey};

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The logged mutation.
    pub kind: WalEntryKind,
}

/// A logged mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// Rows accepted by one insert batch.
    AliasInsert(Vec<AliasMappingRecord>),
    /// Administrative purge of alias rows.
    AliasPurge { source: String },
    /// Rows written by one index upsert (final form).
    IndexUpsert(Vec<EnrichmentIndexRecord>),
    /// Hit-count increments.
    IndexHits { keys: Vec<IndexKey>, at: DateTime<Utc> },
    /// Administrative purge of index rows.
    IndexPurge { source: String },
    /// Everything up to `up_to_sequence` lives in the snapshot.
    Checkpoint { up_to_sequence: u64 },
}

struct WalWriter {
    out: BufWriter<File>,
    sequence: u64,
}

/// Append-only log, thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal.writer")
}

impl WriteAheadLog {
    /// Opens or creates a WAL file.
    ///
    /// An existing file is scanned for its last valid sequence number; a new
    /// file gets the header.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let sequence = if file_len >= codec::HEADER_LEN {
            let (sequence, valid_len) = Self::scan_valid_prefix(path)?;
            // New frames must not land behind a torn or corrupt tail.
            if valid_len < file_len {
                tracing::warn!(
                    path = %path.display(),
                    discarded_bytes = file_len - valid_len,
                    after_sequence = sequence,
                    "truncating unreadable WAL tail"
                );
                file.set_len(valid_len)?;
                if sync_on_write {
                    file.sync_all()?;
                }
            }
            sequence
        } else {
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                out: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalWriter>> {
        self.writer.lock().map_err(|_| poisoned())
    }

    fn write_entry(&self, w: &mut WalWriter, entry: &WalEntry) -> IoResult<()> {
        let frame = codec::encode(entry)?;
        w.out.write_all(&frame)?;
        w.out.flush()?;
        if self.sync_on_write {
            w.out.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Appends an entry and returns its sequence number.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut w = self.lock()?;
        let entry = WalEntry {
            sequence: w.sequence + 1,
            timestamp: Utc::now(),
            kind,
        };
        self.write_entry(&mut w, &entry)?;
        w.sequence = entry.sequence;
        Ok(entry.sequence)
    }

    /// Iterates over all entries, for replay.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last appended entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Discards all entries after a snapshot covering `up_to_sequence` was
    /// written. The fresh log starts with a checkpoint so sequence numbers
    /// keep increasing across compactions.
    pub fn truncate_to_checkpoint(&self, up_to_sequence: u64) -> IoResult<()> {
        let mut w = self.lock()?;
        w.out.flush()?;

        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        codec::write_header(&mut file)?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        drop(file);

        w.out = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        let checkpoint = WalEntry {
            sequence: up_to_sequence,
            timestamp: Utc::now(),
            kind: WalEntryKind::Checkpoint { up_to_sequence },
        };
        self.write_entry(&mut w, &checkpoint)?;
        w.sequence = up_to_sequence;
        Ok(())
    }

    /// Last valid sequence number and the byte length of the readable prefix.
    fn scan_valid_prefix(path: &Path) -> IoResult<(u64, u64)> {
        let mut entries = WalIterator::new(path)?;
        let mut last = 0;
        let mut valid_len = codec::HEADER_LEN;
        while let Some(entry) = entries.next() {
            match entry {
                Ok(entry) => {
                    last = entry.sequence;
                    valid_len = entries.reader.stream_position()?;
                }
                Err(e) => {
                    tracing::warn!(after_sequence = last, error = %e, "WAL corruption detected");
                    break;
                }
            }
        }
        Ok((last, valid_len))
    }
}

/// Iterator over WAL entries.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self { reader, file_size })
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.stream_position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            // A torn tail write is the normal crash signature.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mapping.wal");

        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            wal.append(WalEntryKind::AliasPurge { source: "a".into() }).unwrap();
            wal.append(WalEntryKind::IndexPurge { source: "b".into() }).unwrap();
            assert_eq!(wal.current_sequence().unwrap(), 2);
        }

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, WalEntryKind::AliasPurge { .. }));
    }

    #[test]
    fn truncate_keeps_sequence_monotonic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mapping.wal");
        let wal = WriteAheadLog::open(&path, false).unwrap();
        for _ in 0..3 {
            wal.append(WalEntryKind::AliasPurge { source: "x".into() }).unwrap();
        }

        wal.truncate_to_checkpoint(3).unwrap();
        assert_eq!(wal.append(WalEntryKind::AliasPurge { source: "y".into() }).unwrap(), 4);

        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, WalEntryKind::Checkpoint { up_to_sequence: 3 }));
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mapping.wal");
        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            wal.append(WalEntryKind::AliasPurge { source: "a".into() }).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[1, 200, 0, 0, 0, b'{']).unwrap();
        }

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);
        assert_eq!(wal.iter().unwrap().count(), 1);
    }

    #[test]
    fn appends_after_torn_tail_are_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mapping.wal");
        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            wal.append(WalEntryKind::AliasPurge { source: "a".into() }).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[1, 200, 0, 0, 0, b'{']).unwrap();
        }
        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            assert_eq!(wal.append(WalEntryKind::AliasPurge { source: "b".into() }).unwrap(), 2);
        }

        let wal = WriteAheadLog::open(&path, false).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[1].kind, WalEntryKind::AliasPurge { source } if source == "b"));
    }
}
