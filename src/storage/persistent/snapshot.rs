//! Compacted table state.
//!
//! A snapshot is a single codec frame holding both tables and the WAL
//! sequence it covers. It is written to a temporary file and renamed into
//! place, so readers see either the old or the new snapshot.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Result as IoResult, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::memory::{AliasState, IndexState};

use super::codec;

pub(crate) const SNAPSHOT_FILE: &str = "mapping.snapshot";
const SNAPSHOT_TMP: &str = "mapping.snapshot.tmp";

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub(crate) up_to_sequence: u64,
    pub(crate) aliases: AliasState,
    pub(crate) index: IndexState,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    up_to_sequence: u64,
    aliases: &'a AliasState,
    index: &'a IndexState,
}

/// Loads the snapshot in `dir`, or an empty one if none was written yet.
pub(crate) fn load(dir: &Path) -> IoResult<Snapshot> {
    let path = dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(Snapshot::default());
    }

    let mut reader = BufReader::new(File::open(&path)?);
    codec::read_header(&mut reader)?;
    codec::decode(&mut reader)
}

/// Atomically replaces the snapshot in `dir`.
pub(crate) fn write(
    dir: &Path,
    up_to_sequence: u64,
    aliases: &AliasState,
    index: &IndexState,
) -> IoResult<()> {
    let tmp = dir.join(SNAPSHOT_TMP);
    let frame = codec::encode(&SnapshotRef {
        up_to_sequence,
        aliases,
        index,
    })?;

    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut out = BufWriter::new(file);
        codec::write_header(&mut out)?;
        out.write_all(&frame)?;
        out.flush()?;
        out.get_ref().sync_all()?;
    }

    fs::rename(&tmp, dir.join(SNAPSHOT_FILE))
}
