//! Update journal
//!
//! Every online write is appended here before it becomes visible in the
//! store. Records carry absolute row values (not deltas), so replaying a
//! record twice is harmless, and are tagged with the generation they were
//! applied to so that a replay never writes into a different model.
//!
//! ## Entry Format
//!
//! ```text
//! [length: u32][type: u8][payload: bytes][crc32: u32]
//! ```
//!
//! - **length**: size of type + payload + crc (not including length itself)
//! - **type**: 1 = user row, 2 = user/item pair
//! - **payload**: MessagePack-serialized `JournalRecord`
//! - **crc32**: CRC32 over \[type\]\[payload\]
//!
//! A truncated final entry (torn write) ends replay quietly; a checksum
//! mismatch anywhere is reported as corruption.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use latent_core::{Factor, GenerationId, ItemId, LatentError, LatentResult, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const TYPE_USER: u8 = 1;
const TYPE_PAIR: u8 = 2;

/// Minimum encoded entry body: type(1) + crc(4)
const MIN_ENTRY_LEN: usize = 5;

/// One journaled write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// A single user row replaced
    User {
        /// Generation the write applied to
        generation: GenerationId,
        /// Row key
        user_id: UserId,
        /// New row value
        factor: Factor,
    },
    /// A user row and an item row replaced together
    Pair {
        /// Generation the write applied to
        generation: GenerationId,
        /// User row key
        user_id: UserId,
        /// New user row
        user: Factor,
        /// Item row key
        item_id: ItemId,
        /// New item row
        item: Factor,
    },
}

impl JournalRecord {
    /// Generation the record belongs to
    pub fn generation(&self) -> GenerationId {
        match self {
            JournalRecord::User { generation, .. } | JournalRecord::Pair { generation, .. } => {
                *generation
            }
        }
    }

    fn type_tag(&self) -> u8 {
        match self {
            JournalRecord::User { .. } => TYPE_USER,
            JournalRecord::Pair { .. } => TYPE_PAIR,
        }
    }
}

/// Durable log of online writes
pub trait UpdateJournal: Send + Sync {
    /// Append a record; it must be durable when this returns `Ok`
    fn append(&self, record: &JournalRecord) -> LatentResult<()>;

    /// All intact records in append order
    fn replay(&self) -> LatentResult<Vec<JournalRecord>>;

    /// Discard every record not belonging to `keep`
    fn rotate(&self, keep: GenerationId) -> LatentResult<()>;
}

/// Journal that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJournal;

impl UpdateJournal for NoopJournal {
    fn append(&self, _record: &JournalRecord) -> LatentResult<()> {
        Ok(())
    }

    fn replay(&self) -> LatentResult<Vec<JournalRecord>> {
        Ok(Vec::new())
    }

    fn rotate(&self, _keep: GenerationId) -> LatentResult<()> {
        Ok(())
    }
}

/// Encode a record as `[length][type][payload][crc]`
pub fn encode_record(record: &JournalRecord) -> LatentResult<Vec<u8>> {
    let type_tag = record.type_tag();
    let payload =
        rmp_serde::to_vec(record).map_err(|e| LatentError::serialization(e.to_string()))?;

    let total_len = 1 + payload.len() + 4;
    let mut buf = Vec::with_capacity(4 + total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.push(type_tag);
    buf.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&[type_tag]);
    hasher.update(&payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    Ok(buf)
}

/// Outcome of decoding one entry
#[derive(Debug)]
pub enum Decoded {
    /// A record and the number of bytes it occupied
    Record(JournalRecord, usize),
    /// The buffer ends inside an entry
    Incomplete,
}

/// Decode the entry at the start of `buf`; `offset` is for error messages
pub fn decode_record(buf: &[u8], offset: u64) -> LatentResult<Decoded> {
    if buf.len() < 4 {
        return Ok(Decoded::Incomplete);
    }
    let total_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if total_len < MIN_ENTRY_LEN {
        return Err(LatentError::corruption(format!(
            "offset {}: invalid entry length {}",
            offset, total_len
        )));
    }
    if buf.len() < 4 + total_len {
        return Ok(Decoded::Incomplete);
    }

    let type_tag = buf[4];
    let payload = &buf[5..4 + total_len - 4];
    let crc_at = 4 + total_len - 4;
    let expected_crc = u32::from_le_bytes([
        buf[crc_at],
        buf[crc_at + 1],
        buf[crc_at + 2],
        buf[crc_at + 3],
    ]);

    let mut hasher = Hasher::new();
    hasher.update(&[type_tag]);
    hasher.update(payload);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        return Err(LatentError::corruption(format!(
            "offset {}: CRC mismatch: expected {:08x}, got {:08x}",
            offset, expected_crc, actual_crc
        )));
    }

    let record: JournalRecord = rmp_serde::from_slice(payload).map_err(|e| {
        LatentError::corruption(format!("offset {}: decode failed: {}", offset, e))
    })?;
    if record.type_tag() != type_tag {
        return Err(LatentError::corruption(format!(
            "offset {}: type tag mismatch: expected {}, got {}",
            offset,
            record.type_tag(),
            type_tag
        )));
    }

    Ok(Decoded::Record(record, 4 + total_len))
}

/// Decode every intact record in `buf`
pub fn decode_all(buf: &[u8]) -> LatentResult<Vec<JournalRecord>> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        match decode_record(&buf[pos..], pos as u64)? {
            Decoded::Record(record, used) => {
                records.push(record);
                pos += used;
            }
            Decoded::Incomplete => {
                warn!(
                    target: "latent::journal",
                    offset = pos,
                    trailing_bytes = buf.len() - pos,
                    "Ignoring incomplete trailing journal entry"
                );
                break;
            }
        }
    }
    Ok(records)
}

/// Append-only journal file
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
    sync: bool,
}

impl FileJournal {
    /// Open (or create) the journal at `path`.
    ///
    /// With `sync` set every append is followed by `fsync`.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> LatentResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = Self::open_append(&path)?;
        info!(target: "latent::journal", path = %path.display(), sync, "Journal opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
            sync,
        })
    }

    fn open_append(path: &Path) -> LatentResult<File> {
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    /// Journal file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UpdateJournal for FileJournal {
    fn append(&self, record: &JournalRecord) -> LatentResult<()> {
        let buf = encode_record(record)?;
        let mut file = self.file.lock();
        file.write_all(&buf)
            .map_err(|e| LatentError::persistence(format!("journal append failed: {}", e)))?;
        if self.sync {
            file.sync_data()
                .map_err(|e| LatentError::persistence(format!("journal sync failed: {}", e)))?;
        }
        Ok(())
    }

    fn replay(&self) -> LatentResult<Vec<JournalRecord>> {
        let _file = self.file.lock();
        let buf = match std::fs::read(&self.path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let records = decode_all(&buf)?;
        debug!(target: "latent::journal", records = records.len(), "Journal read");
        Ok(records)
    }

    fn rotate(&self, keep: GenerationId) -> LatentResult<()> {
        let mut file = self.file.lock();
        let buf = std::fs::read(&self.path)?;
        let records = decode_all(&buf)?;
        let before = records.len();

        let mut out = Vec::new();
        let mut kept = 0usize;
        for record in records.iter().filter(|r| r.generation() == keep) {
            out.extend_from_slice(&encode_record(record)?);
            kept += 1;
        }

        let tmp_path = self.path.with_extension("journal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&out)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        *file = Self::open_append(&self.path)?;

        info!(
            target: "latent::journal",
            generation = keep.as_u64(),
            dropped = before - kept,
            kept,
            "Journal rotated"
        );
        Ok(())
    }
}
