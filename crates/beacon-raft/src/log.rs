//! File-backed replicated log.
//!
//! Entries are persisted to a single append-only file and mirrored in an
//! in-memory BTreeMap image that serves all reads. Compaction keeps the
//! image bounded: once a snapshot covers a prefix of the log, that prefix
//! is dropped from both the image and the file.
//!
//! # On-disk format
//!
//! One record per entry:
//! - `len: u32` little-endian, length of the bincode body
//! - `body: [u8; len]`, bincode-serialized `LogEntry`
//! - `crc: u32` little-endian, CRC32C over the body
//!
//! Recovery replays records until EOF or the first torn/corrupt record;
//! a corrupt tail is discarded (it can only be an interrupted append).
//! Truncation and compaction rewrite the file from the surviving image
//! via a temp file + rename.

use crate::error::{RaftError, Result};
use crate::types::{LogEntry, LogIndex, Term};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

const LOG_FILE_NAME: &str = "raft.log";

/// What recovery found when opening the log.
#[derive(Debug, Clone, Default)]
pub struct RecoveryInfo {
    /// Number of entries recovered from disk.
    pub entries_recovered: usize,

    /// Number of trailing bytes discarded as torn/corrupt.
    pub bytes_discarded: u64,
}

/// Replicated log storage.
#[derive(Clone)]
pub struct RaftLog {
    dir: PathBuf,

    /// Full image of live entries, index → entry.
    image: Arc<RwLock<BTreeMap<LogIndex, LogEntry>>>,

    /// Append handle; rewrites swap this out under the same lock.
    file: Arc<Mutex<File>>,
}

impl RaftLog {
    /// Open (or create) the log in `dir`, replaying persisted entries.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<(Self, RecoveryInfo)> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let mut image = BTreeMap::new();
        let mut info = RecoveryInfo::default();

        if path.exists() {
            let mut buf = Vec::new();
            File::open(&path)?.read_to_end(&mut buf)?;
            let mut offset = 0usize;

            while offset + 8 <= buf.len() {
                let len = u32::from_le_bytes([
                    buf[offset],
                    buf[offset + 1],
                    buf[offset + 2],
                    buf[offset + 3],
                ]) as usize;
                let body_start = offset + 4;
                let crc_start = body_start + len;

                if crc_start + 4 > buf.len() {
                    break; // torn tail
                }

                let body = &buf[body_start..crc_start];
                let stored_crc = u32::from_le_bytes([
                    buf[crc_start],
                    buf[crc_start + 1],
                    buf[crc_start + 2],
                    buf[crc_start + 3],
                ]);

                if crc32c::crc32c(body) != stored_crc {
                    tracing::warn!(offset, "Discarding corrupt log tail");
                    break;
                }

                let entry: LogEntry = bincode::deserialize(body)?;
                image.insert(entry.index, entry);
                info.entries_recovered += 1;
                offset = crc_start + 4;
            }

            info.bytes_discarded = (buf.len() - offset) as u64;
            if info.bytes_discarded > 0 {
                // Drop the torn tail so future appends start clean.
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(offset as u64)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok((
            Self {
                dir,
                image: Arc::new(RwLock::new(image)),
                file: Arc::new(Mutex::new(file)),
            },
            info,
        ))
    }

    fn encode_record(entry: &LogEntry) -> Result<Vec<u8>> {
        let body = bincode::serialize(entry)?;
        let mut record = Vec::with_capacity(body.len() + 8);
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(&body);
        record.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
        Ok(record)
    }

    /// Append one entry durably.
    pub async fn append(&self, entry: LogEntry) -> Result<()> {
        let record = Self::encode_record(&entry)?;
        {
            let mut file = self.file.lock();
            file.write_all(&record)?;
            file.flush()?;
        }
        self.image.write().insert(entry.index, entry);
        Ok(())
    }

    /// Append a batch of entries with a single flush.
    pub async fn append_batch(&self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in &entries {
            buf.extend_from_slice(&Self::encode_record(entry)?);
        }
        {
            let mut file = self.file.lock();
            file.write_all(&buf)?;
            file.flush()?;
        }
        let mut image = self.image.write();
        for entry in entries {
            image.insert(entry.index, entry);
        }
        Ok(())
    }

    /// Get the entry at `index`, if it is still live (not compacted).
    pub async fn get(&self, index: LogIndex) -> Result<Option<LogEntry>> {
        Ok(self.image.read().get(&index).cloned())
    }

    /// Get the entries in `[from, to)`, ascending.
    pub async fn get_range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        let image = self.image.read();
        Ok(image.range(from..to).map(|(_, e)| e.clone()).collect())
    }

    /// Index of the first live entry, or `ZERO` if the log is empty.
    pub async fn first_index(&self) -> LogIndex {
        self.image
            .read()
            .keys()
            .next()
            .copied()
            .unwrap_or(LogIndex::ZERO)
    }

    /// Index of the last entry, or `ZERO` if the log is empty.
    pub async fn last_index(&self) -> LogIndex {
        self.image
            .read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(LogIndex::ZERO)
    }

    /// Term of the last entry, or `ZERO` if the log is empty.
    pub async fn last_term(&self) -> Term {
        self.image
            .read()
            .iter()
            .next_back()
            .map(|(_, e)| e.term)
            .unwrap_or(Term::ZERO)
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.image.read().len()
    }

    pub async fn is_empty(&self) -> bool {
        self.image.read().is_empty()
    }

    /// Delete all entries with index >= `from` (conflicting suffix).
    pub async fn truncate(&self, from: LogIndex) -> Result<()> {
        {
            let mut image = self.image.write();
            image.split_off(&from);
        }
        self.rewrite()
    }

    /// Delete all entries with index <= `up_to` (snapshot-covered prefix).
    pub async fn compact(&self, up_to: LogIndex) -> Result<()> {
        {
            let mut image = self.image.write();
            let keep = image.split_off(&up_to.next());
            *image = keep;
        }
        self.rewrite()
    }

    /// Rewrite the log file from the current image (temp file + rename).
    fn rewrite(&self) -> Result<()> {
        let path = self.dir.join(LOG_FILE_NAME);
        let tmp_path = self.dir.join(format!("{}.tmp", LOG_FILE_NAME));

        let mut file = self.file.lock();

        let mut buf = Vec::new();
        {
            let image = self.image.read();
            for entry in image.values() {
                buf.extend_from_slice(&Self::encode_record(entry)?);
            }
        }

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&buf)?;
        tmp.sync_all()?;
        drop(tmp);
        std::fs::rename(&tmp_path, &path)?;

        *file = OpenOptions::new().append(true).open(&path)?;
        Ok(())
    }
}

impl std::fmt::Debug for RaftLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftLog").field("dir", &self.dir).finish()
    }
}

impl RaftLog {
    /// Verify the image is a contiguous index range (debugging aid).
    pub async fn check_contiguous(&self) -> Result<()> {
        let image = self.image.read();
        let mut expected: Option<LogIndex> = None;
        for index in image.keys() {
            if let Some(exp) = expected {
                if *index != exp {
                    return Err(RaftError::Corrupt {
                        reason: format!("gap in log: expected {}, found {}", exp, index),
                    });
                }
            }
            expected = Some(index.next());
        }
        Ok(())
    }
}
