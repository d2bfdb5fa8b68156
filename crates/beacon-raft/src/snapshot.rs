//! Snapshots: full-state dumps used for log compaction and follower
//! catch-up.
//!
//! A snapshot captures the state machine at `last_included_index`; log
//! entries at or below that index can be discarded. Followers that have
//! fallen behind the compaction point receive the newest snapshot via
//! InstallSnapshot instead of entries.
//!
//! Snapshots are written as versioned files named
//! `snapshot-<index>-<term>.snap` under the snapshot directory. Only the
//! newest is needed for recovery; older ones are retained per policy for
//! diagnostics and rollback.

use crate::error::{RaftError, Result};
use crate::types::{LogIndex, Term};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_MAGIC: u32 = 0x42_45_41_43; // "BEAC"
const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// Index of the last log entry included in the snapshot
    pub last_included_index: LogIndex,

    /// Term of last_included_index
    pub last_included_term: Term,

    /// Whether the payload is LZ4-compressed on the wire/disk
    pub compressed: bool,
}

/// Complete snapshot (metadata + serialized state machine state).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,

    /// State machine state, uncompressed.
    pub data: Bytes,
}

impl Snapshot {
    pub fn new(
        last_included_index: LogIndex,
        last_included_term: Term,
        compressed: bool,
        data: Bytes,
    ) -> Self {
        Self {
            metadata: SnapshotMetadata {
                last_included_index,
                last_included_term,
                compressed,
            },
            data,
        }
    }

    /// Size of the (uncompressed) payload in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Encode to the on-disk/wire format.
    ///
    /// Layout: magic u32 | version u32 | meta_len u32 | meta (bincode) |
    /// payload (raw or LZ4 per metadata).
    pub fn encode(&self) -> Result<Bytes> {
        let meta = bincode::serialize(&self.metadata)?;
        let payload: Vec<u8> = if self.metadata.compressed {
            lz4_flex::compress_prepend_size(&self.data)
        } else {
            self.data.to_vec()
        };

        let mut out = Vec::with_capacity(12 + meta.len() + payload.len());
        out.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&(meta.len() as u32).to_le_bytes());
        out.extend_from_slice(&meta);
        out.extend_from_slice(&payload);
        Ok(Bytes::from(out))
    }

    /// Decode from the on-disk/wire format.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(RaftError::SnapshotFailed {
                reason: "snapshot too short".to_string(),
            });
        }

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != SNAPSHOT_MAGIC {
            return Err(RaftError::SnapshotFailed {
                reason: format!("bad snapshot magic {magic:#x}"),
            });
        }

        let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != SNAPSHOT_VERSION {
            return Err(RaftError::SnapshotFailed {
                reason: format!("unsupported snapshot version {version}"),
            });
        }

        let meta_len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if buf.len() < 12 + meta_len {
            return Err(RaftError::SnapshotFailed {
                reason: "truncated snapshot metadata".to_string(),
            });
        }

        let metadata: SnapshotMetadata = bincode::deserialize(&buf[12..12 + meta_len])?;
        let payload = &buf[12 + meta_len..];

        let data = if metadata.compressed {
            let raw = lz4_flex::decompress_size_prepended(payload).map_err(|e| {
                RaftError::SnapshotFailed {
                    reason: format!("lz4 decompress failed: {e}"),
                }
            })?;
            Bytes::from(raw)
        } else {
            Bytes::copy_from_slice(payload)
        };

        Ok(Self { metadata, data })
    }
}

/// State machine driven by the consensus apply loop.
///
/// `apply` is invoked strictly sequentially, so implementations need no
/// internal locking for mutation; only concurrent readers need guarding.
pub trait StateMachine: Send + Sync {
    /// Apply a committed command at its assigned log index.
    ///
    /// Must be deterministic given (state, command, index), and a no-op
    /// when re-applied at an already-applied index.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<()>;

    /// Serialize the full current state.
    fn snapshot(&self) -> Result<Bytes>;

    /// Replace the full state with the given serialized state.
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}

/// Directory of snapshot files with retention pruning.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open (or create) the snapshot directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn file_name(index: LogIndex, term: Term) -> String {
        format!("snapshot-{}-{}.snap", index.as_u64(), term.as_u64())
    }

    fn parse_file_name(path: &Path) -> Option<(LogIndex, Term)> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix("snapshot-")?.strip_suffix(".snap")?;
        let (index, term) = rest.split_once('-')?;
        Some((LogIndex(index.parse().ok()?), Term(term.parse().ok()?)))
    }

    /// Save a snapshot durably (temp file + rename).
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let name = Self::file_name(
            snapshot.metadata.last_included_index,
            snapshot.metadata.last_included_term,
        );
        let path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!("{name}.tmp"));

        let encoded = snapshot.encode()?;
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&encoded)?;
        tmp.sync_all()?;
        drop(tmp);
        std::fs::rename(&tmp_path, &path)?;

        tracing::info!(
            index = %snapshot.metadata.last_included_index,
            term = %snapshot.metadata.last_included_term,
            bytes = encoded.len(),
            compressed = snapshot.metadata.compressed,
            "Saved snapshot"
        );
        Ok(path)
    }

    /// All snapshot files, newest (highest index) first.
    pub fn list(&self) -> Result<Vec<(LogIndex, Term, PathBuf)>> {
        let mut found = Vec::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if let Some((index, term)) = Self::parse_file_name(&path) {
                found.push((index, term, path));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found)
    }

    /// Load the newest decodable snapshot, if any.
    ///
    /// A corrupt newest file falls back to the next-newest instead of
    /// failing recovery outright.
    pub fn load_latest(&self) -> Result<Option<Snapshot>> {
        for (index, term, path) in self.list()? {
            let mut buf = Vec::new();
            File::open(&path)?.read_to_end(&mut buf)?;
            match Snapshot::decode(&buf) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    tracing::warn!(
                        index = %index,
                        term = %term,
                        error = %e,
                        "Skipping undecodable snapshot"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Delete snapshots beyond the newest `retention_count`.
    pub fn prune(&self, retention_count: usize) -> Result<()> {
        let keep = retention_count.max(1);
        for (index, term, path) in self.list()?.into_iter().skip(keep) {
            tracing::debug!(index = %index, term = %term, "Pruning old snapshot");
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn encode_decode_round_trip() {
        let snapshot = Snapshot::new(LogIndex(42), Term(7), false, Bytes::from("hello world"));

        let encoded = snapshot.encode().unwrap();
        let restored = Snapshot::decode(&encoded).unwrap();

        assert_eq!(restored.metadata, snapshot.metadata);
        assert_eq!(restored.data, snapshot.data);
    }

    #[test]
    fn compressed_round_trip() {
        let data = Bytes::from(vec![7u8; 64 * 1024]);
        let snapshot = Snapshot::new(LogIndex(100), Term(3), true, data.clone());

        let encoded = snapshot.encode().unwrap();
        assert!(encoded.len() < data.len());

        let restored = Snapshot::decode(&encoded).unwrap();
        assert_eq!(restored.data, data);
        assert!(restored.metadata.compressed);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut encoded = Snapshot::new(LogIndex(1), Term(1), false, Bytes::from("x"))
            .encode()
            .unwrap()
            .to_vec();
        encoded[0] ^= 0xff;
        assert!(Snapshot::decode(&encoded).is_err());
    }

    #[test]
    fn store_saves_and_loads_latest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        store
            .save(&Snapshot::new(LogIndex(10), Term(1), false, Bytes::from("old")))
            .unwrap();
        store
            .save(&Snapshot::new(LogIndex(20), Term(2), false, Bytes::from("new")))
            .unwrap();

        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.metadata.last_included_index, LogIndex(20));
        assert_eq!(latest.data, Bytes::from("new"));
    }

    #[test]
    fn store_prunes_beyond_retention() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        for i in 1..=5u64 {
            store
                .save(&Snapshot::new(LogIndex(i * 10), Term(1), false, Bytes::from("s")))
                .unwrap();
        }

        store.prune(2).unwrap();
        let remaining = store.list().unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].0, LogIndex(50));
        assert_eq!(remaining[1].0, LogIndex(40));
    }

    #[test]
    fn load_latest_skips_corrupt_newest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        store
            .save(&Snapshot::new(LogIndex(10), Term(1), false, Bytes::from("good")))
            .unwrap();

        // Newer but corrupt file.
        std::fs::write(dir.path().join("snapshot-20-1.snap"), b"garbage").unwrap();

        let latest = store.load_latest().unwrap().unwrap();
        assert_eq!(latest.metadata.last_included_index, LogIndex(10));
    }

    #[test]
    fn load_latest_empty_dir() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.load_latest().unwrap().is_none());
    }
}
