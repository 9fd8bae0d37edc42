use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of a file or chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Digests `data` in one shot.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    /// Wraps an already hex-encoded digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session-local task identifier, derived deterministically from a
/// [`FileIdentity`] so the same logical file maps to the same id across
/// restarts even before its content hash is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-derived identifier addressing a logical file on the server,
/// independent of the client session. Combines the whole-file digest with
/// name and size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn derive(file_digest: &ContentDigest, name: &str, size: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(file_digest.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(size.to_le_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrates a key read back from storage.
    pub(crate) fn from_raw(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the caller knows about a file before its content is hashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    pub name: String,
    pub size: u64,
    pub last_modified_ms: u64,
}

impl FileIdentity {
    /// Stable task id for this identity.
    pub fn task_id(&self) -> TaskId {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b":");
        hasher.update(self.size.to_le_bytes());
        hasher.update(b":");
        hasher.update(self.last_modified_ms.to_le_bytes());
        TaskId(hex::encode(hasher.finalize()))
    }
}

/// A contiguous byte range `[start, end)` of a file, the unit of transfer
/// and retry. The digest is filled in once the hash engine has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub digest: Option<ContentDigest>,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Which stage an unrecoverable failure happened in. A hash failure
/// requires a full restart from hashing; a merge failure keeps confirmed
/// chunks and only re-attempts the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Hash,
    Chunk,
    Merge,
}

/// Transfer task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Hashing,
    CheckingDedup,
    Uploading,
    Merging,
    /// Server already held the full file; no chunks were transferred.
    InstantComplete,
    Done,
    Paused,
    Failed(FailureKind),
}

impl TaskStatus {
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::InstantComplete)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed(_))
    }
}

/// The central entity: one submitted file and everything known about its
/// transfer. Owned exclusively by the scheduler; snapshots are cloned out
/// for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: TaskId,
    pub identity: FileIdentity,
    pub content_type: String,
    /// Known only after hashing; must not change while chunks are in flight.
    pub transfer_id: Option<TransferId>,
    pub file_digest: Option<ContentDigest>,
    pub chunks: Vec<Chunk>,
    /// Indices confirmed uploaded, by this session or by dedup negotiation.
    pub uploaded: BTreeSet<u32>,
    pub status: TaskStatus,
    /// Upload progress 0..=100, from confirmed bytes.
    pub progress_percent: f32,
    /// Hashing progress 0..=100, reported while `status == Hashing`.
    pub hash_percent: u8,
    pub error: Option<String>,
    /// Submission sequence, for FIFO admission.
    pub order: u64,
    pub chunk_size: u64,
}

impl TransferTask {
    pub fn new(identity: FileIdentity, content_type: String, order: u64, chunk_size: u64) -> Self {
        let id = identity.task_id();
        let chunks = crate::planner::plan(identity.size, chunk_size);
        Self {
            id,
            identity,
            content_type,
            transfer_id: None,
            file_digest: None,
            chunks,
            uploaded: BTreeSet::new(),
            status: TaskStatus::Queued,
            progress_percent: 0.0,
            hash_percent: 0,
            error: None,
            order,
            chunk_size,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Marks a chunk confirmed. Returns `false` for duplicate confirmations.
    pub fn mark_uploaded(&mut self, index: u32) -> bool {
        if index >= self.total_chunks() {
            return false;
        }
        self.uploaded.insert(index)
    }

    /// True once the confirmed set equals the planned set. Set equality,
    /// not a counter, so duplicate confirmations cannot over-count.
    pub fn all_confirmed(&self) -> bool {
        self.chunks.iter().all(|c| self.uploaded.contains(&c.index))
    }

    /// Chunks not yet confirmed, in ascending index order.
    pub fn pending_chunks(&self) -> Vec<Chunk> {
        self.chunks
            .iter()
            .filter(|c| !self.uploaded.contains(&c.index))
            .cloned()
            .collect()
    }

    /// Total bytes covered by confirmed chunks.
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| self.uploaded.contains(&c.index))
            .map(Chunk::len)
            .sum()
    }

    /// Recomputes `progress_percent` from the confirmed byte count.
    pub fn update_progress(&mut self) {
        if self.identity.size == 0 {
            self.progress_percent = if self.all_confirmed() { 100.0 } else { 0.0 };
        } else {
            self.progress_percent =
                (self.uploaded_bytes() as f32 / self.identity.size as f32) * 100.0;
        }
    }

    /// Serialized mirror for the resumable state store.
    pub fn persisted_record(&self, added_at_ms: u64) -> PersistedTransfer {
        PersistedTransfer {
            name: self.identity.name.clone(),
            size: self.identity.size,
            content_type: self.content_type.clone(),
            last_modified_ms: self.identity.last_modified_ms,
            chunk_size: self.chunk_size,
            added_at_ms,
            uploaded: self.uploaded.iter().copied().collect(),
        }
    }
}

/// Record persisted per TransferId so the same physical file resumes
/// correctly after a restart, even though the in-memory task id is
/// re-derived from the file identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTransfer {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub last_modified_ms: u64,
    pub chunk_size: u64,
    pub added_at_ms: u64,
    pub uploaded: Vec<u32>,
}
