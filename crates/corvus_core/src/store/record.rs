//! Log record types and frame serialization.
//!
//! The record log is a sequence of frames, each holding one atomically
//! applied batch:
//!
//! ```text
//! | magic "CVLG" (4) | version u16 LE (2) | length u32 LE (4) |
//! | payload (JSON array of records, `length` bytes) | crc32 u32 LE (4) |
//! ```
//!
//! A batch either has its whole frame on disk or none of it. Replay stops
//! at a torn tail (an incomplete final frame, the normal outcome of a crash
//! mid-append) and rewinds the log past it. A complete frame with a bad
//! magic, unknown version, or checksum mismatch is corruption and fails the
//! open.

use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use crate::stats::IndexingStats;
use crate::tasks::Task;
use crate::types::{TaskId, TxId};
use corvus_storage::LogBackend;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Magic bytes identifying a log frame.
pub const FRAME_MAGIC: [u8; 4] = *b"CVLG";

/// Current log format version.
pub const FRAME_VERSION: u16 = 1;

/// Frame header size: magic + version + length.
const HEADER_LEN: usize = 4 + 2 + 4;

/// One map output for a map-reduce index: the group value it belongs to
/// and the mapped projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedResult {
    /// Value of the group-by field this output belongs to.
    pub reduce_key: String,
    /// The mapped projection.
    pub value: Value,
}

/// A single operation in the record log.
///
/// Records are grouped into frames; every record in a frame was applied in
/// one batch and replays in one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogRecord {
    /// Store a document version, replacing any previous one at the key.
    PutDocument {
        /// The full document, including its new etag.
        document: Document,
    },

    /// Remove the document at `key`.
    DeleteDocument {
        /// Key of the removed document.
        key: String,
    },

    /// Stage a put inside a transaction without publishing it.
    ShadowPut {
        /// Owning transaction.
        tx: TxId,
        /// Wall-clock expiry of the transaction, milliseconds since epoch.
        expires_at_ms: u64,
        /// The staged document version.
        document: Document,
    },

    /// Stage a delete inside a transaction without publishing it.
    ShadowDelete {
        /// Owning transaction.
        tx: TxId,
        /// Wall-clock expiry of the transaction, milliseconds since epoch.
        expires_at_ms: u64,
        /// Key staged for deletion.
        key: String,
    },

    /// Publish all shadow writes of a transaction and release its locks.
    CommitTransaction {
        /// The committing transaction.
        tx: TxId,
    },

    /// Discard all shadow writes of a transaction and release its locks.
    RollbackTransaction {
        /// The rolled-back transaction.
        tx: TxId,
    },

    /// Enqueue a background task.
    AddTask {
        /// Identifier assigned to the task.
        id: TaskId,
        /// The work to perform.
        task: Task,
    },

    /// Remove a completed task from the queue.
    RemoveTask {
        /// Identifier of the finished task.
        id: TaskId,
    },

    /// Replace the stored map outputs of one document in one index.
    PutMappedResults {
        /// Owning index.
        index: String,
        /// Source document key.
        doc_key: String,
        /// Map outputs, one per emitted row.
        results: Vec<MappedResult>,
    },

    /// Drop the stored map outputs of one document in one index.
    DeleteMappedResults {
        /// Owning index.
        index: String,
        /// Source document key.
        doc_key: String,
    },

    /// Overwrite the persisted counters of an index.
    ///
    /// Absolute values rather than deltas, so replay is idempotent.
    SetIndexStats {
        /// Owning index.
        index: String,
        /// New counter values.
        stats: IndexingStats,
    },

    /// Drop every trace of an index: mapped results, stats, queued tasks.
    PurgeIndex {
        /// The deleted index.
        index: String,
    },
}

/// Encodes a batch of records into one frame.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_frame(records: &[LogRecord]) -> CoreResult<Vec<u8>> {
    let payload = serde_json::to_vec(records)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("batch payload exceeds 4 GiB"))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(buf)
}

/// Outcome of reading every frame out of a backend.
#[derive(Debug)]
pub struct ReplayOutcome {
    /// All batches, in append order.
    pub batches: Vec<Vec<LogRecord>>,
    /// Offset just past the last complete frame. Anything beyond it is a
    /// torn tail to rewind away.
    pub valid_len: u64,
}

/// Reads every complete frame from the backend.
///
/// Stops cleanly at a torn tail; `valid_len` tells the caller where to
/// rewind. Corruption inside a complete frame is fatal.
///
/// # Errors
///
/// Returns [`CoreError::LogCorruption`] on bad magic or version and
/// [`CoreError::ChecksumMismatch`] when a complete frame fails its CRC.
pub fn read_all(backend: &dyn LogBackend) -> CoreResult<ReplayOutcome> {
    let size = backend.len()?;
    let mut offset = 0u64;
    let mut batches = Vec::new();

    loop {
        let remaining = size - offset;
        if remaining == 0 {
            break;
        }
        if remaining < HEADER_LEN as u64 {
            // Torn header at the tail.
            break;
        }

        let header = backend.read_at(offset, HEADER_LEN)?;
        if header[0..4] != FRAME_MAGIC {
            return Err(CoreError::log_corruption(format!(
                "bad frame magic at offset {offset}"
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != FRAME_VERSION {
            return Err(CoreError::log_corruption(format!(
                "unsupported frame version {version} at offset {offset}"
            )));
        }
        let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as u64;

        let frame_total = HEADER_LEN as u64 + len + 4;
        if remaining < frame_total {
            // Torn payload or checksum at the tail.
            break;
        }

        let payload = backend.read_at(offset + HEADER_LEN as u64, len as usize)?;
        let crc_bytes = backend.read_at(offset + HEADER_LEN as u64 + len, 4)?;
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = crc32fast::hash(&payload);
        if actual != expected {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let records: Vec<LogRecord> = serde_json::from_slice(&payload)
            .map_err(|e| CoreError::log_corruption(format!("undecodable frame payload: {e}")))?;
        batches.push(records);
        offset += frame_total;
    }

    Ok(ReplayOutcome {
        batches,
        valid_len: offset,
    })
}
