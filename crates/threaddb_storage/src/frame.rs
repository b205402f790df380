//! Commit log records and their on-disk framing.
//!
//! Every record is written as one frame:
//!
//! ```text
//! +-------+------------+----------------+----------+
//! | magic | length u32 | CBOR body      | checksum |
//! | TDBL  | LE         | `length` bytes | 4 bytes  |
//! +-------+------------+----------------+----------+
//! ```
//!
//! The checksum is the first four bytes of the SHA-256 digest of the body.
//! A frame cut short at the end of the log is treated as an interrupted
//! write and ignored; a bad frame followed by more data is corruption.

use crate::error::{StorageError, StorageResult};
use crate::table::TableDef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"TDBL";

const HEADER_LEN: usize = 8;
const CHECKSUM_LEN: usize = 4;

/// One mutation inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOp {
    /// Insert or replace a row.
    Put {
        /// Table name.
        table: String,
        /// Row key.
        key: String,
        /// Row value, stored as JSON text.
        value: String,
    },
    /// Remove a row.
    Delete {
        /// Table name.
        table: String,
        /// Row key.
        key: String,
    },
    /// Remove every row of a table.
    Clear {
        /// Table name.
        table: String,
    },
}

impl LogOp {
    pub(crate) fn put(table: &str, key: &str, value: &Value) -> StorageResult<Self> {
        Ok(LogOp::Put {
            table: table.to_string(),
            key: key.to_string(),
            value: serde_json::to_string(value)
                .map_err(|e| StorageError::encoding(e.to_string()))?,
        })
    }
}

/// Full contents of one table, written by compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Table definition.
    pub def: TableDef,
    /// Next auto-increment sequence number.
    pub next_seq: u64,
    /// Rows as `(key, JSON text)` pairs.
    pub rows: Vec<(String, String)>,
}

/// A record in the commit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A table was created or redefined.
    CreateTable(TableDef),
    /// A table was dropped.
    DropTable(String),
    /// A committed transaction.
    Commit(Vec<LogOp>),
    /// A compacted image of every table.
    Snapshot(Vec<TableSnapshot>),
}

/// Encodes a record as a complete frame.
///
/// # Errors
///
/// Returns an encoding error if the record cannot be serialized.
pub fn encode_frame(record: &LogRecord) -> StorageResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(record, &mut body).map_err(|e| StorageError::encoding(e.to_string()))?;
    let len = u32::try_from(body.len())
        .map_err(|_| StorageError::encoding("record exceeds frame size limit"))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len() + CHECKSUM_LEN);
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&checksum(&body));
    Ok(frame)
}

/// Decodes every complete frame in `data`.
///
/// # Errors
///
/// Returns [`StorageError::Corrupted`] if a frame other than the last one
/// is malformed.
pub fn decode_frames(data: &[u8]) -> StorageResult<Vec<LogRecord>> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < HEADER_LEN {
            tracing::warn!(offset, "ignoring truncated frame header at end of log");
            break;
        }
        if rest[..4] != FRAME_MAGIC {
            return Err(StorageError::corrupted(format!(
                "bad frame magic at offset {offset}"
            )));
        }
        let len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let total = HEADER_LEN + len + CHECKSUM_LEN;
        if rest.len() < total {
            tracing::warn!(offset, "ignoring truncated frame at end of log");
            break;
        }

        let body = &rest[HEADER_LEN..HEADER_LEN + len];
        let stored = &rest[HEADER_LEN + len..total];
        if stored != checksum(body) {
            if offset + total == data.len() {
                tracing::warn!(offset, "ignoring final frame with bad checksum");
                break;
            }
            return Err(StorageError::corrupted(format!(
                "checksum mismatch at offset {offset}"
            )));
        }

        let record: LogRecord =
            ciborium::from_reader(body).map_err(|e| StorageError::corrupted(e.to_string()))?;
        records.push(record);
        offset += total;
    }

    Ok(records)
}

fn checksum(body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(body);
    [digest[0], digest[1], digest[2], digest[3]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn commit(key: &str) -> LogRecord {
        LogRecord::Commit(vec![
            LogOp::put("people", key, &json!({"_id": key})).unwrap(),
            LogOp::Delete {
                table: "people".into(),
                key: "gone".into(),
            },
        ])
    }

    #[test]
    fn frames_decode_in_order() {
        let mut log = encode_frame(&LogRecord::CreateTable(TableDef::keyed("people", "_id")))
            .unwrap();
        log.extend(encode_frame(&commit("a")).unwrap());
        log.extend(encode_frame(&commit("b")).unwrap());

        let records = decode_frames(&log).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], commit("b"));
    }

    #[test]
    fn torn_tail_is_ignored() {
        let mut log = encode_frame(&commit("a")).unwrap();
        let second = encode_frame(&commit("b")).unwrap();
        log.extend_from_slice(&second[..second.len() - 3]);

        let records = decode_frames(&log).unwrap();
        assert_eq!(records, vec![commit("a")]);
    }

    #[test]
    fn damaged_middle_frame_is_corruption() {
        let mut log = encode_frame(&commit("a")).unwrap();
        let body_byte = HEADER_LEN + 2;
        log[body_byte] ^= 0xff;
        log.extend(encode_frame(&commit("b")).unwrap());

        assert!(matches!(
            decode_frames(&log),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut log = encode_frame(&commit("a")).unwrap();
        log[0] = b'X';
        assert!(matches!(
            decode_frames(&log),
            Err(StorageError::Corrupted(_))
        ));
    }
}
