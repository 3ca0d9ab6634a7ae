//! The node log.
//!
//! A commit appends every block the transaction allocated, followed by a
//! commit marker, as one contiguous write. Each record is framed as
//!
//! ```text
//! | len (4) | CBOR payload (len) | crc32 (4) |
//! ```
//!
//! with the CRC taken over the length and the payload. Recovery replays
//! records up to the last intact commit marker; anything after it is a torn
//! tail from an interrupted commit and is cut off. Blocks that the recovered
//! top reference cannot reach were superseded by later commits and are
//! dropped.

use crate::alloc::{Block, Ref};
use crate::error::{CoreError, CoreResult};
use crate::types::Version;
use arbor_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const LEN_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

/// One record of the node log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A block written by a commit.
    Block {
        /// Reference the block is stored under.
        r: Ref,
        /// Block contents.
        block: Block,
    },
    /// Seals every block record since the previous marker.
    Commit {
        /// Group top of the committed version.
        top: Ref,
        /// The committed version.
        version: Version,
        /// First reference not yet handed out.
        next_ref: u64,
    },
}

/// Borrowing twin of [`LogRecord`] for encoding without cloning blocks.
#[derive(Serialize)]
enum LogRecordRef<'a> {
    Block { r: Ref, block: &'a Block },
    Commit { top: Ref, version: Version, next_ref: u64 },
}

/// State rebuilt from the log.
#[derive(Debug)]
pub struct Recovered {
    /// Blocks reachable from `top`.
    pub blocks: HashMap<Ref, Block>,
    /// Group top of the last commit.
    pub top: Ref,
    /// Version of the last commit.
    pub version: Version,
    /// First reference not yet handed out.
    pub next_ref: u64,
}

/// Computes the CRC32 (IEEE) of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

fn frame(record: &LogRecordRef<'_>, out: &mut Vec<u8>) -> CoreResult<()> {
    let mut payload = Vec::new();
    ciborium::ser::into_writer(record, &mut payload)
        .map_err(|e| CoreError::codec(format!("encoding log record: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("log record larger than 4 GiB"))?;
    let start = out.len();
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    let crc = compute_crc32(&out[start..]);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Outcome of parsing one frame.
enum Frame {
    Record(LogRecord, usize),
    Torn,
}

fn parse_frame(data: &[u8]) -> CoreResult<Frame> {
    let Some(len_bytes) = data.get(..LEN_SIZE) else {
        return Ok(Frame::Torn);
    };
    let mut len = [0u8; LEN_SIZE];
    len.copy_from_slice(len_bytes);
    let len = u32::from_le_bytes(len) as usize;
    let end = LEN_SIZE + len;
    let Some(crc_bytes) = data.get(end..end + CRC_SIZE) else {
        return Ok(Frame::Torn);
    };
    let mut crc = [0u8; CRC_SIZE];
    crc.copy_from_slice(crc_bytes);
    if compute_crc32(&data[..end]) != u32::from_le_bytes(crc) {
        return Ok(Frame::Torn);
    }
    let record = ciborium::de::from_reader(&data[LEN_SIZE..end])
        .map_err(|e| CoreError::codec(format!("decoding log record: {e}")))?;
    Ok(Frame::Record(record, end + CRC_SIZE))
}

/// Append-only log of committed blocks.
pub struct NodeLog {
    backend: Box<dyn StorageBackend>,
}

impl NodeLog {
    /// Wraps a storage backend.
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot report its size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Raw bytes of the log.
    #[cfg(test)]
    pub(crate) fn contents(&self) -> CoreResult<Vec<u8>> {
        Ok(self.backend.read_all()?)
    }

    /// Appends a record on its own.
    ///
    /// # Errors
    ///
    /// Fails if the record cannot be encoded or written.
    pub fn append(&mut self, record: &LogRecord) -> CoreResult<u64> {
        let borrowed = match record {
            LogRecord::Block { r, block } => LogRecordRef::Block { r: *r, block },
            LogRecord::Commit {
                top,
                version,
                next_ref,
            } => LogRecordRef::Commit {
                top: *top,
                version: *version,
                next_ref: *next_ref,
            },
        };
        let mut data = Vec::new();
        frame(&borrowed, &mut data)?;
        Ok(self.backend.append(&data)?)
    }

    /// Appends a commit: all `blocks`, then the marker, in one write.
    ///
    /// If the write does not complete, the log is cut back to its previous
    /// size so later commits land directly after the last good one.
    ///
    /// # Errors
    ///
    /// Fails if a record cannot be encoded or the backend fails.
    pub fn append_commit(
        &mut self,
        blocks: &[(Ref, Arc<Block>)],
        top: Ref,
        version: Version,
        next_ref: u64,
        sync: bool,
    ) -> CoreResult<()> {
        let mut data = Vec::new();
        for (r, block) in blocks {
            frame(&LogRecordRef::Block { r: *r, block }, &mut data)?;
        }
        frame(
            &LogRecordRef::Commit {
                top,
                version,
                next_ref,
            },
            &mut data,
        )?;
        let start = self.backend.size()?;
        if let Err(e) = self.write_commit(&data, sync) {
            if let Err(cut) = self.backend.truncate(start) {
                warn!(%version, size = start, error = %cut, "failed commit left bytes in the log");
            }
            return Err(e);
        }
        debug!(%version, blocks = blocks.len(), bytes = data.len(), "commit logged");
        Ok(())
    }

    fn write_commit(&mut self, data: &[u8], sync: bool) -> CoreResult<()> {
        self.backend.append(data)?;
        self.backend.flush()?;
        if sync {
            self.backend.sync()?;
        }
        Ok(())
    }

    /// Replays the log. Returns `None` for a log without any commit.
    ///
    /// A torn tail is truncated away.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] for a record that passes its checksum but
    /// cannot be decoded, and [`CoreError::Corruption`] if the last commit
    /// references a block the log does not hold.
    pub fn recover(&mut self) -> CoreResult<Option<Recovered>> {
        let data = self.backend.read_all()?;
        let mut pos = 0;
        let mut valid_end = 0;
        let mut pending = Vec::new();
        let mut blocks = HashMap::new();
        let mut last = None;

        while pos < data.len() {
            match parse_frame(&data[pos..])? {
                Frame::Torn => break,
                Frame::Record(record, used) => {
                    pos += used;
                    match record {
                        LogRecord::Block { r, block } => pending.push((r, block)),
                        LogRecord::Commit {
                            top,
                            version,
                            next_ref,
                        } => {
                            blocks.extend(pending.drain(..));
                            last = Some((top, version, next_ref));
                            valid_end = pos;
                        }
                    }
                }
            }
        }

        if valid_end < data.len() {
            warn!(
                discarded = data.len() - valid_end,
                "discarding torn tail of the node log"
            );
            self.backend.truncate(valid_end as u64)?;
        }

        let Some((top, version, next_ref)) = last else {
            return Ok(None);
        };
        let logged = blocks.len();
        let blocks = reachable(blocks, top)?;
        info!(%version, blocks = blocks.len(), superseded = logged - blocks.len(), "node log recovered");
        Ok(Some(Recovered {
            blocks,
            top,
            version,
            next_ref,
        }))
    }
}

/// Keeps the blocks reachable from `top`.
fn reachable(mut all: HashMap<Ref, Block>, top: Ref) -> CoreResult<HashMap<Ref, Block>> {
    let mut live = HashMap::new();
    let mut stack = vec![top];
    while let Some(r) = stack.pop() {
        if live.contains_key(&r) {
            continue;
        }
        let block = all.remove(&r).ok_or_else(|| {
            CoreError::corruption(format!("committed block {r:?} missing from the log"))
        })?;
        stack.extend(block.child_refs());
        live.insert(r, block);
    }
    Ok(live)
}
