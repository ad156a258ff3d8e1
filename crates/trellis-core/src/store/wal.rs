//! Segmented write-ahead log.
//!
//! Each segment is named after the first sequence number it holds and is a
//! run of frames `[u32 len][u32 crc32][json payload]` (little endian). Every
//! transaction is written as one contiguous run of entries whose last entry
//! carries `commit = true`; replay only applies committed transactions.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{Edge, Node};
use crate::store::StoreError;

const FRAME_HEADER: usize = 8;
const SEGMENT_EXTENSION: &str = "wal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalOp {
    CreateNode,
    UpdateNode,
    DeleteNode,
    CreateEdge,
    DeleteEdge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    Node(Node),
    Edge(Edge),
}

/// One elementary mutation, as logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    /// Sequence number of the first entry of the owning transaction.
    pub tx: u64,
    pub timestamp: DateTime<Utc>,
    pub op: WalOp,
    /// Node or edge id the entry applies to.
    pub entity: String,
    pub before: Option<Record>,
    pub after: Option<Record>,
    pub commit: bool,
}

impl WalEntry {
    /// CRC32 of the serialized entry, as stored in its frame header.
    pub fn checksum(&self) -> Result<u32, StoreError> {
        Ok(crc32fast::hash(&serde_json::to_vec(self)?))
    }
}

/// Unsequenced change produced by transaction staging.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub op: WalOp,
    pub entity: String,
    pub before: Option<Record>,
    pub after: Option<Record>,
}

/// Assign sequence numbers to a transaction's changes.
pub(crate) fn sequence(changes: Vec<Change>, first_seq: u64) -> Vec<WalEntry> {
    let timestamp = Utc::now();
    let last = changes.len().saturating_sub(1);
    changes
        .into_iter()
        .enumerate()
        .map(|(idx, change)| WalEntry {
            seq: first_seq + idx as u64,
            tx: first_seq,
            timestamp,
            op: change.op,
            entity: change.entity,
            before: change.before,
            after: change.after,
            commit: idx == last,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub(crate) fn encode_frame(entry: &WalEntry, out: &mut Vec<u8>) -> Result<(), StoreError> {
    let payload = serde_json::to_vec(entry)?;
    let len = u32::try_from(payload.len()).map_err(|_| StoreError::StorageCorruption {
        location: format!("seq {}", entry.seq),
        reason: "entry exceeds frame size limit".into(),
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

#[derive(Debug)]
enum FrameRead {
    End,
    Entry(Box<WalEntry>, usize),
    Bad(&'static str),
}

fn decode_frame(buf: &[u8]) -> FrameRead {
    if buf.is_empty() {
        return FrameRead::End;
    }
    if buf.len() < FRAME_HEADER {
        return FrameRead::Bad("truncated frame header");
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let Some(payload) = buf.get(FRAME_HEADER..FRAME_HEADER + len) else {
        return FrameRead::Bad("truncated frame payload");
    };
    if crc32fast::hash(payload) != crc {
        return FrameRead::Bad("checksum mismatch");
    }
    match serde_json::from_slice::<WalEntry>(payload) {
        Ok(entry) => FrameRead::Entry(Box::new(entry), FRAME_HEADER + len),
        Err(_) => FrameRead::Bad("undecodable payload"),
    }
}

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub first_seq: u64,
    pub path: PathBuf,
}

fn segment_path(dir: &Path, first_seq: u64) -> PathBuf {
    dir.join(format!("{first_seq:020}.{SEGMENT_EXTENSION}"))
}

pub(crate) fn list_segments(dir: &Path) -> Result<Vec<Segment>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        let Some(first_seq) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        segments.push(Segment { first_seq, path });
    }
    segments.sort_by_key(|s| s.first_seq);
    Ok(segments)
}

fn truncate_file(path: &Path, len: u64) -> Result<(), StoreError> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Committed transactions found on disk past a snapshot.
#[derive(Debug, Default)]
pub struct Recovery {
    pub transactions: Vec<Vec<WalEntry>>,
    pub last_sequence: u64,
    /// Entries dropped from a torn or corrupted tail.
    pub discarded_entries: usize,
}

/// Read every committed transaction with sequence numbers above `after`.
///
/// A bad frame in the newest segment, or an uncommitted run of entries at the
/// end of the log, is a torn tail: it is cut off with a warning. A bad frame in
/// any earlier segment, or a gap in sequence numbers, means lost writes and is
/// an error.
pub fn recover(dir: &Path, after: u64) -> Result<Recovery, StoreError> {
    let segments = list_segments(dir)?;
    let mut recovery = Recovery {
        last_sequence: after,
        ..Recovery::default()
    };
    let mut expected = after + 1;
    let mut pending: Vec<WalEntry> = Vec::new();
    let mut pending_start: Option<(usize, usize)> = None;

    for (idx, segment) in segments.iter().enumerate() {
        let is_last = idx + 1 == segments.len();
        let data = fs::read(&segment.path)?;
        let mut offset = 0usize;
        loop {
            match decode_frame(&data[offset..]) {
                FrameRead::End => break,
                FrameRead::Entry(entry, consumed) => {
                    let start = offset;
                    offset += consumed;
                    if entry.seq <= after {
                        continue;
                    }
                    if entry.seq != expected {
                        return Err(StoreError::SequenceGap {
                            expected,
                            found: entry.seq,
                        });
                    }
                    expected += 1;
                    if pending.is_empty() {
                        pending_start = Some((idx, start));
                    }
                    let commit = entry.commit;
                    pending.push(*entry);
                    if commit {
                        recovery.last_sequence = expected - 1;
                        recovery.transactions.push(std::mem::take(&mut pending));
                        pending_start = None;
                    }
                }
                FrameRead::Bad(reason) => {
                    if !is_last {
                        return Err(StoreError::StorageCorruption {
                            location: format!("{}@{offset}", segment.path.display()),
                            reason: reason.to_string(),
                        });
                    }
                    warn!(
                        segment = %segment.path.display(),
                        offset,
                        dropped_bytes = data.len() - offset,
                        reason,
                        "discarding corrupted WAL tail"
                    );
                    recovery.discarded_entries += 1;
                    truncate_file(&segment.path, offset as u64)?;
                    break;
                }
            }
        }
    }

    if !pending.is_empty() {
        warn!(
            entries = pending.len(),
            first_seq = pending[0].seq,
            "discarding uncommitted WAL transaction"
        );
        recovery.discarded_entries += pending.len();
        if let Some((idx, start)) = pending_start {
            truncate_file(&segments[idx].path, start as u64)?;
        }
    }

    debug!(
        transactions = recovery.transactions.len(),
        last_sequence = recovery.last_sequence,
        "WAL recovery complete"
    );
    Ok(recovery)
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct ActiveSegment {
    path: PathBuf,
    file: File,
    bytes: u64,
}

/// Append side of the log. Owned by the store's single writer.
pub struct Wal {
    dir: PathBuf,
    segment_bytes: u64,
    sync: bool,
    active: Option<ActiveSegment>,
}

impl Wal {
    /// Open for appending after recovery has trimmed any torn tail.
    pub fn open(dir: &Path, segment_bytes: u64, sync: bool) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let mut wal = Wal {
            dir: dir.to_path_buf(),
            segment_bytes: segment_bytes.max(FRAME_HEADER as u64),
            sync,
            active: None,
        };
        if let Some(last) = list_segments(dir)?.pop() {
            let file = OpenOptions::new().append(true).open(&last.path)?;
            let bytes = file.metadata()?.len();
            wal.active = Some(ActiveSegment {
                path: last.path,
                file,
                bytes,
            });
        }
        Ok(wal)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably append one transaction's entries.
    pub fn append(&mut self, entries: &[WalEntry]) -> Result<(), StoreError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let mut buf = Vec::new();
        for entry in entries {
            encode_frame(entry, &mut buf)?;
        }

        let needs_rotation = match &self.active {
            None => true,
            Some(active) => active.bytes > 0 && active.bytes + buf.len() as u64 > self.segment_bytes,
        };
        if needs_rotation {
            self.start_segment(first.seq)?;
        }

        let sync = self.sync;
        let Some(active) = self.active.as_mut() else {
            return Err(StoreError::StorageCorruption {
                location: self.dir.display().to_string(),
                reason: "no active WAL segment".into(),
            });
        };
        let written = active
            .file
            .write_all(&buf)
            .and_then(|_| active.file.flush())
            .and_then(|_| if sync { active.file.sync_data() } else { Ok(()) });
        if let Err(err) = written {
            // Drop the partial frames so later appends stay contiguous.
            let _ = active.file.set_len(active.bytes);
            return Err(err.into());
        }
        active.bytes += buf.len() as u64;
        Ok(())
    }

    fn start_segment(&mut self, first_seq: u64) -> Result<(), StoreError> {
        let path = segment_path(&self.dir, first_seq);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes = file.metadata()?.len();
        debug!(segment = %path.display(), "opened WAL segment");
        self.active = Some(ActiveSegment { path, file, bytes });
        Ok(())
    }

    /// Close the active segment so the next append starts a fresh one.
    pub fn seal(&mut self) {
        self.active = None;
    }

    /// Delete sealed segments whose entries are all at or below `seq`.
    pub fn truncate_through(&mut self, seq: u64) -> Result<usize, StoreError> {
        let segments = list_segments(&self.dir)?;
        let active = self.active.as_ref().map(|a| a.path.clone());
        let mut removed = 0;
        for (idx, segment) in segments.iter().enumerate() {
            if Some(&segment.path) == active.as_ref() {
                continue;
            }
            let next_first = segments
                .get(idx + 1)
                .map(|s| s.first_seq)
                .unwrap_or(u64::MAX);
            if next_first <= seq + 1 || (idx + 1 == segments.len() && active.is_none()) {
                fs::remove_file(&segment.path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, through = seq, "truncated WAL segments");
        }
        Ok(removed)
    }
}
