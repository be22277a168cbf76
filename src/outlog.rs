//! Append-only framed record log with N independent readers and rotation.
//!
//! A single mutex guards the control state: the writer position and each
//! peer's `{fp, read_pos, old_size}`. `old_size != 0` means the peer is still
//! draining a rotated-away generation whose total length was `old_size`; the
//! log may rotate only when every peer has `old_size == 0`. Record reads
//! happen outside the lock on a snapshotted file handle; only the bookkeeping
//! that follows them takes the mutex again.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use crate::protocol::{self, Action, ACTION_LEN, MAX_DIFF_SIZE};

/// Rotation threshold for the default log.
pub const LOG_MAX_SIZE: u64 = 50 * 1024 * 1024;

pub struct OutLog {
    path: PathBuf,
    max_size: u64,
    state: Mutex<LogState>,
}

struct LogState {
    write_fp: File,
    write_pos: u64,
    readers: HashMap<String, LogReader>,
}

struct LogReader {
    fp: Arc<File>,
    read_pos: u64,
    old_size: u64,
}

/// Control-state snapshot for one peer.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    pub write_pos: u64,
    pub read_pos: u64,
    pub old_size: u64,
}

/// Queue depth of one peer as seen by the status loop.
#[derive(Debug, Clone)]
pub struct PeerDepth {
    pub peer: String,
    pub depth: u64,
    /// True while the peer drains a rotated-away generation.
    pub draining_old: bool,
}

/// Outcome of a single-record read.
pub enum LogRead {
    /// A full framed record and the file offset right after it.
    Record { frame: Bytes, pos: u64 },
    /// EOF at the action boundary: this generation is drained; the caller
    /// reopens the current log and continues.
    Drained,
}

impl OutLog {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_max_size(path, LOG_MAX_SIZE)
    }

    pub fn with_max_size(path: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        let path = path.into();
        let write_fp = open_fresh(&path)?;
        Ok(Self {
            path,
            max_size,
            state: Mutex::new(LogState {
                write_fp,
                write_pos: 0,
                readers: HashMap::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one framed record; rotate afterwards if the log has outgrown
    /// its limit and every peer has reached the current generation.
    pub fn write(&self, action: Action, payload: &[u8]) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let frame = protocol::frame(action, payload);
        st.write_fp
            .write_all(&frame)
            .with_context(|| format!("cannot append to {}", self.path.display()))?;
        st.write_pos = st.write_fp.stream_position()?;
        debug!(pos = st.write_pos, action = ?action, "out-log append");

        if st.write_pos > self.max_size {
            if st.readers.values().any(|r| r.old_size != 0) {
                debug!("rotation deferred: a reader is still on an old generation");
                return Ok(());
            }
            info!("rotating out-log");
            self.rotate_locked(&mut st)?;
        }
        Ok(())
    }

    fn rotate_locked(&self, st: &mut LogState) -> Result<()> {
        // Readers mid-drain keep the unlinked inode open until they hit EOF.
        std::fs::remove_file(&self.path)
            .with_context(|| format!("cannot remove {}", self.path.display()))?;
        st.write_fp = open_fresh(&self.path)?;
        let closed_size = st.write_pos;
        for reader in st.readers.values_mut() {
            reader.old_size = closed_size;
        }
        st.write_pos = 0;
        Ok(())
    }

    /// Open (or reopen) the log for one peer. With `continuation` the cursor
    /// starts at the current tail so only subsequent records are delivered;
    /// otherwise at the beginning of the current generation. Either way the
    /// peer leaves any old generation behind (`old_size = 0`).
    pub fn open_reader(&self, peer: &str, continuation: bool) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.readers.remove(peer).is_some() {
            debug!(peer, "closing old log reader");
        }
        let mut fp = File::open(&self.path)
            .with_context(|| format!("cannot open {}", self.path.display()))?;
        let read_pos = if continuation {
            fp.seek(SeekFrom::Start(st.write_pos))?;
            st.write_pos
        } else {
            0
        };
        info!(peer, continuation, read_pos, "opened out-log reader");
        st.readers.insert(
            peer.to_string(),
            LogReader {
                fp: Arc::new(fp),
                read_pos,
                old_size: 0,
            },
        );
        Ok(())
    }

    pub fn cursor(&self, peer: &str) -> Option<Cursor> {
        let st = self.state.lock().unwrap();
        st.readers.get(peer).map(|r| Cursor {
            write_pos: st.write_pos,
            read_pos: r.read_pos,
            old_size: r.old_size,
        })
    }

    /// Read the next framed record for `peer`. The file read happens outside
    /// the control-state lock; the caller advances the cursor with
    /// [`advance`](Self::advance) once the record has been handed off.
    pub fn read_entry(&self, peer: &str) -> Result<LogRead> {
        let fp = {
            let st = self.state.lock().unwrap();
            st.readers
                .get(peer)
                .with_context(|| format!("no out-log reader for {}", peer))?
                .fp
                .clone()
        };
        let mut file = &*fp;

        let mut action = [0u8; ACTION_LEN];
        match file.read_exact(&mut action) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(LogRead::Drained),
            Err(e) => return Err(e).context("cannot read action from out-log"),
        }

        let mut len_field = [0u8; ACTION_LEN];
        file.read_exact(&mut len_field)
            .context("cannot read length field from out-log")?;
        let len = protocol::parse_length(&len_field)?;
        if len > MAX_DIFF_SIZE {
            bail!("out-log record of {} bytes exceeds maximum", len);
        }

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)
            .context("cannot read payload from out-log")?;
        let pos = file.stream_position()?;

        let mut frame = BytesMut::with_capacity(2 * ACTION_LEN + len);
        frame.put_slice(&action);
        frame.put_slice(&len_field);
        frame.put_slice(&payload);
        Ok(LogRead::Record {
            frame: frame.freeze(),
            pos,
        })
    }

    /// Record that `peer` has consumed the log up to `pos`.
    pub fn advance(&self, peer: &str, pos: u64) {
        let mut st = self.state.lock().unwrap();
        if let Some(reader) = st.readers.get_mut(peer) {
            reader.read_pos = pos;
        }
    }

    /// Per-peer queue depths, computed under the lock in one pass.
    pub fn queue_depths(&self) -> Vec<PeerDepth> {
        let st = self.state.lock().unwrap();
        st.readers
            .iter()
            .map(|(peer, r)| {
                let (depth, draining_old) = if r.old_size != 0 {
                    (r.old_size - r.read_pos + st.write_pos, true)
                } else if r.read_pos != st.write_pos {
                    (st.write_pos - r.read_pos, false)
                } else {
                    (0, false)
                };
                PeerDepth {
                    peer: peer.clone(),
                    depth,
                    draining_old,
                }
            })
            .collect()
    }
}

fn open_fresh(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("cannot open {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_all(log: &OutLog, peer: &str) -> Vec<Bytes> {
        let mut frames = Vec::new();
        loop {
            let cur = log.cursor(peer).unwrap();
            if cur.read_pos == cur.write_pos && cur.old_size == 0 {
                break;
            }
            match log.read_entry(peer).unwrap() {
                LogRead::Record { frame, pos } => {
                    log.advance(peer, pos);
                    frames.push(frame);
                }
                LogRead::Drained => {
                    log.open_reader(peer, false).unwrap();
                }
            }
        }
        frames
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let log = OutLog::create(dir.path().join("out.log")).unwrap();
        log.open_reader("peer", false).unwrap();

        log.write(Action::Diff, b"first").unwrap();
        log.write(Action::Ping, b"").unwrap();

        let frames = read_all(&log, "peer");
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..10], b"DIFF      ");
        assert_eq!(&frames[0][20..], b"first");
        assert_eq!(frames[1].len(), 20);
        assert_eq!(&frames[1][..10], b"PING      ");
    }

    #[test]
    fn test_continuation_skips_existing_records() {
        let dir = TempDir::new().unwrap();
        let log = OutLog::create(dir.path().join("out.log")).unwrap();
        log.write(Action::Diff, b"old").unwrap();
        log.open_reader("peer", true).unwrap();
        log.write(Action::Diff, b"new").unwrap();

        let frames = read_all(&log, "peer");
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][20..], b"new");
    }

    #[test]
    fn test_independent_readers() {
        let dir = TempDir::new().unwrap();
        let log = OutLog::create(dir.path().join("out.log")).unwrap();
        log.open_reader("fast", false).unwrap();
        log.open_reader("slow", false).unwrap();
        log.write(Action::Diff, b"abc").unwrap();

        assert_eq!(read_all(&log, "fast").len(), 1);
        // slow has not moved
        let cur = log.cursor("slow").unwrap();
        assert_eq!(cur.read_pos, 0);
        assert_eq!(read_all(&log, "slow").len(), 1);
    }

    #[test]
    fn test_rotation_marks_old_generation() {
        let dir = TempDir::new().unwrap();
        let log = OutLog::with_max_size(dir.path().join("out.log"), 64).unwrap();
        log.open_reader("peer", false).unwrap();

        // 20-byte frames; the fourth write crosses the 64-byte limit
        for _ in 0..4 {
            log.write(Action::Ping, b"").unwrap();
        }
        let cur = log.cursor("peer").unwrap();
        assert_eq!(cur.old_size, 80);
        assert_eq!(cur.write_pos, 0);
    }

    #[test]
    fn test_rotation_blocked_while_draining_old() {
        let dir = TempDir::new().unwrap();
        let log = OutLog::with_max_size(dir.path().join("out.log"), 64).unwrap();
        log.open_reader("slow", false).unwrap();

        for _ in 0..4 {
            log.write(Action::Ping, b"").unwrap();
        }
        assert!(log.cursor("slow").unwrap().old_size > 0);

        // grow the new generation past the limit: rotation must be deferred
        for _ in 0..5 {
            log.write(Action::Ping, b"").unwrap();
        }
        let cur = log.cursor("slow").unwrap();
        assert_eq!(cur.old_size, 80, "old generation must stay pinned");
        assert_eq!(cur.write_pos, 100, "no rotation while a reader drains");

        // drain the old generation and cross into the current one
        let frames = read_all(&log, "slow");
        assert_eq!(frames.len(), 9);
        assert_eq!(log.cursor("slow").unwrap().old_size, 0);

        // now the next write may rotate again
        log.write(Action::Ping, b"").unwrap();
        assert_eq!(log.cursor("slow").unwrap().write_pos, 0);
    }

    #[test]
    fn test_depths() {
        let dir = TempDir::new().unwrap();
        let log = OutLog::create(dir.path().join("out.log")).unwrap();
        log.open_reader("a", false).unwrap();
        log.write(Action::Diff, b"xyz").unwrap();

        let depths = log.queue_depths();
        assert_eq!(depths.len(), 1);
        assert_eq!(depths[0].peer, "a");
        assert_eq!(depths[0].depth, 23);
        assert!(!depths[0].draining_old);

        assert_eq!(read_all(&log, "a").len(), 1);
        assert_eq!(log.queue_depths()[0].depth, 0);
    }
}
