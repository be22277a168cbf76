//! Wire protocol: fixed 10-byte actions, framed records, and the diff grammar.
//!
//! Every record is `action (10 bytes) | length (10 ASCII digits, space-padded)
//! | payload`. The same framing is used on disk (the out-log) and on the ssh
//! stdin stream, so a log record can be forwarded to a peer verbatim.
//!
//! The server->client direction is not framed: the remote side only ever
//! emits bare 10-byte actions (`PING`/`PONG`) on its stdout.

use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::stat::EntryStat;

/// Size of an action token and of a length field, in bytes.
pub const ACTION_LEN: usize = 10;

/// Upper bound for a single diff payload; anything bigger goes through the
/// big-file path in chunks of at most half this size.
pub const MAX_DIFF_SIZE: usize = 2 * 1024 * 1024;

/// Separator between entries inside a DIFF payload.
pub const DIFF_SEP: &[u8] = b"\n------------\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Ping,
    Pong,
    Diff,
    BigInit,
    BigRcv,
    BigCommit,
    BigAbort,
    /// Reserved; recognised but never emitted.
    StopServer,
}

impl Action {
    pub fn as_bytes(self) -> &'static [u8; ACTION_LEN] {
        match self {
            Action::Ping => b"PING      ",
            Action::Pong => b"PONG      ",
            Action::Diff => b"DIFF      ",
            Action::BigInit => b"BIGINIT   ",
            Action::BigRcv => b"BIGRCV    ",
            Action::BigCommit => b"BIGCOMMIT ",
            Action::BigAbort => b"BIGABORT  ",
            Action::StopServer => b"STOPSERVER",
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        match buf {
            b"PING      " => Some(Action::Ping),
            b"PONG      " => Some(Action::Pong),
            b"DIFF      " => Some(Action::Diff),
            b"BIGINIT   " => Some(Action::BigInit),
            b"BIGRCV    " => Some(Action::BigRcv),
            b"BIGCOMMIT " => Some(Action::BigCommit),
            b"BIGABORT  " => Some(Action::BigAbort),
            b"STOPSERVER" => Some(Action::StopServer),
            _ => None,
        }
    }
}

/// Encode a full framed record.
pub fn frame(action: Action, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 * ACTION_LEN + payload.len());
    buf.put_slice(action.as_bytes());
    buf.put_slice(format!("{:10}", payload.len()).as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Parse a 10-byte ASCII decimal length field (leading spaces or zeros).
pub fn parse_length(buf: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(buf).context("length field is not ASCII")?;
    text.trim_start()
        .parse::<usize>()
        .with_context(|| format!("bad length field {:?}", text))
}

/// Read one framed record from an async stream (the receiver's stdin).
/// Returns the action and its payload.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(Action, Bytes)> {
    let mut action = [0u8; ACTION_LEN];
    r.read_exact(&mut action)
        .await
        .context("failed to read action")?;
    let action = Action::from_bytes(&action)
        .with_context(|| format!("unknown action {:?}", String::from_utf8_lossy(&action)))?;

    let mut len_field = [0u8; ACTION_LEN];
    r.read_exact(&mut len_field)
        .await
        .context("failed to read length field")?;
    let len = parse_length(&len_field)?;

    if len > MAX_DIFF_SIZE {
        bail!("record of {} bytes exceeds maximum {}", len, MAX_DIFF_SIZE);
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("failed to read payload")?;

    Ok((action, Bytes::from(payload)))
}

// =============================================================================
// Diff entries
// =============================================================================

/// Header of an `A` (add/replace) diff entry. The payload, when the stat calls
/// for one, follows the separator immediately in the diff buffer.
pub fn add_header(path: &str, stat: &EntryStat) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + path.len() + 64 + DIFF_SEP.len());
    buf.extend_from_slice(b"A ");
    buf.extend_from_slice(path.as_bytes());
    buf.push(b'\n');
    buf.extend_from_slice(stat.serialize().as_bytes());
    buf.extend_from_slice(DIFF_SEP);
    buf
}

/// Header of a `D` (delete) diff entry.
pub fn delete_header(path: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + path.len() + DIFF_SEP.len());
    buf.extend_from_slice(b"D ");
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(DIFF_SEP);
    buf
}

/// One parsed entry of a DIFF payload.
#[derive(Debug)]
pub enum DiffEntry {
    Add {
        path: String,
        stat: EntryStat,
        contents: Bytes,
    },
    Delete {
        path: String,
    },
}

/// Parse a DIFF payload into its entries. `A` entries of non-directories with
/// a non-zero size consume exactly `size` bytes following their separator.
pub fn parse_diff(buf: &Bytes) -> Result<Vec<DiffEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset + 1 < buf.len() {
        let rest = &buf[offset..];
        let sep_pos = match find(rest, DIFF_SEP) {
            Some(p) => p,
            None => break,
        };
        let chunk = &rest[..sep_pos];
        offset += sep_pos + DIFF_SEP.len();

        match chunk.first() {
            Some(b'A') => {
                let chunk = chunk
                    .get(2..)
                    .context("truncated A entry in diff")?;
                let nl = find(chunk, b"\n").context("no newline in A entry")?;
                let path = std::str::from_utf8(&chunk[..nl])
                    .context("non-utf8 path in diff")?
                    .to_string();
                let stat = EntryStat::unserialize(
                    std::str::from_utf8(&chunk[nl + 1..]).context("non-utf8 stat in diff")?,
                );
                let contents = if !stat.is_dir && stat.size > 0 {
                    let size = stat.size as usize;
                    if offset + size > buf.len() {
                        bail!("diff payload truncated for {}", path);
                    }
                    let contents = buf.slice(offset..offset + size);
                    offset += size;
                    contents
                } else {
                    Bytes::new()
                };
                entries.push(DiffEntry::Add {
                    path,
                    stat,
                    contents,
                });
            }
            Some(b'D') => {
                let path = std::str::from_utf8(chunk.get(2..).context("truncated D entry")?)
                    .context("non-utf8 path in diff")?
                    .to_string();
                entries.push(DiffEntry::Delete { path });
            }
            other => bail!("unknown operation in diff: {:?}", other),
        }
    }

    Ok(entries)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// =============================================================================
// Big-file payloads
// =============================================================================

/// `BIGRCV` payload: zero-padded filename length, filename, chunk bytes.
pub fn big_chunk_payload(path: &str, chunk: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ACTION_LEN + path.len() + chunk.len());
    buf.extend_from_slice(format!("{:010}", path.len()).as_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(chunk);
    buf
}

/// `BIGCOMMIT` payload: zero-padded filename length, filename, serialised stat.
pub fn big_commit_payload(path: &str, stat: &EntryStat) -> Vec<u8> {
    let ser = stat.serialize();
    let mut buf = Vec::with_capacity(ACTION_LEN + path.len() + ser.len());
    buf.extend_from_slice(format!("{:010}", path.len()).as_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(ser.as_bytes());
    buf
}

/// Split a `BIGRCV`/`BIGCOMMIT` payload into filename and remainder.
pub fn parse_big_payload(buf: &Bytes) -> Result<(String, Bytes)> {
    if buf.len() < ACTION_LEN {
        bail!("big payload shorter than its length field");
    }
    let name_len = parse_length(&buf[..ACTION_LEN])?;
    if buf.len() < ACTION_LEN + name_len {
        bail!("big payload truncated: filename of {} bytes missing", name_len);
    }
    let path = std::str::from_utf8(&buf[ACTION_LEN..ACTION_LEN + name_len])
        .context("non-utf8 filename in big payload")?
        .to_string();
    Ok((path, buf.slice(ACTION_LEN + name_len..)))
}
