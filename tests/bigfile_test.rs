//! Big-file transfer scenarios: chunked send, abort on concurrent mutation,
//! and the guarantee that oversized files never ride inline in a DIFF.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use bytes::Bytes;
use filetime::FileTime;
use tempfile::TempDir;

use unrealsync::changes::ChangeEngine;
use unrealsync::outlog::{LogRead, OutLog};
use unrealsync::protocol::{parse_big_payload, Action, ACTION_LEN, MAX_DIFF_SIZE};
use unrealsync::repository::Repository;
use unrealsync::stat::EntryStat;

fn setup(root: &TempDir, state: &TempDir) -> (ChangeEngine, Arc<OutLog>) {
    let log = Arc::new(OutLog::create(state.path().join("out.log")).unwrap());
    log.open_reader("peer", false).unwrap();
    let engine = ChangeEngine::new(
        root.path().to_path_buf(),
        Repository::new(HashSet::new()),
        log.clone(),
        false,
    );
    (engine, log)
}

fn drain(log: &OutLog, peer: &str) -> Vec<(Action, Bytes)> {
    let mut records = Vec::new();
    loop {
        let cur = log.cursor(peer).unwrap();
        if cur.read_pos == cur.write_pos && cur.old_size == 0 {
            break;
        }
        match log.read_entry(peer).unwrap() {
            LogRead::Record { frame, pos } => {
                log.advance(peer, pos);
                let action = Action::from_bytes(&frame[..10]).unwrap();
                records.push((action, frame.slice(20..)));
            }
            LogRead::Drained => log.open_reader(peer, false).unwrap(),
        }
    }
    records
}

#[test]
fn test_big_file_is_chunked() {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let (mut engine, log) = setup(&root, &state);
    engine.initial_scan().unwrap();

    let size = 3 * 1024 * 1024;
    let contents: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    fs::write(root.path().join("big.bin"), &contents).unwrap();

    engine.sync_dir(".", false, true).unwrap();
    engine.commit_diff().unwrap();

    let records = drain(&log, "peer");
    // never inline: no DIFF record at all for a single big file
    assert!(records.iter().all(|(a, _)| *a != Action::Diff));

    assert_eq!(records.first().unwrap().0, Action::BigInit);
    assert_eq!(records.first().unwrap().1.as_ref(), b"big.bin".as_slice());

    let chunks: Vec<_> = records
        .iter()
        .filter(|(a, _)| *a == Action::BigRcv)
        .collect();
    assert!(chunks.len() >= 3);

    let chunk_cap = MAX_DIFF_SIZE / 2 - ACTION_LEN - "big.bin".len();
    let mut reassembled = Vec::new();
    for (_, payload) in &chunks {
        let (path, chunk) = parse_big_payload(payload).unwrap();
        assert_eq!(path, "big.bin");
        assert!(chunk.len() <= chunk_cap);
        reassembled.extend_from_slice(&chunk);
    }
    assert_eq!(reassembled, contents);

    let (action, payload) = records.last().unwrap();
    assert_eq!(*action, Action::BigCommit);
    let (path, rest) = parse_big_payload(payload).unwrap();
    assert_eq!(path, "big.bin");
    let stat = EntryStat::unserialize(std::str::from_utf8(&rest).unwrap());
    assert_eq!(stat.size, size as i64);
    assert!(!stat.is_dir);
}

#[test]
fn test_big_file_mutated_during_send_aborts() {
    let root = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let (mut engine, log) = setup(&root, &state);

    let file = root.path().join("big.bin");
    fs::write(&file, vec![0u8; 5 * 1024 * 1024]).unwrap();
    let stale = EntryStat::from_metadata(&fs::symlink_metadata(&file).unwrap());

    // the file moves on after we took the stat, as if it were written to
    // while the transfer is in flight
    filetime::set_file_mtime(&file, FileTime::from_unix_time(stale.mtime + 60, 0)).unwrap();

    engine.send_big_file("big.bin", &stale).unwrap();

    let records = drain(&log, "peer");
    assert_eq!(records.first().unwrap().0, Action::BigInit);
    assert_eq!(records.last().unwrap().0, Action::BigAbort);
    assert_eq!(records.last().unwrap().1.as_ref(), b"big.bin".as_slice());
    assert!(records.iter().all(|(a, _)| *a != Action::BigCommit));
}
