//! Local change detection: per-directory rescans diffed against the
//! repository snapshot, the bounded diff buffer with autocommit, the chunked
//! big-file sender, and the aggregator that drives it all off watcher events.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::outlog::OutLog;
use crate::protocol::{self, Action, ACTION_LEN, MAX_DIFF_SIZE};
use crate::repository::{Repository, STATE_DIR};
use crate::stat::{stats_equal, EntryStat};

/// How often accumulated watcher notifications are turned into rescans.
pub const DIR_AGGREGATE_INTERVAL: Duration = Duration::from_millis(400);

/// Keepalive interval, both directions.
pub const PING_INTERVAL: Duration = Duration::from_secs(60);

pub struct ChangeEngine {
    root: PathBuf,
    repo: Repository,
    log: Arc<OutLog>,
    diff: Vec<u8>,
    hash_check: bool,
}

impl ChangeEngine {
    pub fn new(
        root: impl Into<PathBuf>,
        repo: Repository,
        log: Arc<OutLog>,
        hash_check: bool,
    ) -> Self {
        Self {
            root: root.into(),
            repo,
            log,
            diff: Vec::with_capacity(MAX_DIFF_SIZE),
            hash_check,
        }
    }

    fn disk_path(&self, rel: &str) -> PathBuf {
        if rel == "." {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    /// Full recursive scan that populates the repository without emitting
    /// diff records. Run once at startup, before entering the watcher loop.
    pub fn initial_scan(&mut self) -> Result<()> {
        self.sync_dir(".", true, false)
    }

    /// Rescan one directory against the repository. Emits a `D` entry for
    /// every vanished name first, then an `A` entry for every new or changed
    /// one; recurses into directories that are new, changed type, or when
    /// `recursive` is set. Unreadable directories are skipped with a warning:
    /// the next change notification retries.
    pub fn sync_dir(&mut self, dir: &str, recursive: bool, send: bool) -> Result<()> {
        let dir = dir.strip_prefix("./").unwrap_or(dir).to_string();
        if dir.starts_with(STATE_DIR) {
            return Ok(());
        }

        let disk = self.disk_path(&dir);
        let meta = match fs::metadata(&disk) {
            Ok(m) => m,
            Err(e) => {
                warn!("cannot open {}: {}", dir, e);
                return Ok(());
            }
        };
        if !meta.is_dir() {
            warn!("suddenly {} stopped being a directory", dir);
            return Ok(());
        }

        // Deletion pass must come first: a type flip surfaces as a delete
        // followed by an add, and the receiver cannot apply the add while the
        // old incarnation is still in the way.
        let known: Vec<(String, bool, bool)> = self
            .repo
            .dir_entries_mut(&dir)
            .iter()
            .map(|(name, st)| (name.clone(), st.is_dir, st.is_link))
            .collect();
        for (name, was_dir, was_link) in known {
            match fs::symlink_metadata(disk.join(&name)) {
                Ok(meta) => {
                    if meta.is_dir() == was_dir && meta.file_type().is_symlink() == was_link {
                        continue;
                    }
                    // changed type: drop the entry so the addition pass
                    // re-observes it from scratch
                    self.repo.dir_entries_mut(&dir).remove(&name);
                    let rel = join_rel(&dir, &name);
                    debug!("type changed: {}", rel);
                    if send {
                        self.add_to_diff(&rel, None)?;
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.repo.dir_entries_mut(&dir).remove(&name);
                    let rel = join_rel(&dir, &name);
                    debug!("deleted: {}", rel);
                    if send {
                        self.add_to_diff(&rel, None)?;
                    }
                }
                Err(e) => warn!("lstat failed for {}/{}: {}", dir, name, e),
            }
        }

        let entries = match fs::read_dir(&disk) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("could not read directory {}: {}", dir, e);
                return Ok(());
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("could not read directory names from {}: {}", dir, e);
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("lstat failed for {}/{}: {}", dir, name, e);
                    continue;
                }
            };
            let mut fresh = EntryStat::from_metadata(&meta);
            let rel = join_rel(&dir, &name);

            let prior = self.repo.dir_entries(&dir).and_then(|m| m.get(&name)).cloned();
            let unchanged = match &prior {
                Some(old) => stats_equal(&self.disk_path(&rel), &mut fresh, old, self.hash_check),
                None => false,
            };
            if unchanged {
                continue;
            }

            if fresh.is_dir && (recursive || !prior.as_ref().is_some_and(|p| p.is_dir)) {
                self.sync_dir(&rel, true, send)?;
            }

            if prior.is_none() {
                debug!("added: {}", rel);
            } else {
                debug!("changed: {}", rel);
            }
            self.repo.insert(&dir, &name, fresh.clone());
            if send {
                self.add_to_diff(&rel, Some(&fresh))?;
            }
        }

        Ok(())
    }

    /// Append one entry to the diff buffer, autocommitting when it would
    /// overflow and diverting regular files above `MAX_DIFF_SIZE / 2` to the
    /// chunked big-file path.
    pub fn add_to_diff(&mut self, path: &str, stat: Option<&EntryStat>) -> Result<()> {
        let (header, payload_len) = match stat {
            None => (protocol::delete_header(path), 0i64),
            Some(st) => {
                let len = if st.is_dir { 0 } else { st.size };
                (protocol::add_header(path, st), len)
            }
        };

        if let Some(st) = stat {
            if !st.is_dir && !st.is_link && payload_len > (MAX_DIFF_SIZE / 2) as i64 {
                return self.send_big_file(path, st);
            }
        }

        if self.diff.len() + payload_len as usize + header.len() >= MAX_DIFF_SIZE - 1 {
            info!(
                "diff too big: {} >= {}, autocommit",
                self.diff.len() + payload_len as usize + header.len(),
                MAX_DIFF_SIZE - 1
            );
            self.commit_diff()?;
        }

        let mut payload = Vec::new();
        if let Some(st) = stat {
            if payload_len > 0 {
                let disk = self.disk_path(path);
                if st.is_link {
                    let target = match fs::read_link(&disk) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("could not read link {}: {}", path, e);
                            return Ok(());
                        }
                    };
                    use std::os::unix::ffi::OsStrExt;
                    payload = target.as_os_str().as_bytes().to_vec();
                    if payload.len() as i64 != payload_len {
                        warn!("readlink returned unexpected number of bytes for {}", path);
                        return Ok(());
                    }
                } else {
                    let mut fp = match fs::File::open(&disk) {
                        Ok(fp) => fp,
                        Err(e) => {
                            warn!("could not open {}: {}", path, e);
                            return Ok(());
                        }
                    };
                    payload = Vec::with_capacity(payload_len as usize);
                    if let Err(e) = fp
                        .by_ref()
                        .take(payload_len as u64)
                        .read_to_end(&mut payload)
                    {
                        warn!("cannot read {}: {}", path, e);
                        return Ok(());
                    }
                    if payload.len() as i64 != payload_len {
                        // shrank under us; the next rescan re-observes it
                        warn!("read unexpected number of bytes from {}", path);
                        return Ok(());
                    }
                }
            }
        }

        self.diff.extend_from_slice(&header);
        self.diff.extend_from_slice(&payload);
        Ok(())
    }

    /// Flush the accumulated diff buffer as one `DIFF` log record.
    pub fn commit_diff(&mut self) -> Result<()> {
        if self.diff.is_empty() {
            return Ok(());
        }
        self.log.write(Action::Diff, &self.diff)?;
        self.diff.clear();
        Ok(())
    }

    /// Chunked transfer of a file too large for the diff buffer:
    /// `BIGINIT`, then `BIGRCV` per chunk, then `BIGCOMMIT` — or `BIGABORT`
    /// as soon as the file is seen changing under us.
    pub fn send_big_file(&mut self, path: &str, stat: &EntryStat) -> Result<()> {
        info!("sending big file: {} ({} MiB)", path, stat.size / 1024 / 1024);

        let disk = self.disk_path(path);
        let mut fp = match fs::File::open(&disk) {
            Ok(fp) => fp,
            Err(e) => {
                warn!("could not open {}: {}", path, e);
                return Ok(());
            }
        };

        // Pre-register the transfer so the next rescan of the parent does not
        // queue the same file again.
        let (dir, base) = split_rel(path);
        self.repo.insert(dir, base, stat.clone());

        self.log.write(Action::BigInit, path.as_bytes())?;

        let chunk_cap = MAX_DIFF_SIZE / 2 - ACTION_LEN - path.len();
        let mut bytes_left = stat.size;
        while bytes_left > 0 {
            let meta = match fp.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("cannot stat {} mid-transfer: {}", path, e);
                    self.log.write(Action::BigAbort, path.as_bytes())?;
                    return Ok(());
                }
            };
            let mut fresh = EntryStat::from_metadata(&meta);
            if !stats_equal(&disk, &mut fresh, stat, false) {
                warn!("file {} has changed, aborting transfer", path);
                self.log.write(Action::BigAbort, path.as_bytes())?;
                return Ok(());
            }

            let mut chunk = vec![0u8; chunk_cap.min(bytes_left as usize)];
            if let Err(e) = fp.read_exact(&mut chunk) {
                warn!("cannot read {}: {}", path, e);
                self.log.write(Action::BigAbort, path.as_bytes())?;
                return Ok(());
            }
            self.log
                .write(Action::BigRcv, &protocol::big_chunk_payload(path, &chunk))?;
            bytes_left -= chunk.len() as i64;
        }

        self.log
            .write(Action::BigCommit, &protocol::big_commit_payload(path, stat))?;
        info!("big file {} successfully sent", path);
        Ok(())
    }

    /// Map a raw watcher path to the directory that needs a rescan: make it
    /// relative to the root, walk up to the containing directory when the
    /// path is a file or already gone, and drop excluded paths.
    pub fn normalize_change_path(&self, path: &Path) -> Option<String> {
        let rel = if path.is_absolute() {
            match path.strip_prefix(&self.root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => {
                    warn!("cannot compute relative path for {}", path.display());
                    return None;
                }
            }
        } else {
            path.to_path_buf()
        };
        let rel = rel.to_string_lossy().into_owned();
        let mut dir = if rel.is_empty() { ".".to_string() } else { rel };

        match fs::symlink_metadata(self.disk_path(&dir)) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => dir = parent_rel(&dir),
            Err(e) if e.kind() == ErrorKind::NotFound => dir = parent_rel(&dir),
            Err(e) => {
                warn!("stat failed for {}: {}", dir, e);
                return None;
            }
        }

        if dir != "." && self.repo.is_excluded(&dir) {
            return None;
        }
        Some(dir)
    }
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir == "." {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn split_rel(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => (".", path),
    }
}

fn parent_rel(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => ".".to_string(),
    }
}

/// Consume watcher notifications, coalesce them into a set of directories,
/// and every 400 ms rescan the batch and commit the resulting diff. The
/// blocking filesystem work runs off the async threads.
pub async fn aggregate_loop(
    mut engine: ChangeEngine,
    mut rx: UnboundedReceiver<PathBuf>,
) -> Result<()> {
    let mut pending: HashSet<String> = HashSet::new();
    let mut tick = tokio::time::interval(DIR_AGGREGATE_INTERVAL);

    loop {
        tokio::select! {
            changed = rx.recv() => {
                match changed {
                    Some(path) => {
                        if let Some(dir) = engine.normalize_change_path(&path) {
                            pending.insert(dir);
                        }
                    }
                    None => bail!("watcher channel closed"),
                }
            }
            _ = tick.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let dirs: Vec<String> = pending.drain().collect();
                engine = tokio::task::spawn_blocking(move || -> Result<ChangeEngine> {
                    for dir in &dirs {
                        info!("changed dir: {}", dir);
                        engine.sync_dir(dir, false, true)?;
                    }
                    engine.commit_diff()?;
                    Ok(engine)
                })
                .await
                .context("rescan task panicked")??;
            }
        }
    }
}

/// Inject a keepalive into the out-log every minute so idle peers still see
/// traffic and the remote watchdog stays fed.
pub async fn ping_loop(log: Arc<OutLog>) {
    let mut tick = tokio::time::interval(PING_INTERVAL);
    loop {
        tick.tick().await;
        if let Err(e) = log.write(Action::Ping, b"") {
            warn!("cannot write ping: {}", e);
            return;
        }
    }
}
