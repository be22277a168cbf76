//! Server role: the apply engine on the receiving side.
//!
//! Reads framed records from stdin and reconstructs the mirrored tree:
//! regular files are staged in the state tmp directory and renamed into
//! place, big files accumulate in a per-filename staging file across
//! `BIGRCV` records. The only messages going the other way are bare 10-byte
//! `PING`/`PONG` actions on stdout. A watchdog exits the process when no
//! record arrives within two ping intervals.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use filetime::FileTime;
use md5::{Digest, Md5};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::changes::PING_INTERVAL;
use crate::protocol::{self, Action, DiffEntry};
use crate::stat::EntryStat;
use crate::status::format_length;

/// Run the receiver until the stream ends or a record cannot be parsed.
/// Frame corruption is fatal by design: the sending side restarts us through
/// its reconnect path.
pub async fn run_server(root: PathBuf, repo_tmp: PathBuf) -> Result<()> {
    let (activity_tx, activity_rx) = mpsc::channel::<()>(1);
    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));

    tokio::spawn(watchdog(activity_rx));
    tokio::spawn(ping_writer(stdout.clone()));

    info!("entering apply loop");
    let mut engine = ApplyEngine::new(root, repo_tmp);
    let mut stdin = tokio::io::stdin();
    let result = apply_loop(&mut engine, &mut stdin, &stdout, activity_tx).await;
    engine.cleanup();
    result
}

async fn apply_loop(
    engine: &mut ApplyEngine,
    stdin: &mut tokio::io::Stdin,
    stdout: &Arc<Mutex<Stdout>>,
    activity_tx: mpsc::Sender<()>,
) -> Result<()> {
    loop {
        let (action, payload) = protocol::read_frame(stdin).await?;
        let _ = activity_tx.try_send(());
        debug!("received {:?}", action);

        match action {
            Action::Ping => {
                let mut out = stdout.lock().await;
                out.write_all(Action::Pong.as_bytes()).await?;
                out.flush().await?;
            }
            Action::Pong => {}
            Action::Diff => engine.apply_diff(&payload).await?,
            Action::BigInit => engine.big_init(&payload).await?,
            Action::BigRcv => engine.big_rcv(&payload).await?,
            Action::BigCommit => engine.big_commit(&payload).await?,
            Action::BigAbort => engine.big_abort(&payload).await?,
            Action::StopServer => debug!("ignoring reserved action STOPSERVER"),
        }
    }
}

/// Exit with code 1 when no inbound action arrives for two ping intervals.
async fn watchdog(mut activity: mpsc::Receiver<()>) {
    loop {
        match tokio::time::timeout(PING_INTERVAL * 2, activity.recv()).await {
            Ok(Some(())) => {}
            Ok(None) => return,
            Err(_) => {
                error!("server timeout");
                std::process::exit(1);
            }
        }
    }
}

/// Emit a bare `PING` action on stdout every minute.
async fn ping_writer(stdout: Arc<Mutex<Stdout>>) {
    let mut tick = tokio::time::interval(PING_INTERVAL);
    loop {
        tick.tick().await;
        let mut out = stdout.lock().await;
        if out.write_all(Action::Ping.as_bytes()).await.is_err() {
            return;
        }
        let _ = out.flush().await;
    }
}

struct BigStaging {
    file: File,
    tmp_name: PathBuf,
}

pub struct ApplyEngine {
    root: PathBuf,
    repo_tmp: PathBuf,
    big: HashMap<String, BigStaging>,
}

impl ApplyEngine {
    pub fn new(root: PathBuf, repo_tmp: PathBuf) -> Self {
        Self {
            root,
            repo_tmp,
            big: HashMap::new(),
        }
    }

    /// Apply every entry of a DIFF record in order. A corrupt payload is
    /// fatal; failures applying an individual entry are logged and skipped,
    /// the sender's next rescan will re-observe the file.
    pub async fn apply_diff(&mut self, payload: &Bytes) -> Result<()> {
        let entries = protocol::parse_diff(payload)?;
        for entry in entries {
            match entry {
                DiffEntry::Add {
                    path,
                    stat,
                    contents,
                } => self.write_contents(&path, &stat, &contents).await?,
                DiffEntry::Delete { path } => {
                    let target = self.root.join(validate_rel_path(&path)?);
                    if let Err(e) = remove_all(&target).await {
                        warn!("cannot remove {}: {}", path, e);
                    }
                }
            }
        }
        info!("applied diff {}", format_length(payload.len() as u64));
        Ok(())
    }

    async fn write_contents(&self, path: &str, stat: &EntryStat, contents: &[u8]) -> Result<()> {
        let target = self.root.join(validate_rel_path(path)?);

        match fs::symlink_metadata(&target).await {
            Ok(meta) => {
                // cannot atomically rename over a directory or through a
                // symlink, so those have to go first
                if meta.is_dir() != stat.is_dir || meta.file_type().is_symlink() {
                    if let Err(e) = remove_all(&target).await {
                        warn!("cannot remove {}: {}", path, e);
                        return Ok(());
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!("lstat failed for {}: {}", path, e);
                return Ok(());
            }
        }

        if stat.is_dir {
            if let Err(e) = fs::create_dir_all(&target).await {
                warn!("cannot create dir {}: {}", path, e);
                return Ok(());
            }
            if let Err(e) =
                fs::set_permissions(&target, std::fs::Permissions::from_mode(stat.mode)).await
            {
                warn!("cannot chmod dir {}: {}", path, e);
            }
        } else if stat.is_link {
            let link_target = Path::new(OsStr::from_bytes(contents)).to_path_buf();
            if let Err(e) = fs::symlink(&link_target, &target).await {
                warn!("cannot create symlink {}: {}", path, e);
            }
        } else {
            self.write_file(path, &target, stat, contents).await;
        }
        Ok(())
    }

    /// Stage under tmp, apply mode and mtime, then rename over the target.
    async fn write_file(&self, path: &str, target: &Path, stat: &EntryStat, contents: &[u8]) {
        let base = target.file_name().map(OsStr::to_os_string).unwrap_or_default();
        let tmp = self.repo_tmp.join(base);

        let staged: Result<()> = async {
            let mut fp = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)
                .await
                .with_context(|| format!("cannot open {}", tmp.display()))?;
            fp.write_all(contents)
                .await
                .with_context(|| format!("cannot write contents to {}", tmp.display()))?;
            fp.flush().await?;
            drop(fp);

            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(stat.mode))
                .await
                .with_context(|| format!("cannot chmod {}", tmp.display()))?;

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("cannot create dir {}", parent.display()))?;
            }

            set_times(&tmp, stat.mtime).await?;

            fs::rename(&tmp, target)
                .await
                .with_context(|| format!("cannot rename over {}", target.display()))?;
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            warn!("cannot write {}: {:#}", path, e);
            let _ = fs::remove_file(&tmp).await;
        } else {
            debug!("wrote {} {}", path, stat.serialize());
        }
    }

    fn staging_name(&self, filename: &str) -> PathBuf {
        let mut hasher = Md5::new();
        hasher.update(filename.as_bytes());
        self.repo_tmp.join(format!("big_{:x}", hasher.finalize()))
    }

    pub async fn big_init(&mut self, payload: &Bytes) -> Result<()> {
        let filename = std::str::from_utf8(payload)
            .context("non-utf8 filename in BIGINIT")?
            .to_string();
        validate_rel_path(&filename)?;
        let tmp_name = self.staging_name(&filename);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_name)
            .await
            .with_context(|| format!("cannot open staging file {}", tmp_name.display()))?;
        debug!("staging big file {}", filename);
        self.big.insert(filename, BigStaging { file, tmp_name });
        Ok(())
    }

    pub async fn big_rcv(&mut self, payload: &Bytes) -> Result<()> {
        let (filename, chunk) = protocol::parse_big_payload(payload)?;
        let staging = self
            .big
            .get_mut(&filename)
            .with_context(|| format!("received big chunk for unknown file: {}", filename))?;
        staging
            .file
            .write_all(&chunk)
            .await
            .with_context(|| format!("cannot write to {}", staging.tmp_name.display()))?;
        Ok(())
    }

    pub async fn big_commit(&mut self, payload: &Bytes) -> Result<()> {
        let (filename, rest) = protocol::parse_big_payload(payload)?;
        let mut staging = self
            .big
            .remove(&filename)
            .with_context(|| format!("received big commit for unknown file: {}", filename))?;
        let stat =
            EntryStat::unserialize(std::str::from_utf8(&rest).context("non-utf8 stat in BIGCOMMIT")?);

        staging.file.flush().await?;
        drop(staging.file);

        fs::set_permissions(&staging.tmp_name, std::fs::Permissions::from_mode(stat.mode))
            .await
            .with_context(|| format!("cannot chmod {}", staging.tmp_name.display()))?;
        set_times(&staging.tmp_name, stat.mtime).await?;

        let target = self.root.join(validate_rel_path(&filename)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create dir {}", parent.display()))?;
        }
        fs::rename(&staging.tmp_name, &target)
            .await
            .with_context(|| {
                format!(
                    "cannot rename {} to {}",
                    staging.tmp_name.display(),
                    target.display()
                )
            })?;
        info!("committed big file {}", filename);
        Ok(())
    }

    pub async fn big_abort(&mut self, payload: &Bytes) -> Result<()> {
        let filename = std::str::from_utf8(payload).context("non-utf8 filename in BIGABORT")?;
        let staging = self
            .big
            .remove(filename)
            .with_context(|| format!("received big abort for unknown file: {}", filename))?;
        drop(staging.file);
        let _ = fs::remove_file(&staging.tmp_name).await;
        info!("aborted big file {}", filename);
        Ok(())
    }

    /// Drop every staging file; called on teardown so aborted transfers do
    /// not leak into tmp.
    pub fn cleanup(&mut self) {
        for (_, staging) in self.big.drain() {
            drop(staging.file);
            let _ = std::fs::remove_file(&staging.tmp_name);
        }
    }
}

async fn set_times(path: &Path, mtime: i64) -> Result<()> {
    let when = FileTime::from_unix_time(mtime, 0);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || filetime::set_file_times(&path, when, when))
        .await
        .context("set_times task panicked")?
        .context("cannot set file times")
}

/// `rm -rf` semantics regardless of the target's type.
async fn remove_all(target: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(target).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target).await,
        Ok(_) => fs::remove_file(target).await,
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Mirror targets are always clean root-relative paths; anything else in the
/// stream means the stream cannot be trusted.
fn validate_rel_path(path: &str) -> Result<&Path> {
    if path.is_empty() {
        bail!("empty path not allowed");
    }
    let rel = Path::new(path);
    if rel.is_absolute() {
        bail!("absolute paths not allowed: {}", path);
    }
    for component in rel.components() {
        if matches!(component, Component::ParentDir) {
            bail!("path traversal not allowed: {}", path);
        }
    }
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rel_path() {
        assert!(validate_rel_path("a/b.txt").is_ok());
        assert!(validate_rel_path("").is_err());
        assert!(validate_rel_path("/etc/passwd").is_err());
        assert!(validate_rel_path("a/../../b").is_err());
    }
}
