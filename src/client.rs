//! Client role: one lifecycle task per remote peer, plus the top-level
//! wiring of watcher, change engine, ping writer and status loop.
//!
//! A peer session is three tasks sharing one error channel: a stdin writer
//! multiplexer (sole writer to the ssh stdin), a log pump draining this
//! peer's out-log cursor, and a pong responder answering the remote's bare
//! 10-byte pings. The first error wins, cancels the session's stop token,
//! kills the ssh child and schedules a reconnect after a fixed backoff.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::changes::{self, ChangeEngine};
use crate::outlog::{LogRead, OutLog};
use crate::protocol::{self, Action, ACTION_LEN};
use crate::repository::{Repository, STATE_DIR};
use crate::settings::{ssh_options, Settings};
use crate::status::{self, QueuePolice};
use crate::watcher;
use crate::VERSION;

/// Fixed backoff between peer reconnect attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Poll interval of an idle log pump.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct ClientOptions {
    pub source_dir: PathBuf,
    pub repo_path: PathBuf,
    pub servers: HashMap<String, Settings>,
    pub global_excludes: HashSet<String>,
    pub hash_check: bool,
    pub debug: bool,
}

/// Client entry point: start every peer, the keepalive writer and the
/// watcher; run the initial scan; then loop on aggregated changes forever.
pub async fn run_client(opts: ClientOptions) -> Result<()> {
    let log = Arc::new(OutLog::create(opts.repo_path.join("out.log"))?);

    let mut police_map = HashMap::new();
    for (name, settings) in &opts.servers {
        let police = Arc::new(QueuePolice::new(settings.send_queue_limit));
        police_map.insert(name.clone(), police.clone());
        let client = PeerClient {
            peer: name.clone(),
            settings: settings.clone(),
            log: log.clone(),
            police,
            source_dir: opts.source_dir.clone(),
            debug: opts.debug,
        };
        tokio::spawn(client.run());
    }
    tokio::spawn(changes::ping_loop(log.clone()));

    let (tx, rx) = mpsc::unbounded_channel();
    let _watcher = watcher::spawn(&opts.source_dir, tx)?;

    let repo = Repository::new(opts.global_excludes.clone());
    let mut engine = ChangeEngine::new(
        opts.source_dir.clone(),
        repo,
        log.clone(),
        opts.hash_check,
    );
    engine = tokio::task::spawn_blocking(move || -> Result<ChangeEngine> {
        engine.initial_scan()?;
        Ok(engine)
    })
    .await
    .context("initial scan task panicked")??;
    info!("initial scan complete");

    tokio::spawn(status::status_loop(log.clone(), police_map));

    info!("entering watcher loop");
    changes::aggregate_loop(engine, rx).await
}

/// A framed record on its way to the ssh stdin, with completion signalling
/// back to the producer so cursor advancement happens only after the write.
struct BufBlocker {
    frame: Bytes,
    sent: oneshot::Sender<()>,
}

pub struct PeerClient {
    peer: String,
    settings: Settings,
    log: Arc<OutLog>,
    police: Arc<QueuePolice>,
    source_dir: PathBuf,
    debug: bool,
}

impl PeerClient {
    pub async fn run(self) {
        loop {
            if let Err(e) = self.connect_once().await {
                warn!(peer = %self.peer, "peer session failed: {:#}", e);
            }
            self.police.clear();
            tokio::time::sleep(RETRY_INTERVAL).await;
            info!(peer = %self.peer, "reconnecting");
        }
    }

    /// One full session. Never returns Ok: either setup fails or one of the
    /// session tasks reports an error, and the caller reconnects.
    async fn connect_once(&self) -> Result<()> {
        // Open the cursor before the bulk copy starts, so every change made
        // while rsync runs is replayed from the log afterwards.
        self.log.open_reader(&self.peer, true)?;
        self.initial_sync().await?;

        let (ostype, osarch) = self.prepare_remote().await?;
        let bin_path = match &self.settings.remote_bin_path {
            Some(path) => path.clone(),
            None => {
                let path = format!("{}/{}/unrealsync", self.settings.dir, STATE_DIR);
                if !self.remote_binary_compatible(&path).await {
                    self.copy_binary(&ostype, &osarch).await?;
                }
                path
            }
        };

        info!("launching unrealsync at {}...", self.peer);
        let mut child = self.launch_remote(&bin_path)?;
        let stdin = child.stdin.take().context("cannot take ssh stdin")?;
        let stdout = child.stdout.take().context("cannot take ssh stdout")?;
        let stderr = child.stderr.take().context("cannot take ssh stderr")?;

        let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1);
        let stop = CancellationToken::new();
        self.police.install(err_tx.clone());

        let (stream_tx, stream_rx) = mpsc::channel::<BufBlocker>(1);
        tokio::spawn(stdin_writer(
            stream_rx,
            stdin,
            err_tx.clone(),
            stop.child_token(),
        ));
        tokio::spawn(log_pump(
            self.log.clone(),
            self.peer.clone(),
            stream_tx.clone(),
            err_tx.clone(),
            stop.child_token(),
        ));
        tokio::spawn(pong_responder(
            stdout,
            self.peer.clone(),
            stream_tx,
            err_tx,
            stop.child_token(),
        ));
        tokio::spawn(stderr_drain(stderr, self.peer.clone()));

        let err = err_rx
            .recv()
            .await
            .unwrap_or_else(|| anyhow!("error channel closed"));
        stop.cancel();
        if let Err(e) = child.kill().await {
            warn!(peer = %self.peer, "could not kill ssh process: {}", e);
        }
        Err(err)
    }

    /// Initial bulk copy, delegated to rsync over the same ssh options.
    async fn initial_sync(&self) -> Result<()> {
        info!("initial file sync using rsync at {}...", self.peer);
        let mut args: Vec<String> = vec![
            "-e".to_string(),
            format!("ssh {}", ssh_options(&self.settings).join(" ")),
        ];
        for exclude in &self.settings.excludes {
            args.push(format!("--exclude={}", exclude));
        }
        if let Some(sudo) = &self.settings.sudo_user {
            args.push("--rsync-path".to_string());
            args.push(format!("sudo -u {} rsync", sudo));
        }
        args.push("-a".to_string());
        args.push("--delete".to_string());
        args.push(format!("{}/", self.source_dir.display()));
        args.push(format!("{}:{}/", self.settings.host, self.settings.dir));
        run_command("rsync", &args).await?;
        Ok(())
    }

    /// Create the remote state directory and probe the platform. The `os`
    /// config key overrides the probed ostype.
    async fn prepare_remote(&self) -> Result<(String, String)> {
        info!("creating directories at {}...", self.peer);
        let state_dir = format!("{}/{}", self.settings.dir, STATE_DIR);
        let mut args = ssh_options(&self.settings);
        args.push(self.settings.host.clone());
        args.push(format!(
            "if [ ! -d {dir} ]; then mkdir -p {dir}; fi; uname && uname -m",
            dir = state_dir
        ));
        let output = run_command("ssh", &args).await?;
        let mut lines = output.trim().lines();
        let ostype = lines
            .next()
            .context("no ostype in remote uname output")?
            .to_string();
        let osarch = lines
            .next()
            .context("no osarch in remote uname output")?
            .to_string();
        let ostype = self.settings.os.clone().unwrap_or(ostype);
        Ok((ostype.to_lowercase(), osarch))
    }

    /// Probe the remote binary's version; compatibility is major.minor equal.
    async fn remote_binary_compatible(&self, bin_path: &str) -> bool {
        let mut args = ssh_options(&self.settings);
        args.push(self.settings.host.clone());
        args.push(format!("{} --version 2>/dev/null", bin_path));
        match run_command("ssh", &args).await {
            Ok(output) => {
                // `--version` prints "unrealsync X.Y.Z"
                let remote = output.split_whitespace().last().unwrap_or("");
                let compatible = versions_compatible(VERSION, remote);
                if !compatible {
                    info!(
                        peer = %self.peer,
                        "remote version {:?} incompatible with {}", remote, VERSION
                    );
                }
                compatible
            }
            Err(e) => {
                debug!(peer = %self.peer, "remote version probe failed: {:#}", e);
                false
            }
        }
    }

    async fn copy_binary(&self, ostype: &str, osarch: &str) -> Result<()> {
        info!(
            "copying unrealsync binary to {} ostype {} osarch {}",
            self.peer, ostype, osarch
        );
        let local_dir = std::env::current_exe()
            .context("cannot determine binary location")?
            .parent()
            .context("binary has no parent directory")?
            .to_path_buf();
        let source = local_dir.join(format!("unrealsync-{}-{}", ostype, osarch));
        if !source.exists() {
            bail!(
                "cannot stat {}: make sure you have built a server binary for the remote platform",
                source.display()
            );
        }
        let mut args = ssh_options(&self.settings);
        args.push(source.display().to_string());
        args.push(format!(
            "{}:{}/{}/unrealsync",
            self.settings.host, self.settings.dir, STATE_DIR
        ));
        run_command("scp", &args).await?;
        Ok(())
    }

    fn launch_remote(&self, bin_path: &str) -> Result<Child> {
        let mut flags = format!("--server --hostname={}", self.settings.host);
        if self.debug {
            flags.push_str(" --debug");
        }
        for exclude in &self.settings.excludes {
            flags.push_str(&format!(" --exclude {}", exclude));
        }
        let mut launch = format!("{} {} {}", bin_path, flags, self.settings.dir);
        if let Some(sudo) = &self.settings.sudo_user {
            launch = format!("sudo -u {} {}", sudo, launch);
        }

        let mut cmd = Command::new("ssh");
        cmd.args(ssh_options(&self.settings));
        cmd.arg(&self.settings.host).arg(&launch);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("ssh {:?}", cmd.as_std().get_args());
        cmd.spawn().context("cannot spawn ssh")
    }
}

/// Sole writer to the ssh stdin: serialises frames from the log pump and the
/// pong responder, signalling completion back to whoever queued the frame.
async fn stdin_writer(
    mut rx: mpsc::Receiver<BufBlocker>,
    mut stdin: ChildStdin,
    err_tx: mpsc::Sender<anyhow::Error>,
    stop: CancellationToken,
) {
    loop {
        let blocker = tokio::select! {
            _ = stop.cancelled() => return,
            msg = rx.recv() => match msg {
                Some(blocker) => blocker,
                None => return,
            },
        };
        let result = async {
            stdin.write_all(&blocker.frame).await?;
            stdin.flush().await
        }
        .await;
        // completion is acknowledged either way; the error below tears the
        // whole session down
        let _ = blocker.sent.send(());
        if let Err(e) = result {
            let _ = err_tx.try_send(anyhow!(e).context("cannot write to ssh stdin"));
            return;
        }
    }
}

/// Drain this peer's out-log cursor into the writer multiplexer. The cursor
/// advances only after the frame reached the writer, so a reconnect with a
/// continuation open never re-delivers acknowledged records.
async fn log_pump(
    log: Arc<OutLog>,
    peer: String,
    stream: mpsc::Sender<BufBlocker>,
    err_tx: mpsc::Sender<anyhow::Error>,
    stop: CancellationToken,
) {
    loop {
        if stop.is_cancelled() {
            debug!(peer = %peer, "got stop, leaving log pump");
            return;
        }
        let Some(cursor) = log.cursor(&peer) else {
            let _ = err_tx.try_send(anyhow!("out-log reader for {} disappeared", peer));
            return;
        };
        if cursor.read_pos == cursor.write_pos && cursor.old_size == 0 {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
            continue;
        }

        let read = {
            let log = log.clone();
            let peer = peer.clone();
            tokio::task::spawn_blocking(move || log.read_entry(&peer)).await
        };
        let read = match read {
            Ok(read) => read,
            Err(e) => {
                let _ = err_tx.try_send(anyhow!("out-log read task panicked: {}", e));
                return;
            }
        };
        match read {
            Ok(LogRead::Drained) => {
                // crossed a rotation boundary; continue on the current file
                if let Err(e) = log.open_reader(&peer, false) {
                    let _ = err_tx.try_send(e);
                    return;
                }
            }
            Ok(LogRead::Record { frame, pos }) => {
                let (sent_tx, sent_rx) = oneshot::channel();
                let blocker = BufBlocker {
                    frame,
                    sent: sent_tx,
                };
                tokio::select! {
                    _ = stop.cancelled() => return,
                    res = stream.send(blocker) => if res.is_err() { return; },
                }
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = sent_rx => {}
                }
                log.advance(&peer, pos);
            }
            Err(e) => {
                let _ = err_tx.try_send(e);
                return;
            }
        }
    }
}

/// The remote emits a bare 10-byte action (its minutely `PING`, or a `PONG`
/// answering ours) on stdout; every read is answered with a framed
/// zero-length `PONG` through the writer multiplexer.
async fn pong_responder(
    mut stdout: ChildStdout,
    peer: String,
    stream: mpsc::Sender<BufBlocker>,
    err_tx: mpsc::Sender<anyhow::Error>,
    stop: CancellationToken,
) {
    let pong = protocol::frame(Action::Pong, b"");
    let mut buf = [0u8; ACTION_LEN];
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            res = stdout.read_exact(&mut buf) => {
                if let Err(e) = res {
                    let _ = err_tx.try_send(anyhow!("could not read from server {}: {}", peer, e));
                    return;
                }
                debug!(peer = %peer, "read {:?} from server", String::from_utf8_lossy(&buf));
                let (sent_tx, sent_rx) = oneshot::channel();
                let blocker = BufBlocker { frame: pong.clone(), sent: sent_tx };
                if stream.send(blocker).await.is_err() {
                    return;
                }
                let _ = sent_rx.await;
            }
        }
    }
}

async fn stderr_drain(stderr: ChildStderr, peer: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(peer = %peer, "remote: {}", line);
    }
}

async fn run_command(cmd: &str, args: &[String]) -> Result<String> {
    debug!("{} {:?}", cmd, args);
    let output = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("cannot run {}", cmd))?;
    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            cmd,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Two versions are compatible when both parse as dotted integers and agree
/// on major and minor.
pub fn versions_compatible(first: &str, second: &str) -> bool {
    match (version_ints(first), version_ints(second)) {
        (Some(a), Some(b)) => a.len() >= 2 && b.len() >= 2 && a[0] == b[0] && a[1] == b[1],
        _ => false,
    }
}

fn version_ints(version: &str) -> Option<Vec<u32>> {
    version.split('.').map(|part| part.parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_compatible() {
        assert!(versions_compatible("1.2.3", "1.2.9"));
        assert!(versions_compatible("1.2", "1.2.100"));
        assert!(!versions_compatible("1.2.3", "1.3.3"));
        assert!(!versions_compatible("2.2.3", "1.2.3"));
        assert!(!versions_compatible("1.2.3", ""));
        assert!(!versions_compatible("1.2.3", "garbage"));
        assert!(!versions_compatible("1", "1"));
    }
}
