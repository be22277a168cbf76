use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use unrealsync::client::{self, ClientOptions};
use unrealsync::repository::STATE_DIR;
use unrealsync::server;
use unrealsync::settings::{self, Settings};

const REPO_TMP: &str = "tmp";
const REPO_CLIENT_CONFIG: &str = "client_config";
const REPO_PID: &str = "pid";
const REPO_PID_SERVER: &str = "pid_server";

/// Continuously mirror a local directory tree to one or more remote hosts.
#[derive(Parser)]
#[command(name = "unrealsync", version)]
struct Cli {
    /// Turn on debugging information
    #[arg(long)]
    debug: bool,

    /// Exclude specified path from sync (repeatable)
    #[arg(long = "exclude")]
    excludes: Vec<String>,

    /// Perform sync only for servers matching this glob
    #[arg(long)]
    servers: Option<String>,

    /// Store logs and pid file in the specified folder
    #[arg(long = "repo-path")]
    repo_path: Option<PathBuf>,

    /// Use this user to store files on the remote side
    #[arg(long = "sudo-user")]
    sudo_user: Option<String>,

    /// Path of the unrealsync binary to run on the remote side
    #[arg(long = "remote-bin-path")]
    remote_bin_path: Option<String>,

    /// Use md5 hashing to check whether file content changed before syncing
    #[arg(long = "hash-check")]
    hash_check: bool,

    /// (internal) run in server mode on the remote side
    #[arg(long, hide = true)]
    server: bool,

    /// (internal) hostname this side reports in logs
    #[arg(long, hide = true)]
    hostname: Option<String>,

    /// Directory to sync
    dir: Option<PathBuf>,

    /// Remote targets: [user@]host:remote-dir (as many as needed)
    targets: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Some(dir) = cli.dir.clone() else {
        eprintln!("ERR: You should specify directory to sync");
        eprintln!("Try unrealsync --help for more information");
        std::process::exit(123);
    };

    init_tracing(cli.debug);

    if let Err(e) = run(cli, dir).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, dir: PathBuf) -> Result<()> {
    let source_dir = dir
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", dir.display()))?;
    let repo_path = match &cli.repo_path {
        Some(path) if path.is_absolute() => path.clone(),
        Some(path) => std::env::current_dir()?.join(path),
        None => source_dir.join(STATE_DIR),
    };

    if cli.server {
        let host = cli.hostname.as_deref().unwrap_or("?");
        info!("unrealsync server starting at {} for {}", source_dir.display(), host);
    } else {
        info!("unrealsync starting from {}", source_dir.display());
    }

    let tmp_dir = repo_path.join(REPO_TMP);
    let _ = std::fs::remove_dir_all(&tmp_dir);
    for dir in [&repo_path, &tmp_dir] {
        if !dir.exists() {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new()
                .mode(0o755)
                .create(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
    }

    let pid_file = repo_path.join(if cli.server { REPO_PID_SERVER } else { REPO_PID });
    write_pid_and_kill_previous(&pid_file)?;
    spawn_signal_handler();

    if cli.server {
        server::run_server(source_dir, tmp_dir).await
    } else {
        let mut global_excludes: HashSet<String> = cli.excludes.iter().cloned().collect();
        let servers = if cli.targets.is_empty() {
            let (servers, config_excludes) = settings::parse_config(
                &repo_path.join(REPO_CLIENT_CONFIG),
                cli.servers.as_deref(),
            )?;
            global_excludes.extend(config_excludes);
            servers
        } else {
            let mut servers = HashMap::new();
            for target in &cli.targets {
                let settings = Settings::from_target(
                    target,
                    cli.sudo_user.as_deref(),
                    cli.remote_bin_path.as_deref(),
                    &global_excludes,
                )?;
                servers.insert(settings.host.clone(), settings);
            }
            servers
        };
        if servers.is_empty() {
            bail!("no servers to sync with");
        }
        client::run_client(ClientOptions {
            source_dir,
            repo_path,
            servers,
            global_excludes,
            hash_check: cli.hash_check,
            debug: cli.debug,
        })
        .await
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Take over from a previous instance: ask it to stop with SIGUSR1, give it
/// 250 ms, make sure with SIGKILL, then record our own pid.
fn write_pid_and_kill_previous(pid_file: &Path) -> Result<()> {
    if let Ok(contents) = std::fs::read_to_string(pid_file) {
        if let Ok(pid) = contents.trim().parse::<i32>() {
            let pid = Pid::from_raw(pid);
            if kill(pid, Signal::SIGUSR1).is_ok() {
                std::thread::sleep(Duration::from_millis(250));
                let _ = kill(pid, Signal::SIGKILL);
            }
        }
    }
    std::fs::write(pid_file, std::process::id().to_string())
        .with_context(|| format!("cannot write {}", pid_file.display()))
}

/// SIGUSR1 is the graceful-stop handshake used by a successor instance.
fn spawn_signal_handler() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("cannot install SIGUSR1 handler: {}", e);
                return;
            }
        };
        usr1.recv().await;
        info!("got SIGUSR1, stopping");
        std::process::exit(0);
    });
}
