//! Per-peer settings: the client_config INI, host-pattern expansion, and
//! ssh option assembly.
//!
//! Section names may contain brace groups with ranges and alternatives
//! (`web{1..3,a,b}` enumerates `web1 web2 web3 weba webb`); the `--servers`
//! filter matches expanded names with `*` globs.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use ini::Ini;
use tracing::{info, warn};

pub const GENERAL_SECTION: &str = "general_settings";

pub const CONNECT_TIMEOUT_SECS: u32 = 10;
pub const SERVER_ALIVE_INTERVAL: u32 = 3;
pub const SERVER_ALIVE_COUNT_MAX: u32 = 4;

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub sudo_user: Option<String>,
    pub dir: String,
    pub os: Option<String>,
    pub remote_bin_path: Option<String>,
    pub excludes: HashSet<String>,
    pub compression: bool,
    pub batch_mode: bool,
    /// Backpressure limit in bytes; 0 disables policing.
    pub send_queue_limit: u64,
}

impl Settings {
    /// Parse a `[user@]host:dir` command-line target.
    pub fn from_target(
        spec: &str,
        sudo_user: Option<&str>,
        remote_bin_path: Option<&str>,
        excludes: &HashSet<String>,
    ) -> Result<Self> {
        let (host_part, dir) = spec
            .split_once(':')
            .with_context(|| format!("bad host:dir specification: {}", spec))?;
        let (username, host) = match host_part.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host.to_string()),
            None => (None, host_part.to_string()),
        };
        Ok(Self {
            host,
            port: 0,
            username,
            sudo_user: sudo_user.map(str::to_string),
            dir: dir.to_string(),
            os: None,
            remote_bin_path: remote_bin_path.map(str::to_string),
            excludes: excludes.clone(),
            compression: true,
            batch_mode: true,
            send_queue_limit: 0,
        })
    }
}

/// Parse the client_config INI into per-host settings. `force_servers`
/// (the `--servers` flag) overrides the general-section `servers` filter.
pub fn parse_config(
    path: &Path,
    force_servers: Option<&str>,
) -> Result<(HashMap<String, Settings>, HashSet<String>)> {
    let ini = Ini::load_from_file(path)
        .with_context(|| format!("cannot load config {}", path.display()))?;

    let general = ini
        .section(Some(GENERAL_SECTION))
        .with_context(|| format!("section {} of {} is empty", GENERAL_SECTION, path.display()))?;

    let global_excludes = general
        .get("exclude")
        .map(parse_excludes)
        .unwrap_or_default();

    let force = force_servers
        .filter(|s| !s.is_empty())
        .or_else(|| general.get("servers"))
        .filter(|s| !s.is_empty());

    let mut servers = HashMap::new();
    for (section, props) in ini.iter() {
        let section = match section {
            None => {
                if props.iter().next().is_some() {
                    warn!("you should not have top-level settings in {}", path.display());
                }
                continue;
            }
            Some(GENERAL_SECTION) => continue,
            Some(section) => section,
        };

        if props.contains_key("disabled") {
            info!("skipping [{}] as disabled", section);
            continue;
        }

        // general-section values act as per-key defaults
        let mut merged: HashMap<&str, &str> = props.iter().collect();
        for (key, value) in general.iter() {
            merged.entry(key).or_insert(value);
        }

        let names = expand(section)
            .with_context(|| format!("server name pattern '{}' parse error [config]", section))?;
        for name in names {
            if let Some(force) = force {
                let matched = glob_any(force, &name).with_context(|| {
                    format!("server name pattern '{}' parse error [override]", force)
                })?;
                if !matched {
                    continue;
                }
            }
            let settings = parse_server_settings(&name, &merged, &global_excludes)
                .with_context(|| format!("bad [{}] section of {}", name, path.display()))?;
            servers.insert(name, settings);
        }
    }
    Ok((servers, global_excludes))
}

fn parse_server_settings(
    section: &str,
    props: &HashMap<&str, &str>,
    global_excludes: &HashSet<String>,
) -> Result<Settings> {
    let port = match props.get("port") {
        Some(raw) if !raw.is_empty() => raw
            .parse()
            .with_context(|| format!("cannot parse 'port' property {:?}", raw))?,
        _ => 0,
    };
    let send_queue_limit = match props.get("send-queue-size-limit") {
        Some(raw) if !raw.is_empty() => raw
            .parse()
            .with_context(|| format!("cannot parse 'send-queue-size-limit' property {:?}", raw))?,
        _ => 0,
    };

    let excludes = match props.get("exclude") {
        Some(raw) if !raw.is_empty() => parse_excludes(raw),
        _ => global_excludes.clone(),
    };

    let dir = props
        .get("dir")
        .filter(|d| !d.is_empty())
        .context("missing 'dir' property")?;

    Ok(Settings {
        host: props
            .get("host")
            .filter(|h| !h.is_empty())
            .unwrap_or(&section)
            .to_string(),
        port,
        username: non_empty(props.get("username")),
        sudo_user: non_empty(props.get("sudouser")),
        dir: dir.to_string(),
        os: non_empty(props.get("os")),
        remote_bin_path: non_empty(props.get("remote-bin-path")),
        excludes,
        compression: props.get("compression").copied() != Some("false"),
        batch_mode: props.get("batchmode").copied() != Some("false"),
        send_queue_limit,
    })
}

fn non_empty(value: Option<&&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(|v| v.to_string())
}

/// Pipe-separated exclude list.
pub fn parse_excludes(raw: &str) -> HashSet<String> {
    raw.split('|').map(str::to_string).collect()
}

/// ssh options shared by every invocation (connection probe, scp, the server
/// session). Keepalives are tuned so a dead transport is noticed within
/// seconds rather than TCP timeouts.
pub fn ssh_options(settings: &Settings) -> Vec<String> {
    let mut options = vec![
        "-o".to_string(),
        format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        format!("ServerAliveInterval={}", SERVER_ALIVE_INTERVAL),
        "-o".to_string(),
        format!("ServerAliveCountMax={}", SERVER_ALIVE_COUNT_MAX),
    ];
    if settings.batch_mode {
        options.push("-o".to_string());
        options.push("BatchMode=yes".to_string());
    }
    options.push("-o".to_string());
    options.push("StrictHostKeyChecking=no".to_string());
    options.push("-o".to_string());
    options.push("UserKnownHostsFile=/dev/null".to_string());
    if settings.port > 0 {
        options.push("-o".to_string());
        options.push(format!("Port={}", settings.port));
    }
    if let Some(user) = &settings.username {
        options.push("-o".to_string());
        options.push(format!("User={}", user));
    }
    if settings.compression {
        options.push("-o".to_string());
        options.push("Compression=yes".to_string());
    }
    options
}

// =============================================================================
// Host-pattern expansion
// =============================================================================

/// Expand `{n..m,a,b}` groups into the full list of names. Groups expand
/// recursively, so `db{1..2}-{a,b}` yields four names.
pub fn expand(pattern: &str) -> Result<Vec<String>> {
    let Some(start) = pattern.find('{') else {
        return expand_commas("", pattern, "");
    };
    let end = pattern
        .find('}')
        .with_context(|| format!("no terminating '}}' found in {}", pattern))?;
    if end < start + 2 {
        bail!("empty pattern between {{}} in {}", pattern);
    }

    let values = intervals_to_commas(&pattern[start + 1..end])?;
    let expanded = expand_commas(&pattern[..start], &values, &pattern[end + 1..])?;

    let mut res = Vec::new();
    for line in expanded {
        res.extend(expand(&line)?);
    }
    Ok(res)
}

fn intervals_to_commas(values: &str) -> Result<String> {
    let mut result = values.to_string();
    while let Some(next) = expand_interval(&result)? {
        result = next;
    }
    Ok(result)
}

// `n..m` => `n,n+1,...,m`, one interval at a time
fn expand_interval(pattern: &str) -> Result<Option<String>> {
    let Some(dots) = pattern.find("..") else {
        return Ok(None);
    };

    let head = &pattern[..dots];
    let digits_from = head
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    if digits_from == head.len() {
        bail!("no digits before '..'");
    }
    let start: i64 = head[digits_from..].parse()?;
    let before = &head[..digits_from];

    let tail = &pattern[dots + 2..];
    let digits_to = tail
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(tail.len());
    if digits_to == 0 {
        bail!("no digits after '..'");
    }
    if digits_to < tail.len() && tail.as_bytes()[digits_to] != b',' {
        bail!("found non-comma terminating character");
    }
    let end: i64 = tail[..digits_to].parse()?;
    let after = &tail[digits_to..];

    let (lo, hi) = if start > end { (end, start) } else { (start, end) };
    let nums: Vec<String> = (lo..=hi).map(|i| i.to_string()).collect();
    Ok(Some(format!("{}{}{}", before, nums.join(","), after)))
}

fn expand_commas(before: &str, list: &str, after: &str) -> Result<Vec<String>> {
    let mut res = Vec::new();
    for part in list.split(',') {
        if part.is_empty() {
            bail!("no character after comma");
        }
        res.push(format!("{}{}{}", before, part, after));
    }
    Ok(res)
}

/// True when `subject` matches any `*`-glob of the (expandable) `pattern`.
pub fn glob_any(pattern: &str, subject: &str) -> Result<bool> {
    Ok(expand(pattern)?
        .iter()
        .any(|p| glob_match(p, subject)))
}

fn glob_match(pattern: &str, subject: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == subject;
    }
    let mut rest = subject;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if !part.is_empty() {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}
