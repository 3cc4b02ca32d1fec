//! Everything the engine observes or changes on the host, behind traits so
//! the lifecycle controller can be exercised against a fake host.

use crate::error::{QleverError, Result};
use chrono::{DateTime, Local, TimeZone};
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid, SysconfVar, Uid, User};
use std::fs;
use std::io::{self, IsTerminal};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use walkdir::WalkDir;
use wax::{CandidatePath, Glob, Pattern};

const PING_MESSAGE: &str = "from%20the%20qlever%20script";
const PING_TIMEOUT: Duration = Duration::from_secs(1);
const API_TIMEOUT: Duration = Duration::from_secs(10);
/// Socket state column value for LISTEN in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// A running follower of a log file, stopped when no longer needed.
pub trait LogFollower {
    fn stop(&mut self);
}

/// Runs external commands.
pub trait Executor {
    /// Runs `script` with `bash -c`, inheriting stdio, and waits for it.
    fn run_script(&self, script: &str) -> io::Result<CommandOutput>;

    /// Runs a program with all output discarded. On timeout the child is
    /// killed and an `io::ErrorKind::TimedOut` error is returned.
    fn run_quiet(
        &self,
        program: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> io::Result<CommandOutput>;

    /// Starts printing new lines of `path` to the terminal.
    fn follow(&self, path: &Path) -> io::Result<Box<dyn LogFollower>>;
}

/// HTTP endpoints of a running server.
pub trait ServerApi {
    fn is_alive(&self, port: &str) -> bool;

    /// Sends one `field=value` pair to the management endpoint.
    fn set_description(
        &self,
        port: &str,
        field: &str,
        value: &str,
        access_token: Option<&str>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub user: Option<String>,
    pub start_time: Option<DateTime<Local>>,
    pub rss_bytes: u64,
    pub cmdline: String,
}

/// The host's process and connection tables.
pub trait ProcessTable {
    fn processes(&self) -> io::Result<Vec<ProcessInfo>>;
    fn kill(&self, pid: u32) -> io::Result<()>;
    /// Local ports of all listening TCP sockets.
    fn ports_in_use(&self) -> io::Result<Vec<u16>>;
}

/// Stops the wrapped follower when dropped, on every exit path.
pub struct FollowGuard {
    follower: Option<Box<dyn LogFollower>>,
}

impl FollowGuard {
    pub fn new(follower: Box<dyn LogFollower>) -> Self {
        Self {
            follower: Some(follower),
        }
    }

    pub fn none() -> Self {
        Self { follower: None }
    }
}

impl Drop for FollowGuard {
    fn drop(&mut self) {
        if let Some(mut follower) = self.follower.take() {
            follower.stop();
        }
    }
}

/// Invocation-wide facts used when rendering container command lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub uid: u32,
    pub gid: u32,
    pub cwd: PathBuf,
    pub interactive: bool,
}

impl HostInfo {
    pub fn detect(cwd: PathBuf) -> Self {
        Self {
            uid: unistd::getuid().as_raw(),
            gid: unistd::getgid().as_raw(),
            cwd,
            interactive: io::stdin().is_terminal(),
        }
    }
}

pub struct ShellExecutor {
    cwd: PathBuf,
}

impl ShellExecutor {
    pub fn new(cwd: PathBuf) -> Self {
        Self { cwd }
    }
}

fn status_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(if status.success() { 0 } else { 1 })
}

impl Executor for ShellExecutor {
    fn run_script(&self, script: &str) -> io::Result<CommandOutput> {
        let status = Command::new("bash")
            .arg("-c")
            .arg(script)
            .current_dir(&self.cwd)
            .status()?;
        Ok(CommandOutput {
            status_code: status_code(status),
        })
    }

    fn run_quiet(
        &self,
        program: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> io::Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let Some(timeout) = timeout else {
            let status = child.wait()?;
            return Ok(CommandOutput {
                status_code: status_code(status),
            });
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(CommandOutput {
                    status_code: status_code(status),
                });
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("`{program}` did not finish within {}ms", timeout.as_millis()),
                ));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn follow(&self, path: &Path) -> io::Result<Box<dyn LogFollower>> {
        // -F keeps retrying until the server has created the log file.
        let child = Command::new("tail")
            .arg("-F")
            .arg(path)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(TailFollower { child }))
    }
}

struct TailFollower {
    child: Child,
}

impl LogFollower for TailFollower {
    fn stop(&mut self) {
        if let Err(err) = self.child.kill() {
            tracing::debug!("tail already gone: {err}");
        }
        let _ = self.child.wait();
    }
}

pub struct HttpServerApi {
    client: reqwest::blocking::Client,
    host: String,
}

impl HttpServerApi {
    pub fn new() -> Result<Self> {
        // The server is always on localhost; a proxy would answer for it.
        let client = reqwest::blocking::Client::builder()
            .timeout(PING_TIMEOUT)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            host: "localhost".to_string(),
        })
    }
}

impl ServerApi for HttpServerApi {
    fn is_alive(&self, port: &str) -> bool {
        let url = format!("http://{}:{}/ping?msg={}", self.host, port, PING_MESSAGE);
        self.client.get(&url).send().is_ok()
    }

    fn set_description(
        &self,
        port: &str,
        field: &str,
        value: &str,
        access_token: Option<&str>,
    ) -> Result<()> {
        let url = format!("http://{}:{}/api", self.host, port);
        let mut query = vec![(field, value)];
        if let Some(token) = access_token {
            query.push(("access-token", token));
        }
        let response = self
            .client
            .get(&url)
            .query(&query)
            .timeout(API_TIMEOUT)
            .send()?;
        response.error_for_status()?;
        Ok(())
    }
}

/// Reads the process and connection tables from `/proc`.
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }

    fn boot_time(&self) -> Option<i64> {
        let stat = fs::read_to_string(self.root.join("stat")).ok()?;
        stat.lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|value| value.trim().parse().ok())
    }

    fn read_process(&self, dir: &Path, pid: u32, boot_time: Option<i64>) -> io::Result<ProcessInfo> {
        let raw = fs::read(dir.join("cmdline"))?;
        let cmdline = raw
            .split(|byte| *byte == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let stat = fs::read_to_string(dir.join("stat"))?;
        let statm = fs::read_to_string(dir.join("statm"))?;
        let uid = fs::metadata(dir)?.uid();
        let user = User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| user.name);
        let start_time = match (boot_time, start_ticks(&stat), clock_ticks()) {
            (Some(boot), Some(ticks), Some(hz)) => {
                Local.timestamp_opt(boot + (ticks / hz) as i64, 0).single()
            }
            _ => None,
        };
        let rss_pages = statm
            .split_whitespace()
            .nth(1)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(ProcessInfo {
            pid,
            user,
            start_time,
            rss_bytes: rss_pages * page_size(),
            cmdline,
        })
    }

    /// Local ports of the listening sockets in a `/proc/net/tcp*` table.
    fn socket_ports(path: &Path) -> io::Result<Vec<u16>> {
        let content = fs::read_to_string(path)?;
        Ok(content
            .lines()
            .skip(1)
            .filter_map(|line| {
                // sl local_address rem_address st ...
                let mut fields = line.split_whitespace();
                let local = fields.nth(1)?;
                let state = fields.nth(1)?;
                (state == TCP_LISTEN).then_some(local)
            })
            .filter_map(|local| local.rsplit_once(':'))
            .filter_map(|(_, port)| u16::from_str_radix(port, 16).ok())
            .collect())
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for ProcFs {
    fn processes(&self) -> io::Result<Vec<ProcessInfo>> {
        let boot_time = self.boot_time();
        let mut processes = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) else {
                continue;
            };
            // Processes may exit while we read them.
            match self.read_process(&entry.path(), pid, boot_time) {
                Ok(info) if !info.cmdline.is_empty() => processes.push(info),
                Ok(_) => {}
                Err(err) => tracing::debug!("Error getting process info for {pid}: {err}"),
            }
        }
        processes.sort_by_key(|info| info.pid);
        Ok(processes)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        signal::kill(Pid::from_raw(pid), Signal::SIGKILL)?;
        Ok(())
    }

    fn ports_in_use(&self) -> io::Result<Vec<u16>> {
        let mut ports = Self::socket_ports(&self.root.join("net/tcp"))?;
        if let Ok(v6) = Self::socket_ports(&self.root.join("net/tcp6")) {
            ports.extend(v6);
        }
        ports.sort_unstable();
        ports.dedup();
        Ok(ports)
    }
}

/// Field 22 of `/proc/<pid>/stat`, counted after the parenthesized name.
fn start_ticks(stat: &str) -> Option<u64> {
    let (_, after_name) = stat.rsplit_once(')')?;
    after_name.split_whitespace().nth(19)?.parse().ok()
}

fn clock_ticks() -> Option<u64> {
    unistd::sysconf(SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .and_then(|value| u64::try_from(value).ok())
        .filter(|value| *value > 0)
}

fn page_size() -> u64 {
    unistd::sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|value| u64::try_from(value).ok())
        .unwrap_or(4096)
}

/// Total size in bytes of all files matched by the whitespace-separated
/// glob patterns, resolved relative to `cwd`.
pub fn total_file_size(patterns: &str, cwd: &Path) -> Result<u64> {
    let mut total = 0;
    for pattern in patterns.split_whitespace() {
        for path in glob_files(pattern, cwd)? {
            total += fs::metadata(&path)?.len();
        }
    }
    Ok(total)
}

fn glob_files(pattern: &str, cwd: &Path) -> Result<Vec<PathBuf>> {
    // Split off the literal directory prefix; only the rest is matched.
    let components: Vec<&str> = pattern.split('/').collect();
    let literal = components
        .iter()
        .take_while(|part| !part.contains(['*', '?', '[', '{']))
        .count();
    if literal == components.len() {
        let path = cwd.join(pattern);
        return Ok(if path.is_file() { vec![path] } else { Vec::new() });
    }
    let prefix = components[..literal].join("/");
    let base = if pattern.starts_with('/') && prefix.is_empty() {
        PathBuf::from("/")
    } else {
        cwd.join(&prefix)
    };
    let rest = components[literal..].join("/");
    let glob = Glob::new(&rest).map_err(|err| QleverError::Glob(format!("{pattern}: {err}")))?;
    let max_depth = if rest.contains("**") {
        usize::MAX
    } else {
        components.len() - literal
    };
    let mut matches = Vec::new();
    if !base.is_dir() {
        return Ok(matches);
    }
    for entry in WalkDir::new(&base).min_depth(1).max_depth(max_depth) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&base) else {
            continue;
        };
        let candidate = relative.to_string_lossy();
        if glob.is_match(CandidatePath::from(&*candidate)) {
            matches.push(entry.path().to_path_buf());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Whether any `<name>.index.*` file exists in `dir`.
pub fn index_artifacts_exist(dir: &Path, name: &str) -> Result<bool> {
    let prefix = format!("{name}.index.");
    if !dir.is_dir() {
        return Ok(false);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            return Ok(true);
        }
    }
    Ok(false)
}
