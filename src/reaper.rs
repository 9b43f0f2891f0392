//! Best-effort cleanup of whatever process still holds a session port.
//!
//! After a session listener is stopped, the port should be free. Anything
//! still bound to it (an orphaned child that inherited the socket, a stray
//! server) is killed so the port can be handed out again. Failures here are
//! logged and swallowed: the port is released regardless.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ReapError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to run {0}: {1}")]
    Command(String, #[source] std::io::Error),
    #[error("failed to signal pid {0}: {1}")]
    Signal(u32, #[source] std::io::Error),
}

/// How the reaper discovers port owners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaperStrategy {
    /// Walk `/proc/net/tcp{,6}` and `/proc/<pid>/fd` (Linux).
    #[default]
    Proc,
    /// Shell out to `lsof -t -i TCP:<port>`.
    Lsof,
    /// Never kill anything.
    Disabled,
}

/// Answers "which processes hold sockets on this local port".
pub trait PortOwnerProbe: Send + Sync {
    fn owners(&self, port: u16) -> Result<Vec<u32>, ReapError>;
}

/// Socket-to-process lookup through procfs.
#[derive(Debug, Clone)]
pub struct ProcNetProbe {
    root: PathBuf,
}

impl Default for ProcNetProbe {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcNetProbe {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn socket_inodes(&self, port: u16) -> Result<BTreeSet<u64>, ReapError> {
        let mut inodes = BTreeSet::new();
        let mut read_any = false;
        for table in ["net/tcp", "net/tcp6"] {
            let path = self.root.join(table);
            match std::fs::read_to_string(&path) {
                Ok(contents) => {
                    read_any = true;
                    inodes.extend(socket_inodes_for_port(&contents, port));
                }
                // tcp6 is absent when IPv6 is disabled.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ReapError::Read(path, e)),
            }
        }
        if !read_any {
            let path = self.root.join("net/tcp");
            return Err(ReapError::Read(
                path,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        Ok(inodes)
    }
}

impl PortOwnerProbe for ProcNetProbe {
    fn owners(&self, port: u16) -> Result<Vec<u32>, ReapError> {
        let inodes = self.socket_inodes(port)?;
        if inodes.is_empty() {
            return Ok(Vec::new());
        }

        let entries =
            std::fs::read_dir(&self.root).map_err(|e| ReapError::Read(self.root.clone(), e))?;
        let mut pids = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes we may not inspect (other users, already exited) are skipped.
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let holds_socket = fds.flatten().any(|fd| {
                std::fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| parse_socket_link(&target))
                    .is_some_and(|inode| inodes.contains(&inode))
            });
            if holds_socket {
                pids.push(pid);
            }
        }
        Ok(pids)
    }
}

/// Inodes of sockets in a `/proc/net/tcp`-format table whose local port is `port`.
pub fn socket_inodes_for_port(table: &str, port: u16) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            if u16::from_str_radix(port_hex, 16).ok()? != port {
                return None;
            }
            // TIME_WAIT and similar kernel-only entries have inode 0.
            fields[9].parse::<u64>().ok().filter(|&inode| inode != 0)
        })
        .collect()
}

fn parse_socket_link(target: &Path) -> Option<u64> {
    target
        .to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Port owner lookup via `lsof`, for hosts without procfs.
#[derive(Debug, Clone)]
pub struct LsofProbe {
    program: String,
}

impl Default for LsofProbe {
    fn default() -> Self {
        Self {
            program: "lsof".to_string(),
        }
    }
}

impl PortOwnerProbe for LsofProbe {
    fn owners(&self, port: u16) -> Result<Vec<u32>, ReapError> {
        // `-i TCP:port` matches either end of a connection; the local end
        // is checked in `parse_lsof_fields`.
        let output = std::process::Command::new(&self.program)
            .args(["-n", "-P", "-i", &format!("TCP:{port}"), "-F", "pn"])
            .output()
            .map_err(|e| ReapError::Command(self.program.clone(), e))?;
        // lsof exits 1 with empty output when nothing matches.
        Ok(parse_lsof_fields(&String::from_utf8_lossy(&output.stdout), port))
    }
}

/// Pids from `lsof -F pn` output that hold a socket whose local address is
/// on `port`. Processes that only reach `port` as a remote peer are skipped.
fn parse_lsof_fields(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids = Vec::new();
    let mut current: Option<u32> = None;
    for line in output.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            current = pid.trim().parse().ok();
        } else if let Some(name) = line.strip_prefix('n') {
            let local = name.split("->").next().unwrap_or(name);
            if let Some(pid) = current {
                if local.ends_with(&suffix) && !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
    }
    pids
}

pub struct Reaper {
    probe: Option<Box<dyn PortOwnerProbe>>,
    self_pid: u32,
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("enabled", &self.probe.is_some())
            .finish()
    }
}

impl Reaper {
    pub fn new(probe: Box<dyn PortOwnerProbe>) -> Self {
        Self {
            probe: Some(probe),
            self_pid: std::process::id(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            probe: None,
            self_pid: std::process::id(),
        }
    }

    pub fn from_strategy(strategy: ReaperStrategy) -> Self {
        match strategy {
            ReaperStrategy::Proc => Self::new(Box::new(ProcNetProbe::default())),
            ReaperStrategy::Lsof => Self::new(Box::new(LsofProbe::default())),
            ReaperStrategy::Disabled => Self::disabled(),
        }
    }

    /// SIGKILL every process holding a socket on `port`, except this one.
    ///
    /// Blocking; returns the pids that were signalled. Never fails: lookup
    /// and signal errors are logged.
    pub fn kill_port_owner(&self, port: u16) -> Vec<u32> {
        let Some(probe) = &self.probe else {
            return Vec::new();
        };
        let owners = match probe.owners(port) {
            Ok(owners) => owners,
            Err(e) => {
                tracing::warn!(port, error = %e, "could not determine port owner");
                return Vec::new();
            }
        };
        if owners.is_empty() {
            tracing::debug!(port, "no process holds port");
            return Vec::new();
        }

        let mut killed = Vec::new();
        for pid in owners {
            if pid == self.self_pid {
                // Our own listener is stopped by the session; never kill ourselves.
                tracing::debug!(port, pid, "port still held by this process, skipping");
                continue;
            }
            match kill_pid(pid) {
                Ok(()) => {
                    tracing::info!(port, pid, "killed process holding port");
                    killed.push(pid);
                }
                Err(e) => tracing::warn!(port, pid, error = %e, "failed to kill port owner"),
            }
        }
        killed
    }
}

fn kill_pid(pid: u32) -> Result<(), ReapError> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(ReapError::Signal(
            pid,
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        ));
    }
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        if rc != 0 {
            return Err(ReapError::Signal(pid, std::io::Error::last_os_error()));
        }
    }
    Ok(())
}
