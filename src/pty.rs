use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Placeholder in [`AttachCommand::args`] replaced by the unit name.
pub const UNIT_PLACEHOLDER: &str = "{name}";

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("failed to kill child: {0}")]
    Kill(#[source] std::io::Error),
}

/// The process started inside the pty for each attached unit.
///
/// Every occurrence of `{name}` in `args` is replaced with the unit name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Value exported as `TERM` to the child.
    pub term: String,
}

impl Default for AttachCommand {
    fn default() -> Self {
        Self {
            program: "lxc-attach".to_string(),
            args: ["-n", UNIT_PLACEHOLDER, "--", "/bin/login"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            term: "xterm-256color".to_string(),
        }
    }
}

impl AttachCommand {
    /// Convenience for running an arbitrary program without unit substitution.
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Arguments with the unit name substituted in.
    pub fn args_for(&self, unit: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace(UNIT_PLACEHOLDER, unit))
            .collect()
    }

    pub fn build(&self, unit: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(self.args_for(unit));
        cmd.env("TERM", &self.term);
        cmd
    }
}

/// A pseudo-terminal with one child process attached to its slave side.
///
/// The slave handle is dropped right after spawning so that reads on the
/// master observe EOF/EIO once the child (and anything it forked onto the
/// terminal) is gone.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    /// Set by whoever reaps the child; its pid may be reused after that.
    reaped: Arc<AtomicBool>,
}

impl std::fmt::Debug for Pty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pty").field("pid", &self.pid).finish_non_exhaustive()
    }
}

impl Pty {
    /// Spawn the attach command for `unit` inside a fresh pty.
    pub fn spawn_for_unit(
        unit: &str,
        command: &AttachCommand,
        rows: u16,
        cols: u16,
    ) -> Result<Self, PtyError> {
        Self::spawn_with_cmd(rows, cols, command.build(unit))
    }

    pub fn spawn_with_cmd(rows: u16, cols: u16, cmd: CommandBuilder) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let PtyPair { master, slave } = pty_system
            .openpty(pty_size(rows, cols))
            .map_err(PtyError::OpenPty)?;

        let child = slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        drop(slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        Ok(Self {
            master,
            child: Some(child),
            killer,
            pid,
            reaped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Take ownership of the child handle so it can be waited on elsewhere.
    /// Returns `None` on the second call.
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    /// Flag to set once the child taken with [`Self::take_child`] has been
    /// waited on. After that [`Self::kill`] sends no signal.
    pub fn reaped_flag(&self) -> Arc<AtomicBool> {
        self.reaped.clone()
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(rows, cols))
            .map_err(PtyError::Resize)
    }

    /// Forcibly terminate the child. A child that already exited is not an error.
    ///
    /// portable_pty calls setsid() when spawning, so the child leads its own
    /// process group; SIGKILL goes to the whole group so that whatever the
    /// login shell started dies with it. Once the child is reaped its pid
    /// is no longer ours and nothing is signalled.
    pub fn kill(&mut self) -> Result<(), PtyError> {
        if self.reaped.load(Ordering::Acquire) {
            return Ok(());
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid.filter(|&p| p != 0 && p <= i32::MAX as u32) {
            let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(PtyError::Kill(err));
        }
        match self.killer.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(()),
            Err(e) => Err(PtyError::Kill(e)),
        }
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
