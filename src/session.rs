use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::hub::{spawn_pty_reader, spawn_pty_writer, SessionHub};
use crate::listener::{self, ListenerError, ListenerHandle};
use crate::pty::{AttachCommand, Pty, PtyError};

/// Everything needed to open a session besides the unit name and port.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub command: AttachCommand,
    /// Address the per-session listener binds on.
    pub listen_host: IpAddr,
    pub rows: u16,
    pub cols: u16,
    pub max_viewers: usize,
    /// Tear down sessions with no viewers and no pty traffic for this long.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            command: AttachCommand::default(),
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rows: 24,
            cols: 80,
            max_viewers: 64,
            idle_timeout: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("failed to spawn pty: {0}")]
    Spawn(#[from] PtyError),
    #[error("failed to start session listener: {0}")]
    Listener(#[from] ListenerError),
    #[error("pty spawn task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The live binding of one unit to one port, one pty process and one hub.
///
/// Owned by the registry entry for its unit; torn down with [`Session::close`].
pub struct Session {
    pub unit: String,
    pub port: u16,
    /// Distinguishes successive sessions of the same unit.
    pub id: u64,
    pub hub: SessionHub,
    pid: Option<u32>,
    pty: Arc<parking_lot::Mutex<Pty>>,
    listener: ListenerHandle,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("unit", &self.unit)
            .field("port", &self.port)
            .field("id", &self.id)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the pty for `unit`, start its listener on `port` and wire both
    /// to a fresh hub.
    ///
    /// Returns the session and a receiver that fires when the pty reader
    /// stops (process exit or pty closed). On error nothing is left running.
    pub async fn open(
        unit: &str,
        port: u16,
        id: u64,
        options: &SessionOptions,
    ) -> Result<(Self, oneshot::Receiver<()>), OpenError> {
        let (rows, cols) = (options.rows, options.cols);
        let command = options.command.clone();
        let spawn_unit = unit.to_string();
        let mut pty = tokio::task::spawn_blocking(move || {
            Pty::spawn_for_unit(&spawn_unit, &command, rows, cols)
        })
        .await??;

        let io = pty.take_reader().and_then(|r| Ok((r, pty.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                kill_quietly(&mut pty, unit);
                return Err(e.into());
            }
        };
        let child = pty.take_child();
        let reaped = pty.reaped_flag();
        let pid = pty.pid();
        let pty = Arc::new(parking_lot::Mutex::new(pty));

        let (hub, input_rx) = SessionHub::new(options.max_viewers);
        let listener =
            match listener::start(options.listen_host, port, hub.clone(), pty.clone()).await {
                Ok(listener) => listener,
                Err(e) => {
                    kill_quietly(&mut pty.lock(), unit);
                    return Err(e.into());
                }
            };

        spawn_pty_writer(writer, input_rx);
        let pty_done = spawn_pty_reader(reader, hub.clone());

        // Reap the child so it does not linger as a zombie.
        if let Some(mut child) = child {
            let unit = unit.to_string();
            tokio::task::spawn_blocking(move || {
                let result = child.wait();
                reaped.store(true, Ordering::Release);
                match result {
                    Ok(status) => tracing::debug!(unit = %unit, ?status, "attach process exited"),
                    Err(e) => {
                        tracing::error!(unit = %unit, error = %e, "error waiting for attach process")
                    }
                }
            });
        }

        tracing::info!(unit = %unit, port, ?pid, "session opened");
        Ok((
            Self {
                unit: unit.to_string(),
                port,
                id,
                hub,
                pid,
                pty,
                listener,
            },
            pty_done,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Disconnect all viewers, stop the listener and kill the pty process.
    ///
    /// Returns once the listening socket is closed. Does not touch the port
    /// pool.
    pub async fn close(self) {
        self.hub.close();
        listener::stop(self.listener).await;
        kill_quietly(&mut self.pty.lock(), &self.unit);
        tracing::info!(unit = %self.unit, port = self.port, "session closed");
    }
}

fn kill_quietly(pty: &mut Pty, unit: &str) {
    if let Err(e) = pty.kill() {
        tracing::warn!(unit = %unit, error = %e, "failed to kill attach process");
    }
}
