//! Fan-out of pty output to viewers and fan-in of viewer input to the pty.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activity::ActivityTracker;

/// Per-viewer output backlog. A viewer that falls further behind than this
/// skips ahead (see `RecvError::Lagged`).
pub const BROADCAST_CAPACITY: usize = 256;

const INPUT_CHANNEL_CAPACITY: usize = 64;

const READ_BUF_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("session already has the maximum of {0} viewers")]
    Full(usize),
    #[error("session is closed")]
    Closed,
}

/// The viewer set of one session plus the two channels that connect it to
/// the pty.
///
/// Cloning is cheap; all clones share the same channels and viewer count.
#[derive(Clone)]
pub struct SessionHub {
    output_tx: broadcast::Sender<Bytes>,
    input_tx: mpsc::Sender<Bytes>,
    viewer_count: Arc<AtomicUsize>,
    max_viewers: usize,
    closed: CancellationToken,
    activity: ActivityTracker,
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("viewers", &self.viewers())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A joined viewer. Dropping it leaves the hub.
pub struct Viewer {
    pub id: Uuid,
    pub output: broadcast::Receiver<Bytes>,
    _guard: ViewerGuard,
}

struct ViewerGuard {
    id: Uuid,
    counter: Arc<AtomicUsize>,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
        tracing::debug!(viewer = %self.id, "viewer left");
    }
}

impl SessionHub {
    /// Create a hub and the receiving end of its input channel, which the
    /// pty writer drains.
    pub fn new(max_viewers: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (output_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        let hub = Self {
            output_tx,
            input_tx,
            viewer_count: Arc::new(AtomicUsize::new(0)),
            max_viewers,
            closed: CancellationToken::new(),
            activity: ActivityTracker::new(),
        };
        (hub, input_rx)
    }

    /// Deliver one chunk of pty output to every joined viewer.
    pub fn broadcast(&self, data: Bytes) {
        self.activity.touch();
        // No receivers just means nobody is watching.
        let _ = self.output_tx.send(data);
    }

    /// Forward bytes from a viewer to the pty. Each message is written whole;
    /// messages from different viewers are not otherwise ordered.
    pub async fn on_viewer_message(&self, data: Bytes) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        self.activity.touch();
        self.input_tx.send(data).await.map_err(|_| HubError::Closed)
    }

    /// Admit a new viewer. Output produced before this call is not replayed.
    ///
    /// Uses a compare-exchange loop so concurrent joins cannot overshoot
    /// `max_viewers`.
    pub fn join(&self) -> Result<Viewer, HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        loop {
            let current = self.viewer_count.load(Ordering::Acquire);
            if current >= self.max_viewers {
                return Err(HubError::Full(self.max_viewers));
            }
            if self
                .viewer_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        let id = Uuid::new_v4();
        tracing::debug!(viewer = %id, "viewer joined");
        Ok(Viewer {
            id,
            output: self.output_tx.subscribe(),
            _guard: ViewerGuard {
                id,
                counter: Arc::clone(&self.viewer_count),
            },
        })
    }

    /// Explicitly leave; equivalent to dropping the viewer.
    pub fn leave(&self, viewer: Viewer) {
        drop(viewer);
    }

    pub fn viewers(&self) -> usize {
        self.viewer_count.load(Ordering::Acquire)
    }

    /// Mark the hub closed. Viewer loops watching [`Self::closed`] disconnect
    /// and further joins/messages are refused.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the hub is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }
}

/// Drain the pty into the hub on a blocking thread.
///
/// The returned receiver fires once the read side fails or hits EOF, i.e.
/// the process exited or the pty was closed.
pub fn spawn_pty_reader(reader: Box<dyn Read + Send>, hub: SessionHub) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut reader = reader;
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => hub.broadcast(Bytes::copy_from_slice(&buf[..n])),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "pty read ended");
                        break;
                    }
                }
            }
        }));
        if let Err(e) = result {
            tracing::error!("pty reader task panicked: {:?}", e);
        }
        let _ = done_tx.send(());
    });
    done_rx
}

/// Write viewer input into the pty on a blocking thread, one message at a time.
///
/// Exits when every sender is gone or a write fails.
pub fn spawn_pty_writer(writer: Box<dyn Write + Send>, input_rx: mpsc::Receiver<Bytes>) {
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut writer = writer;
            let mut rx = input_rx;
            while let Some(data) = rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        }));
        if let Err(e) = result {
            tracing::error!("pty writer task panicked: {:?}", e);
        }
    });
}
