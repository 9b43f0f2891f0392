//! Unit name → session map and the attach/detach state machine.
//!
//! Per unit: Detached (no entry) → Attaching (port reserved, entry not yet
//! visible) → Attached → Detaching (entry removed, port still bound) →
//! Detached. The unit map and the port pool sit behind one mutex, held only
//! for in-memory updates, never across a spawn, bind or reap.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;

use crate::hub::SessionHub;
use crate::port_pool::{PoolError, PortPool};
use crate::reaper::Reaper;
use crate::session::{OpenError, Session, SessionOptions};

/// Validate a unit name. Names must be 1-64 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_unit_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("unit name must not be empty".into());
    }
    if name.len() > 64 {
        return Err(format!("unit name too long ({} chars, max 64)", name.len()));
    }
    if name.starts_with('-') {
        return Err(format!("unit name must not start with '-': {name}"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!("unit name contains invalid characters: {name}"));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("invalid unit name: {0}")]
    InvalidName(String),
    #[error("unit is already attached: {0}")]
    AlreadyAttached(String),
    #[error(transparent)]
    Exhausted(#[from] PoolError),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("session registry is shutting down")]
    ShuttingDown,
    #[error("attach task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DetachError {
    #[error("unit is not attached: {0}")]
    NotFound(String),
}

/// Returned by a successful attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachInfo {
    pub container_name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub container_name: String,
    pub port: u16,
    pub viewers: usize,
    pub pid: Option<u32>,
}

/// Why a session went away without an explicit detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    PtyClosed,
    Idle,
}

enum Slot {
    Attaching { id: u64, port: u16 },
    Attached(Session),
}

impl Slot {
    fn port(&self) -> u16 {
        match self {
            Slot::Attaching { port, .. } => *port,
            Slot::Attached(session) => session.port,
        }
    }
}

struct RegistryInner {
    units: HashMap<String, Slot>,
    pool: PortPool,
    next_id: u64,
    closed: bool,
}

struct Shared {
    inner: parking_lot::Mutex<RegistryInner>,
    options: SessionOptions,
    reaper: Reaper,
}

/// Owns every live session. Cloning shares the same registry.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("SessionRegistry")
            .field("units", &inner.units.len())
            .field("bound_ports", &inner.pool.bound_count())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(options: SessionOptions, ports: RangeInclusive<u16>, reaper: Reaper) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: parking_lot::Mutex::new(RegistryInner {
                    units: HashMap::new(),
                    pool: PortPool::new(ports),
                    next_id: 0,
                    closed: false,
                }),
                options,
                reaper,
            }),
        }
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.shared.inner.lock().pool.range()
    }

    /// Start an interactive session for `unit`.
    ///
    /// Fails with [`AttachError::AlreadyAttached`] while another attach for
    /// the same unit is in progress or complete. Any port reserved for a
    /// failed attempt is released before returning.
    ///
    /// The work runs on its own task, so a caller that stops waiting does
    /// not strand a reservation: the attach still either publishes the
    /// session or releases its port.
    pub async fn attach(&self, unit: &str) -> Result<AttachInfo, AttachError> {
        validate_unit_name(unit).map_err(AttachError::InvalidName)?;
        let registry = self.clone();
        let unit = unit.to_string();
        tokio::spawn(async move { registry.attach_reserved(unit).await }).await?
    }

    async fn attach_reserved(&self, unit: String) -> Result<AttachInfo, AttachError> {
        let reservation = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(AttachError::ShuttingDown);
            }
            if inner.units.contains_key(&unit) {
                return Err(AttachError::AlreadyAttached(unit));
            }
            let port = inner.pool.allocate()?;
            let id = inner.next_id;
            inner.next_id += 1;
            inner
                .units
                .insert(unit.clone(), Slot::Attaching { id, port });
            Reservation {
                registry: self,
                unit: &unit,
                id,
                port,
                committed: false,
            }
        };
        let (id, port) = (reservation.id, reservation.port);

        let (session, pty_done) = match Session::open(&unit, port, id, &self.shared.options).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(unit = %unit, port, error = %e, "attach failed");
                return Err(e.into());
            }
        };
        let hub = session.hub.clone();

        let rejected = {
            let mut inner = self.shared.inner.lock();
            let reserved =
                matches!(inner.units.get(&unit), Some(Slot::Attaching { id: i, .. }) if *i == id);
            if reserved {
                inner.units.insert(unit.clone(), Slot::Attached(session));
                None
            } else {
                // Drained while we were spawning.
                Some(session)
            }
        };
        // From here the port belongs to the session or to its teardown.
        reservation.commit();
        if let Some(session) = rejected {
            self.teardown(session).await;
            return Err(AttachError::ShuttingDown);
        }

        self.watch_session(unit.clone(), id, hub, pty_done);
        tracing::info!(unit = %unit, port, "attached");
        Ok(AttachInfo {
            container_name: unit,
            port,
        })
    }

    /// End the session for `unit`.
    ///
    /// The entry disappears before any teardown starts, so concurrent
    /// [`Self::is_attached`] calls see the unit as detached immediately.
    /// Returns once the port is free for reuse. Teardown runs on its own
    /// task and completes even if the caller stops waiting.
    pub async fn detach(&self, unit: &str) -> Result<(), DetachError> {
        let session = {
            let mut inner = self.shared.inner.lock();
            match inner.units.remove(unit) {
                Some(Slot::Attached(session)) => session,
                Some(attaching) => {
                    inner.units.insert(unit.to_string(), attaching);
                    return Err(DetachError::NotFound(unit.to_string()));
                }
                None => return Err(DetachError::NotFound(unit.to_string())),
            }
        };
        let registry = self.clone();
        if let Err(e) = tokio::spawn(async move { registry.teardown(session).await }).await {
            tracing::warn!(unit = %unit, error = %e, "teardown task failed");
        }
        tracing::info!(unit = %unit, "detached");
        Ok(())
    }

    /// Whether `unit` currently has a fully attached session.
    pub fn is_attached(&self, unit: &str) -> bool {
        matches!(
            self.shared.inner.lock().units.get(unit),
            Some(Slot::Attached(_))
        )
    }

    pub fn get(&self, unit: &str) -> Option<AttachInfo> {
        match self.shared.inner.lock().units.get(unit) {
            Some(Slot::Attached(session)) => Some(AttachInfo {
                container_name: session.unit.clone(),
                port: session.port,
            }),
            _ => None,
        }
    }

    /// Attached sessions, sorted by unit name.
    pub fn list(&self) -> Vec<SessionSummary> {
        let inner = self.shared.inner.lock();
        let mut out: Vec<SessionSummary> = inner
            .units
            .values()
            .filter_map(|slot| match slot {
                Slot::Attached(s) => Some(SessionSummary {
                    container_name: s.unit.clone(),
                    port: s.port,
                    viewers: s.hub.viewers(),
                    pid: s.pid(),
                }),
                Slot::Attaching { .. } => None,
            })
            .collect();
        out.sort_by(|a, b| a.container_name.cmp(&b.container_name));
        out
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ports currently bound, including ports of sessions that
    /// are still attaching or detaching.
    pub fn bound_ports(&self) -> usize {
        self.shared.inner.lock().pool.bound_count()
    }

    /// Detach every session and refuse further attaches.
    ///
    /// Called on service shutdown. Attaches still in flight notice the
    /// missing reservation when they finish and clean up after themselves.
    pub async fn drain(&self) {
        let sessions: Vec<Session> = {
            let mut inner = self.shared.inner.lock();
            inner.closed = true;
            inner
                .units
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Attached(session) => Some(session),
                    // Its port is released by the attach that reserved it.
                    Slot::Attaching { .. } => None,
                })
                .collect()
        };
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "draining sessions");
        futures::future::join_all(sessions.into_iter().map(|s| self.teardown(s))).await;
    }

    /// Close the session, reap its port and return the port to the pool.
    async fn teardown(&self, session: Session) {
        let port = session.port;
        session.close().await;

        let shared = self.shared.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || shared.reaper.kill_port_owner(port)).await
        {
            tracing::warn!(port, error = %e, "reaper task failed");
        }

        self.release_port(port).await;
    }

    /// Free `port` and drop any registry entry still pointing at it.
    async fn release_port(&self, port: u16) {
        let stale: Vec<Session> = {
            let mut inner = self.shared.inner.lock();
            inner.pool.release(port);
            let names: Vec<String> = inner
                .units
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Attached(_)) && slot.port() == port)
                .map(|(name, _)| name.clone())
                .collect();
            names
                .iter()
                .filter_map(|name| match inner.units.remove(name) {
                    Some(Slot::Attached(session)) => Some(session),
                    _ => None,
                })
                .collect()
        };
        for session in stale {
            tracing::warn!(unit = %session.unit, port, "removing stale binding for released port");
            session.close().await;
        }
    }

    /// Detach implicitly when the pty goes away or the session sits idle.
    fn watch_session(
        &self,
        unit: String,
        id: u64,
        hub: SessionHub,
        pty_done: tokio::sync::oneshot::Receiver<()>,
    ) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let idle_timeout = self.shared.options.idle_timeout;
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = pty_done => EndReason::PtyClosed,
                _ = idle_expiry(&hub, idle_timeout) => EndReason::Idle,
                // Explicit detach or drain got there first.
                _ = hub.closed() => return,
            };
            if let Some(shared) = weak.upgrade() {
                SessionRegistry { shared }.finish(&unit, id, reason).await;
            }
        });
    }

    async fn finish(&self, unit: &str, id: u64, reason: EndReason) {
        let session = {
            let mut inner = self.shared.inner.lock();
            match inner.units.remove(unit) {
                Some(Slot::Attached(session)) if session.id == id => session,
                // A newer session for the same unit, or one still attaching.
                Some(other) => {
                    inner.units.insert(unit.to_string(), other);
                    return;
                }
                None => return,
            }
        };
        match reason {
            EndReason::PtyClosed => tracing::info!(unit = %unit, "attach process ended, detaching"),
            EndReason::Idle => tracing::info!(unit = %unit, "session idle, detaching"),
        }
        self.teardown(session).await;
    }
}

/// Resolves once the hub has had no viewers and no traffic for `timeout`.
/// Never resolves when `timeout` is `None`.
async fn idle_expiry(hub: &SessionHub, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    loop {
        hub.activity().wait_for_idle(timeout).await;
        if hub.viewers() == 0 {
            return;
        }
        // Someone is watching a quiet terminal; check again later.
        tokio::time::sleep(timeout).await;
    }
}

/// A port and `Attaching` slot held by an attach in progress. Dropped
/// without [`Reservation::commit`], it removes the slot and frees the port.
struct Reservation<'a> {
    registry: &'a SessionRegistry,
    unit: &'a str,
    id: u64,
    port: u16,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut inner = self.registry.shared.inner.lock();
        if matches!(inner.units.get(self.unit), Some(Slot::Attaching { id, .. }) if *id == self.id)
        {
            inner.units.remove(self.unit);
        }
        inner.pool.release(self.port);
    }
}
