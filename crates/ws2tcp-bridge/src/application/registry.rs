//! Single-slot session admission.
//!
//! The bridge serves one WebSocket client at a time.  [`SessionRegistry`]
//! is the only place that decides whether a freshly upgraded connection may
//! become a session:
//!
//! ```text
//!            try_admit ─► Ok(SessionHandle)
//!   Empty ───────────────────────────────► Occupied
//!     ▲                                       │
//!     └──────── release(handle) / drop ◄──────┘
//!
//!   Occupied ── try_admit ─► Err(Rejected)   (state unchanged)
//! ```
//!
//! The slot is cleared exactly once per session: by [`SessionRegistry::release`]
//! or, if the handle is dropped without being released (a panicking session
//! task, for example), by the handle's `Drop`.  A handle only ever clears the
//! slot it filled, so a stale handle cannot evict a newer session.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Identifies one admitted session in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The first group of the UUID is plenty to tell sessions apart in logs.
        let full = self.0.simple().to_string();
        f.write_str(&full[..8])
    }
}

/// The session currently holding the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSession {
    pub id: SessionId,
    pub peer: SocketAddr,
}

/// Returned by [`SessionRegistry::try_admit`] while another session is active.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("a websocket session already exists (session {} from {})", .active.id, .active.peer)]
pub struct Rejected {
    pub active: ActiveSession,
}

/// Process-wide guard allowing at most one bridge session at a time.
///
/// Cloning is cheap and every clone refers to the same slot.
#[derive(Clone)]
pub struct SessionRegistry {
    slot: Arc<watch::Sender<Option<ActiveSession>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Claims the slot for a connection from `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`], describing the session that holds the slot, if
    /// it is already occupied.  The registry is left unchanged.
    pub fn try_admit(&self, peer: SocketAddr) -> Result<SessionHandle, Rejected> {
        let candidate = ActiveSession {
            id: SessionId::new(),
            peer,
        };
        let mut holder = None;

        // Check-and-set under the channel's lock so two accepts racing on a
        // multi-threaded runtime cannot both win.
        self.slot.send_if_modified(|slot| {
            if let Some(active) = *slot {
                holder = Some(active);
                false
            } else {
                *slot = Some(candidate);
                true
            }
        });

        match holder {
            Some(active) => Err(Rejected { active }),
            None => Ok(SessionHandle {
                session: candidate,
                registry: self.clone(),
            }),
        }
    }

    /// Frees the slot held by `handle`.
    pub fn release(&self, handle: SessionHandle) {
        drop(handle);
    }

    /// The session holding the slot, if any.
    pub fn active(&self) -> Option<ActiveSession> {
        *self.slot.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.active().is_none()
    }

    /// Resolves once the slot is empty (immediately if it already is).
    pub async fn wait_until_empty(&self) {
        let mut rx = self.slot.subscribe();
        // `wait_for` only fails when the sender is gone, and `self` owns it.
        let _ = rx.wait_for(Option::is_none).await;
    }

    fn clear(&self, id: SessionId) {
        self.slot.send_if_modified(|slot| {
            if slot.is_some_and(|active| active.id == id) {
                *slot = None;
                true
            } else {
                false
            }
        });
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.active())
            .finish()
    }
}

/// Proof of admission.  Holding it keeps the registry occupied.
#[derive(Debug)]
pub struct SessionHandle {
    session: ActiveSession,
    registry: SessionRegistry,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.session.peer
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.clear(self.session.id);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
