// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coordination service abstraction.
//!
//! Leadership is built on two primitives of a shared coordination backend:
//!
//! - **Leases**: an exclusive, expiring claim on a path (`try_acquire`,
//!   `renew`, `release`). At most one owner holds a path at a time.
//! - **Participants**: the set of contenders queued on a path. A path with
//!   no participants has been abandoned and can be reclaimed.
//!
//! The backend also reports its session health as a [`ConnectionState`]
//! stream. A session that is not `Connected` cannot vouch for any lease,
//! so every leadership term ends on `Suspended` or `Lost`.

use crate::error::{BoxFuture, HubError};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// Health of the coordination session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Backend unreachable; leases may still be valid but cannot be trusted.
    Suspended,
    /// Session expired; every lease this node held is gone.
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Suspended => write!(f, "Suspended"),
            Self::Lost => write!(f, "Lost"),
        }
    }
}

/// Shared coordination backend.
pub trait CoordinationService: Send + Sync + 'static {
    /// Session health. The receiver always holds the latest state.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Claim `path` for `owner` if nobody holds it. Returns `true` on success.
    fn try_acquire(&self, path: &str, owner: &str, ttl: Duration) -> BoxFuture<'_, bool>;

    /// Extend `owner`'s claim. Returns `false` if `owner` no longer holds it.
    fn renew(&self, path: &str, owner: &str, ttl: Duration) -> BoxFuture<'_, bool>;

    /// Drop `owner`'s claim. No-op if someone else holds the path.
    fn release(&self, path: &str, owner: &str) -> BoxFuture<'_, ()>;

    /// Add (or refresh) `participant` in the contender set of `path`.
    fn register_participant(&self, path: &str, participant: &str, ttl: Duration)
        -> BoxFuture<'_, ()>;

    fn unregister_participant(&self, path: &str, participant: &str) -> BoxFuture<'_, ()>;

    /// Live contenders on `path`.
    fn participants(&self, path: &str) -> BoxFuture<'_, Vec<String>>;

    /// Remove the lease and contender set of `path`.
    fn delete_path(&self, path: &str) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Process-local [`CoordinationService`].
///
/// Exclusive within one process; used for single-node deployments and tests.
/// [`set_connection_state`](Self::set_connection_state) simulates session
/// trouble: `Lost` drops every lease.
pub struct InMemoryCoordination {
    leases: DashMap<String, Lease>,
    participants: DashMap<String, BTreeSet<String>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            leases: DashMap::new(),
            participants: DashMap::new(),
            state_tx,
        }
    }

    /// Force a session state transition.
    pub fn set_connection_state(&self, state: ConnectionState) {
        if state == ConnectionState::Lost {
            self.leases.clear();
        }
        info!(state = %state, "Coordination session state changed");
        self.state_tx.send_replace(state);
    }

    /// Current holder of `path`, if the lease is live.
    pub fn holder(&self, path: &str) -> Option<String> {
        self.leases
            .get(path)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.owner.clone())
    }

    /// Drop the lease on `path` regardless of owner (simulates expiry).
    pub fn expire(&self, path: &str) {
        if self.leases.remove(path).is_some() {
            warn!(path = %path, "Lease force-expired");
        }
    }

    fn ensure_connected(&self, operation: &str) -> crate::error::Result<()> {
        let state = *self.state_tx.borrow();
        if state != ConnectionState::Connected {
            return Err(HubError::coordination_msg(
                operation,
                format!("session {}", state),
            ));
        }
        Ok(())
    }
}

impl CoordinationService for InMemoryCoordination {
    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn try_acquire(&self, path: &str, owner: &str, ttl: Duration) -> BoxFuture<'_, bool> {
        let path = path.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            self.ensure_connected("acquire")?;
            let now = Instant::now();
            let mut entry = self.leases.entry(path).or_insert_with(|| Lease {
                owner: owner.clone(),
                expires_at: now,
            });
            if entry.owner == owner || entry.expires_at <= now {
                entry.owner = owner;
                entry.expires_at = now + ttl;
                return Ok(true);
            }
            Ok(false)
        })
    }

    fn renew(&self, path: &str, owner: &str, ttl: Duration) -> BoxFuture<'_, bool> {
        let path = path.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            self.ensure_connected("renew")?;
            let now = Instant::now();
            match self.leases.get_mut(&path) {
                Some(mut lease) if lease.owner == owner && lease.expires_at > now => {
                    lease.expires_at = now + ttl;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release(&self, path: &str, owner: &str) -> BoxFuture<'_, ()> {
        self.leases.remove_if(path, |_, lease| lease.owner == owner);
        Box::pin(async { Ok(()) })
    }

    fn register_participant(
        &self,
        path: &str,
        participant: &str,
        _ttl: Duration,
    ) -> BoxFuture<'_, ()> {
        self.participants
            .entry(path.to_string())
            .or_default()
            .insert(participant.to_string());
        Box::pin(async { Ok(()) })
    }

    fn unregister_participant(&self, path: &str, participant: &str) -> BoxFuture<'_, ()> {
        if let Some(mut set) = self.participants.get_mut(path) {
            set.remove(participant);
        }
        self.participants.remove_if(path, |_, set| set.is_empty());
        Box::pin(async { Ok(()) })
    }

    fn participants(&self, path: &str) -> BoxFuture<'_, Vec<String>> {
        let list = self
            .participants
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        Box::pin(async move { Ok(list) })
    }

    fn delete_path(&self, path: &str) -> BoxFuture<'_, ()> {
        self.leases.remove(path);
        self.participants.remove(path);
        Box::pin(async { Ok(()) })
    }
}
