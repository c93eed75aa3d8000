//! Engine state types.
//!
//! Defines the state machine for the hub engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (cursor store open, services refreshed)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!                                   
//! Starting ──(cursor store / coordination unavailable)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `HubEngine::new()`. Nothing is open.
//! - **Starting**: `start()` called; opening cursors and connecting to coordination.
//! - **Running**: Replicators and group engines compete for leadership.
//! - **ShuttingDown**: `shutdown()` called. Leaders exit and cursors are flushed.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: Startup failed. Check logs; the engine cannot be restarted.

use crate::leadership::ConnectionState;
use serde::Serialize;

/// State of the hub engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::HubEngine::start) to begin.
    Created,

    /// Opening the cursor store and connecting to the coordination backend.
    Starting,

    /// Running. Replicators stream and groups deliver wherever this node leads.
    Running,

    /// Shutting down gracefully.
    ///
    /// Leaders are exiting and cursors are being persisted.
    ShuttingDown,

    /// Engine has shut down cleanly. Safe to drop.
    Stopped,

    /// Failed to start.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time health snapshot for monitoring endpoints.
///
/// Collected from cached state only; building one performs no network I/O.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,

    /// Coordination session health, `None` before `start()`.
    #[serde(serialize_with = "serialize_connection")]
    pub coordination: Option<ConnectionState>,

    /// Running and connected to coordination.
    pub ready: bool,

    /// Ready, and no replicator is stuck on a failed verification.
    pub healthy: bool,

    pub replicators_running: usize,
    pub replicators_invalid: usize,
    pub replicators_connected: usize,

    pub groups_running: usize,
    pub groups_leading: usize,

    /// Cursor updates not yet flushed to SQLite.
    pub cursors_dirty: usize,
}

fn serialize_connection<S: serde::Serializer>(
    state: &Option<ConnectionState>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match state {
        Some(state) => serializer.serialize_some(&state.to_string()),
        None => serializer.serialize_none(),
    }
}
