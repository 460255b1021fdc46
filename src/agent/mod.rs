//! The agent session.
//!
//! Drives the life cycle of one agent:
//!
//! ```text
//!  New ─► Registering ─► Authenticating ─► CheckingIn ⇄ AwaitingJob ⇄ ExecutingJob
//!              ▲                                │
//!              └──── auth / crypto failure ─────┘          any state ─► Terminated(cause)
//! ```
//!
//! Every network attempt is preceded by a kill-date check, failures are
//! counted until the retry budget runs out, and the sleep between cycles is
//! jittered by the configured skew.

mod jobs;
pub mod messages;
mod schedule;
mod session;

pub use crate::error::TerminationCause;
pub use jobs::{JobHandle, JobRunner, WorkerPool};
pub use messages::{AgentMessage, CheckInStatus, ConfigUpdate, Job, JobResult, JobStatus, ServerDirective};
pub use schedule::{Clock, ManualClock, RetrySchedule, SystemClock};
pub use session::{Agent, AgentConfig, AuthFailurePolicy};

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 128-bit agent identity, fixed for the agent's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Generate a fresh random (v4) identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuild an identity from its 16 bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16 identity bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The identity as a UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AgentId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({})", self.0)
    }
}

/// Where the session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Created, nothing sent yet
    New,
    /// OPAQUE registration in flight
    Registering,
    /// OPAQUE login in flight
    Authenticating,
    /// Check-in in flight
    CheckingIn,
    /// Authenticated and idle between check-ins
    AwaitingJob,
    /// Jobs dispatched and not yet reported
    ExecutingJob,
    /// Stopped for good
    Terminated(TerminationCause),
}

impl AgentState {
    /// Whether the agent has stopped.
    pub fn is_terminated(&self) -> bool {
        matches!(self, AgentState::Terminated(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id() {
        let a = AgentId::new();
        let b = AgentId::new();
        assert_ne!(a, b);
        assert_eq!(AgentId::from_bytes(*a.as_bytes()), a);
        assert_eq!(a.to_string().len(), 36);

        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, format!("\"{a}\""));
    }

    #[test]
    fn test_terminated_state() {
        assert!(AgentState::Terminated(TerminationCause::KillDate).is_terminated());
        assert!(!AgentState::AwaitingJob.is_terminated());
    }
}
