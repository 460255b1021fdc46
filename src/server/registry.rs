//! Per-agent server state, held in RAM only.
//!
//! Session keys live here between requests, next to the directive queue and
//! the job results each agent reported. Sessions expire after a period of
//! inactivity; queued directives and results survive re-authentication.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::agent::{AgentId, JobResult, ServerDirective};
use crate::envelope::{Codec, PaddingStrategy, ReplayGuard};
use crate::pake::SessionKey;

/// An authenticated agent session.
pub struct AgentSession {
    id: AgentId,
    key: SessionKey,
    codec: Codec,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    messages: AtomicU64,
}

impl AgentSession {
    fn new(id: AgentId, key: SessionKey, padding: PaddingStrategy) -> Self {
        let now = Instant::now();
        Self {
            id,
            key,
            codec: Codec::new(id, padding, Some(ReplayGuard::default())),
            created_at: now,
            last_activity: Mutex::new(now),
            messages: AtomicU64::new(0),
        }
    }

    /// Agent identity.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Session key (server role).
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Codec bound to this agent.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Note a message from the agent.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages opened in this session.
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Time since the session was established.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the session has been idle for longer than `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.lock().elapsed() > timeout
    }
}

/// All agents known to one server.
pub struct AgentRegistry {
    sessions: RwLock<HashMap<AgentId, Arc<AgentSession>>>,
    directives: Mutex<HashMap<AgentId, VecDeque<ServerDirective>>>,
    results: Mutex<HashMap<AgentId, Vec<JobResult>>>,
    metadata: Mutex<HashMap<AgentId, Vec<u8>>>,
    max_sessions: usize,
    session_timeout: Duration,
}

impl AgentRegistry {
    /// Create a registry.
    pub fn new(max_sessions: usize, session_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            directives: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            max_sessions,
            session_timeout,
        }
    }

    /// Install a fresh session key for `id`, replacing any previous one.
    ///
    /// At capacity, idle sessions go first; if none are idle the least
    /// recently active session is evicted.
    pub fn install(&self, id: AgentId, key: SessionKey, padding: PaddingStrategy) -> Arc<AgentSession> {
        let session = Arc::new(AgentSession::new(id, key, padding));

        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions && !sessions.contains_key(&id) {
            let timeout = self.session_timeout;
            sessions.retain(|_, s| !s.is_expired(timeout));

            while sessions.len() >= self.max_sessions {
                let Some(oldest) = sessions
                    .iter()
                    .min_by_key(|(_, s)| *s.last_activity.lock())
                    .map(|(id, _)| *id)
                else {
                    break;
                };
                sessions.remove(&oldest);
                warn!(evicted = %oldest, "session table full, evicting least recently active");
            }
        }
        sessions.insert(id, Arc::clone(&session));

        session
    }

    /// Session for `id`, if one is live.
    pub fn get(&self, id: &AgentId) -> Option<Arc<AgentSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Drop the session for `id`.
    pub fn remove(&self, id: &AgentId) {
        self.sessions.write().remove(id);
    }

    /// Live session count.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Queue a directive for the next message from `id`.
    pub fn queue(&self, id: AgentId, directive: ServerDirective) {
        self.directives.lock().entry(id).or_default().push_back(directive);
    }

    /// Next queued directive for `id`, or `Idle`.
    pub fn next_directive(&self, id: &AgentId) -> ServerDirective {
        self.directives
            .lock()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ServerDirective::Idle)
    }

    /// Store job results reported by `id`.
    pub fn record_results(&self, id: AgentId, results: Vec<JobResult>) {
        self.results.lock().entry(id).or_default().extend(results);
    }

    /// Take every result reported by `id` so far.
    pub fn take_results(&self, id: &AgentId) -> Vec<JobResult> {
        self.results.lock().remove(id).unwrap_or_default()
    }

    /// Store host metadata from a first check-in.
    pub fn record_metadata(&self, id: AgentId, metadata: Vec<u8>) {
        self.metadata.lock().insert(id, metadata);
    }

    /// Host metadata last reported by `id`.
    pub fn metadata(&self, id: &AgentId) -> Option<Vec<u8>> {
        self.metadata.lock().get(id).cloned()
    }

    /// Drop idle sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<_> = {
            let sessions = self.sessions.read();
            sessions
                .iter()
                .filter(|(_, s)| s.is_expired(self.session_timeout))
                .map(|(id, _)| *id)
                .collect()
        };

        if !expired.is_empty() {
            let mut sessions = self.sessions.write();
            for id in &expired {
                sessions.remove(id);
            }
            debug!("dropped {} idle sessions", expired.len());
        }
        expired.len()
    }

}
