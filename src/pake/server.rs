//! Server side of the OPAQUE exchange.
//!
//! Holds the server's OPAQUE key material, one registration record per agent
//! and the in-flight login state between `AuthInit` and `AuthComplete`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use opaque_ke::{
    ClientLogin, ClientLoginFinishParameters, CredentialFinalization, CredentialRequest,
    RegistrationRequest, RegistrationUpload, ServerLogin, ServerLoginStartParameters,
    ServerRegistration, ServerSetup,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::messages::{AuthStep, PakeMessage};
use super::{Psk, Role, SessionKey, Suite};
use crate::agent::AgentId;
use crate::crypto::SecureRandom;
use crate::error::{Error, Result};

/// Result of handling one OPAQUE message.
pub enum PakeOutcome {
    /// Send this reply; the exchange continues
    Reply(PakeMessage),
    /// Login finished: send the reply and install the key
    Authenticated(PakeMessage, SessionKey),
}

/// Logins allowed between `AuthInit` and `AuthComplete` at once.
pub const DEFAULT_MAX_PENDING_LOGINS: usize = 1024;

/// Time an agent has to finish a login it started.
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingLogin {
    state: ServerLogin<Suite>,
    started: Instant,
}

/// OPAQUE verifier for every agent of one server.
pub struct PakeServer {
    setup: ServerSetup<Suite>,
    secret: Psk,
    records: RwLock<HashMap<AgentId, ServerRegistration<Suite>>>,
    pending: Mutex<HashMap<AgentId, PendingLogin>>,
    max_pending: usize,
    login_timeout: Duration,
}

impl PakeServer {
    /// Create a verifier that accepts agents holding `secret`.
    pub fn new(secret: Psk) -> Self {
        let mut rng = SecureRandom::rng();
        Self {
            setup: ServerSetup::<Suite>::new(&mut rng),
            secret,
            records: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            max_pending: DEFAULT_MAX_PENDING_LOGINS,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
        }
    }

    /// Bound the in-flight logins: at most `max_pending`, each dropped after `timeout`.
    pub fn with_login_limits(mut self, max_pending: usize, timeout: Duration) -> Self {
        self.max_pending = max_pending;
        self.login_timeout = timeout;
        self
    }

    /// Logins started but not yet completed.
    pub fn pending_logins(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop logins older than the login timeout. Returns how many were removed.
    pub fn purge_stale_logins(&self) -> usize {
        let timeout = self.login_timeout;
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, login| login.started.elapsed() <= timeout);
        let removed = before - pending.len();
        if removed > 0 {
            debug!(removed, "dropped stale logins");
        }
        removed
    }

    /// The server's static OPAQUE public key.
    pub fn public_key(&self) -> Vec<u8> {
        self.setup.keypair().public().serialize().to_vec()
    }

    /// Whether `agent_id` has a registration record.
    pub fn is_registered(&self, agent_id: &AgentId) -> bool {
        self.records.read().contains_key(agent_id)
    }

    /// Number of registered agents.
    pub fn registered_count(&self) -> usize {
        self.records.read().len()
    }

    /// Process one message from `agent_id`.
    ///
    /// # Errors
    ///
    /// [`Error::Auth`] when a registration does not verify against the
    /// server's secret or a login fails; [`Error::InvalidMessage`] for
    /// malformed input.
    pub fn handle(&self, agent_id: AgentId, message: PakeMessage) -> Result<PakeOutcome> {
        debug!(agent = %agent_id, step = %message.step, "OPAQUE message");
        match message.step {
            AuthStep::RegisterInit => self.register_init(agent_id, &message.body),
            AuthStep::RegisterComplete => self.register_complete(agent_id, &message.body),
            AuthStep::AuthInit => self.auth_init(agent_id, &message.body),
            AuthStep::AuthComplete => self.auth_complete(agent_id, &message.body),
        }
    }

    fn register_init(&self, agent_id: AgentId, body: &[u8]) -> Result<PakeOutcome> {
        let request = RegistrationRequest::<Suite>::deserialize(body)
            .map_err(|e| Error::InvalidMessage(format!("registration request: {e:?}")))?;
        let start = ServerRegistration::<Suite>::start(&self.setup, request, agent_id.as_bytes())
            .map_err(|e| Error::auth(format!("registration start: {e:?}")))?;

        Ok(PakeOutcome::Reply(PakeMessage::new(
            AuthStep::RegisterInit,
            start.message.serialize().to_vec(),
        )))
    }

    fn register_complete(&self, agent_id: AgentId, body: &[u8]) -> Result<PakeOutcome> {
        let upload = RegistrationUpload::<Suite>::deserialize(body)
            .map_err(|e| Error::InvalidMessage(format!("registration upload: {e:?}")))?;
        let record = ServerRegistration::<Suite>::finish(upload);

        if !self.record_matches_secret(&agent_id, &record) {
            warn!(agent = %agent_id, "registration does not match server secret");
            return Err(Error::auth("registration rejected"));
        }

        let replaced = self.records.write().insert(agent_id, record).is_some();
        info!(agent = %agent_id, replaced, "agent registered");

        Ok(PakeOutcome::Reply(PakeMessage::ack(AuthStep::RegisterComplete)))
    }

    fn auth_init(&self, agent_id: AgentId, body: &[u8]) -> Result<PakeOutcome> {
        let request = CredentialRequest::<Suite>::deserialize(body)
            .map_err(|e| Error::InvalidMessage(format!("credential request: {e:?}")))?;
        let record = self.records.read().get(&agent_id).cloned();
        if record.is_none() {
            // OPAQUE answers with a fake record, so the agent learns nothing
            debug!(agent = %agent_id, "login for unregistered agent");
        }

        let mut rng = SecureRandom::rng();
        let start = ServerLogin::start(
            &mut rng,
            &self.setup,
            record,
            request,
            agent_id.as_bytes(),
            ServerLoginStartParameters::default(),
        )
        .map_err(|e| Error::auth(format!("login start: {e:?}")))?;

        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending && !pending.contains_key(&agent_id) {
            let timeout = self.login_timeout;
            pending.retain(|_, login| login.started.elapsed() <= timeout);
            if pending.len() >= self.max_pending {
                warn!(agent = %agent_id, pending = pending.len(), "too many logins in progress");
                return Err(Error::auth("too many logins in progress"));
            }
        }
        pending.insert(
            agent_id,
            PendingLogin {
                state: start.state,
                started: Instant::now(),
            },
        );
        drop(pending);

        Ok(PakeOutcome::Reply(PakeMessage::new(
            AuthStep::AuthInit,
            start.message.serialize().to_vec(),
        )))
    }

    fn auth_complete(&self, agent_id: AgentId, body: &[u8]) -> Result<PakeOutcome> {
        let login = self
            .pending
            .lock()
            .remove(&agent_id)
            .ok_or_else(|| Error::auth("no login in progress"))?;
        if login.started.elapsed() > self.login_timeout {
            return Err(Error::auth("login timed out"));
        }
        let state = login.state;
        let finalization = CredentialFinalization::<Suite>::deserialize(body)
            .map_err(|e| Error::InvalidMessage(format!("credential finalization: {e:?}")))?;

        let finish = state
            .finish(finalization)
            .map_err(|_| Error::auth("credential finalization rejected"))?;
        let raw = Zeroizing::new(finish.session_key.to_vec());
        let key = SessionKey::derive(&raw, &agent_id, Role::Server)?;

        info!(agent = %agent_id, "agent authenticated");
        Ok(PakeOutcome::Authenticated(
            PakeMessage::ack(AuthStep::AuthComplete),
            key,
        ))
    }

    /// Run a local login with the server's own secret against `record`.
    ///
    /// Succeeds only if the agent registered with the same secret.
    fn record_matches_secret(&self, agent_id: &AgentId, record: &ServerRegistration<Suite>) -> bool {
        let mut rng = SecureRandom::rng();
        let password = self.secret.expose();

        let Ok(client) = ClientLogin::<Suite>::start(&mut rng, password) else {
            return false;
        };
        let Ok(server) = ServerLogin::start(
            &mut rng,
            &self.setup,
            Some(record.clone()),
            client.message,
            agent_id.as_bytes(),
            ServerLoginStartParameters::default(),
        ) else {
            return false;
        };
        let Ok(finish) = client.state.finish(
            password,
            server.message,
            ClientLoginFinishParameters::default(),
        ) else {
            return false;
        };
        server.state.finish(finish.message).is_ok()
    }
}
