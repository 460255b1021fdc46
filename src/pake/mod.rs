//! Password-authenticated key exchange (OPAQUE).
//!
//! The pre-shared secret is used as the OPAQUE password. Neither the secret
//! nor anything derived from it crosses the wire, and a recorded exchange
//! gives an attacker nothing to guess against offline.
//!
//! ## Exchange
//!
//! ```text
//!  Agent                                              Server
//!    │  RegisterInit     (registration request)  ──►     │
//!    │  ◄── (registration response)                      │
//!    │  RegisterComplete (registration upload)   ──►     │  record checked
//!    │  ◄── ack                                          │  against its PSK
//!    │  AuthInit         (credential request)    ──►     │
//!    │  ◄── (credential response)                        │
//!    │  AuthComplete     (credential finalization) ──►   │
//!    │  ◄── ack                                          │
//!    ▼  SessionKey                           SessionKey  ▼
//! ```
//!
//! Every message travels in a clear [`MessageType::Opaque`] envelope.
//!
//! [`MessageType::Opaque`]: crate::envelope::MessageType::Opaque

mod messages;
pub mod server;

pub use messages::{AuthStep, PakeMessage};
pub use server::{PakeOutcome, PakeServer, DEFAULT_LOGIN_TIMEOUT, DEFAULT_MAX_PENDING_LOGINS};

use std::fmt;

use chrono::{DateTime, Utc};
use opaque_ke::{
    ClientLogin, ClientLoginFinishParameters, ClientRegistration,
    ClientRegistrationFinishParameters, CredentialResponse, RegistrationResponse,
};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::agent::AgentId;
use crate::crypto::{AeadKey, DirectionalKeys, SecureRandom};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// The only accepted `AuthPackage` value.
pub const AUTH_PACKAGE: &str = "opaque";

/// OPAQUE cipher suite: ristretto255 OPRF and group, 3DH, no key stretching.
pub struct Suite;

impl opaque_ke::CipherSuite for Suite {
    type OprfCs = opaque_ke::Ristretto255;
    type KeGroup = opaque_ke::Ristretto255;
    type KeyExchange = opaque_ke::key_exchange::tripledh::TripleDh;
    type Ksf = opaque_ke::ksf::Identity;
}

/// Pre-shared secret known to agent and server out of band.
///
/// Never serialized; `Debug` is redacted; zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Psk(Vec<u8>);

impl Psk {
    /// Wrap secret bytes.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self(secret.as_ref().to_vec())
    }

    /// The secret bytes.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Psk(<redacted>)")
    }
}

impl<'de> Deserialize<'de> for Psk {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Zeroizing::new(String::deserialize(deserializer)?);
        Ok(Psk::new(raw.as_bytes()))
    }
}

/// Which end of the session a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Seals upstream, opens downstream
    Agent,
    /// Seals downstream, opens upstream
    Server,
}

/// Envelope keys of an authenticated session.
///
/// Not `Clone`: the session owns its key and lends it out by reference.
pub struct SessionKey {
    seal: AeadKey,
    open: AeadKey,
}

impl SessionKey {
    /// Derive the directional keys from an OPAQUE session key.
    pub fn derive(raw: &[u8], agent_id: &AgentId, role: Role) -> Result<Self> {
        let (upstream, downstream) = DirectionalKeys::derive(raw, agent_id.as_bytes())?.into_parts();
        Ok(match role {
            Role::Agent => Self {
                seal: upstream,
                open: downstream,
            },
            Role::Server => Self {
                seal: downstream,
                open: upstream,
            },
        })
    }

    pub(crate) fn seal_key(&self) -> &AeadKey {
        &self.seal
    }

    pub(crate) fn open_key(&self) -> &AeadKey {
        &self.open
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// What the agent keeps after registering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    /// Agent identity (OPAQUE credential identifier)
    pub identity: AgentId,
    /// Server's static OPAQUE public key, pinned for later logins
    pub server_public_key: Vec<u8>,
    /// When registration completed
    pub registered_at: DateTime<Utc>,
}

/// Progress of one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing in flight
    Idle,
    /// Registration request sent
    RegistrationRequested,
    /// Server accepted the registration upload
    RegistrationComplete,
    /// Credential request sent
    AuthRequested,
    /// Session key established
    Authenticated,
    /// The attempt failed; start again from `Idle`
    Failed,
}

/// Agent side of the OPAQUE exchange.
pub struct Authenticator {
    agent_id: AgentId,
    state: AuthState,
    record: Option<RegistrationRecord>,
}

impl Authenticator {
    /// Create an authenticator for `agent_id`.
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            state: AuthState::Idle,
            record: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Record from the last successful registration.
    pub fn record(&self) -> Option<&RegistrationRecord> {
        self.record.as_ref()
    }

    /// Forget the current attempt.
    pub fn reset(&mut self) {
        self.state = AuthState::Idle;
    }

    /// Register the agent's identity with the server.
    ///
    /// Two round trips. Re-registering replaces the server's record.
    pub async fn register(
        &mut self,
        transport: &dyn Transport,
        secret: &Psk,
    ) -> Result<RegistrationRecord> {
        let result = self.try_register(transport, secret).await;
        self.settle(result, AuthState::RegistrationComplete, "registration")
    }

    /// Log in with the registered identity and derive a session key.
    ///
    /// Two round trips. Fails with [`Error::Auth`] if the server cannot prove
    /// knowledge of the same secret; no key is produced in that case.
    pub async fn authenticate(
        &mut self,
        transport: &dyn Transport,
        secret: &Psk,
    ) -> Result<SessionKey> {
        let result = self.try_authenticate(transport, secret).await;
        self.settle(result, AuthState::Authenticated, "authentication")
    }

    fn settle<T>(&mut self, result: Result<T>, success: AuthState, what: &str) -> Result<T> {
        match result {
            Ok(value) => {
                self.state = success;
                info!(agent = %self.agent_id, "{what} succeeded");
                Ok(value)
            }
            Err(err) => {
                self.state = AuthState::Failed;
                warn!(agent = %self.agent_id, error = %err, "{what} failed");
                Err(err)
            }
        }
    }

    async fn try_register(
        &mut self,
        transport: &dyn Transport,
        secret: &Psk,
    ) -> Result<RegistrationRecord> {
        let mut rng = SecureRandom::rng();

        let start = ClientRegistration::<Suite>::start(&mut rng, secret.expose())
            .map_err(|e| Error::auth(format!("registration start: {e:?}")))?;
        self.state = AuthState::RegistrationRequested;

        let reply = self
            .exchange(
                transport,
                PakeMessage::new(AuthStep::RegisterInit, start.message.serialize().to_vec()),
            )
            .await?;
        let response = RegistrationResponse::<Suite>::deserialize(&reply.body)
            .map_err(|e| Error::auth(format!("malformed registration response: {e:?}")))?;

        let finish = start
            .state
            .finish(
                &mut rng,
                secret.expose(),
                response,
                ClientRegistrationFinishParameters::default(),
            )
            .map_err(|e| Error::auth(format!("registration finish: {e:?}")))?;
        let server_public_key = finish.server_s_pk.serialize().to_vec();

        self.exchange(
            transport,
            PakeMessage::new(AuthStep::RegisterComplete, finish.message.serialize().to_vec()),
        )
        .await?;

        let record = RegistrationRecord {
            identity: self.agent_id,
            server_public_key,
            registered_at: Utc::now(),
        };
        self.record = Some(record.clone());
        Ok(record)
    }

    async fn try_authenticate(
        &mut self,
        transport: &dyn Transport,
        secret: &Psk,
    ) -> Result<SessionKey> {
        let mut rng = SecureRandom::rng();

        let start = ClientLogin::<Suite>::start(&mut rng, secret.expose())
            .map_err(|e| Error::auth(format!("login start: {e:?}")))?;
        self.state = AuthState::AuthRequested;

        let reply = self
            .exchange(
                transport,
                PakeMessage::new(AuthStep::AuthInit, start.message.serialize().to_vec()),
            )
            .await?;
        let response = CredentialResponse::<Suite>::deserialize(&reply.body)
            .map_err(|e| Error::auth(format!("malformed credential response: {e:?}")))?;

        let finish = start
            .state
            .finish(
                secret.expose(),
                response,
                ClientLoginFinishParameters::default(),
            )
            .map_err(|e| {
                debug!(error = ?e, "credential response rejected");
                Error::auth("server credential response could not be verified")
            })?;

        if let Some(record) = &self.record {
            if finish.server_s_pk.serialize().as_slice() != record.server_public_key.as_slice() {
                return Err(Error::auth("server static key differs from the registered one"));
            }
        }

        let raw = Zeroizing::new(finish.session_key.to_vec());

        self.exchange(
            transport,
            PakeMessage::new(AuthStep::AuthComplete, finish.message.serialize().to_vec()),
        )
        .await?;

        SessionKey::derive(&raw, &self.agent_id, Role::Agent)
    }

    async fn exchange(&self, transport: &dyn Transport, message: PakeMessage) -> Result<PakeMessage> {
        let step = message.step;
        debug!(agent = %self.agent_id, %step, "sending OPAQUE message");

        let reply = transport
            .send(&message.into_envelope(self.agent_id))
            .await
            .map_err(|err| match err {
                Error::Rejected(status) => {
                    Error::auth(format!("server rejected {step} (status {status})"))
                }
                other => other,
            })?;

        if reply.agent_id != self.agent_id {
            return Err(Error::auth("reply addressed to another identity"));
        }
        PakeMessage::from_envelope(&reply)?.expect(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psk_redacted() {
        let psk = Psk::new("hunter2");
        assert_eq!(format!("{psk:?}"), "Psk(<redacted>)");
        assert_eq!(psk.expose(), b"hunter2");

        let parsed: Psk = serde_json::from_str("\"test\"").unwrap();
        assert_eq!(parsed, Psk::new("test"));
    }

    #[test]
    fn test_session_key_roles_mirror() {
        let id = AgentId::new();
        let raw = [9u8; 64];
        let agent = SessionKey::derive(&raw, &id, Role::Agent).unwrap();
        let server = SessionKey::derive(&raw, &id, Role::Server).unwrap();

        assert_eq!(agent.seal_key(), server.open_key());
        assert_eq!(agent.open_key(), server.seal_key());
        assert_ne!(agent.seal_key(), agent.open_key());
        assert_eq!(format!("{agent:?}"), "SessionKey(<redacted>)");
    }

    #[test]
    fn test_session_key_bound_to_identity() {
        let raw = [9u8; 64];
        let a = SessionKey::derive(&raw, &AgentId::new(), Role::Agent).unwrap();
        let b = SessionKey::derive(&raw, &AgentId::new(), Role::Agent).unwrap();
        assert_ne!(a.seal_key(), b.seal_key());
    }

    #[test]
    fn test_initial_state() {
        let auth = Authenticator::new(AgentId::new());
        assert_eq!(auth.state(), AuthState::Idle);
        assert!(auth.record().is_none());
    }
}
