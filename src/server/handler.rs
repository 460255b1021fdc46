//! Envelope handling, independent of HTTP.
//!
//! One request body in, one response body (or a status code) out.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::metrics::ServerMetrics;
use super::registry::{AgentRegistry, AgentSession};
use super::ServerConfig;
use crate::agent::{AgentId, AgentMessage, ServerDirective};
use crate::envelope::{Envelope, MessageType, PaddingStrategy};
use crate::error::{Error, Result};
use crate::pake::{AuthStep, PakeMessage, PakeOutcome, PakeServer};
use crate::PROTOCOL_VERSION;

/// HTTP status for a request that failed with `err`.
///
/// Authentication problems and envelopes that fail to open both answer 401,
/// which makes the agent drop its key and authenticate again.
pub fn status_for(err: &Error) -> u16 {
    match err {
        Error::Auth(_) | Error::NotAuthenticated | Error::Crypto => 401,
        Error::InvalidMessage(_)
        | Error::Buffer { .. }
        | Error::VersionMismatch { .. }
        | Error::Serialization(_) => 400,
        _ => 500,
    }
}

/// The command server's message logic.
pub struct CommandServer {
    pake: PakeServer,
    registry: AgentRegistry,
    metrics: Arc<ServerMetrics>,
    padding: PaddingStrategy,
}

impl CommandServer {
    /// Create a command server from `config`.
    pub fn new(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pake: PakeServer::new(config.secret.clone())
                .with_login_limits(config.max_pending_logins, config.login_timeout),
            registry: AgentRegistry::new(config.max_sessions, config.session_timeout),
            metrics: Arc::new(ServerMetrics::new()),
            padding: config.padding,
        })
    }

    /// Agent state.
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// OPAQUE verifier.
    pub fn pake(&self) -> &PakeServer {
        &self.pake
    }

    /// Counters and observed request surface.
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Drop idle sessions and abandoned logins every `interval`, forever.
    pub async fn run_cleanup(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.registry.purge_expired();
            self.pake.purge_stale_logins();
        }
    }

    /// Queue a directive for `agent_id`.
    pub fn queue(&self, agent_id: AgentId, directive: ServerDirective) {
        self.registry.queue(agent_id, directive);
    }

    /// Process one request body.
    pub fn handle(&self, body: Bytes) -> Result<Bytes> {
        self.metrics.add_bytes_received(body.len() as u64);

        let envelope = Envelope::decode(body)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }
        let reply = match envelope.message_type {
            MessageType::Opaque => self.handle_pake(&envelope)?,
            _ => self.handle_sealed(&envelope)?,
        };

        let encoded = reply.encode();
        self.metrics.add_bytes_sent(encoded.len() as u64);
        Ok(encoded)
    }

    fn handle_pake(&self, envelope: &Envelope) -> Result<Envelope> {
        let agent_id = envelope.agent_id;
        let message = PakeMessage::from_envelope(envelope)?;
        let step = message.step;

        match self.pake.handle(agent_id, message) {
            Ok(PakeOutcome::Reply(reply)) => {
                if step == AuthStep::RegisterComplete {
                    self.metrics.increment_registrations();
                }
                Ok(reply.into_envelope(agent_id))
            }
            Ok(PakeOutcome::Authenticated(reply, key)) => {
                self.registry.install(agent_id, key, self.padding);
                self.metrics.increment_authenticated();
                info!(agent = %agent_id, "session key installed");
                Ok(reply.into_envelope(agent_id))
            }
            Err(err) => {
                if matches!(err, Error::Auth(_)) {
                    self.metrics.increment_auth_rejections();
                }
                warn!(agent = %agent_id, %step, error = %err, "OPAQUE exchange refused");
                Err(err)
            }
        }
    }

    fn handle_sealed(&self, envelope: &Envelope) -> Result<Envelope> {
        let agent_id = envelope.agent_id;
        let Some(session) = self.registry.get(&agent_id) else {
            self.metrics.increment_unauthenticated();
            debug!(agent = %agent_id, "sealed message without a session");
            return Err(Error::NotAuthenticated);
        };

        let plaintext = session
            .codec()
            .open(session.key(), envelope)
            .map_err(|err| {
                self.metrics.increment_crypto_failures();
                err
            })?;
        session.touch();

        let message: AgentMessage = serde_json::from_slice(&plaintext)?;
        if message.message_type() != envelope.message_type {
            return Err(Error::InvalidMessage(format!(
                "{:?} envelope carries a {:?} message",
                envelope.message_type,
                message.message_type()
            )));
        }
        self.process(&session, message);

        let directive = self.registry.next_directive(&agent_id);
        debug!(agent = %agent_id, ?directive, "replying");
        let payload = serde_json::to_vec(&directive)?;
        session
            .codec()
            .seal(session.key(), &payload, directive.message_type())
    }

    fn process(&self, session: &AgentSession, message: AgentMessage) {
        let agent_id = session.id();
        match message {
            AgentMessage::CheckIn { metadata, status } => {
                self.metrics.increment_check_ins();
                if !metadata.is_empty() {
                    info!(agent = %agent_id, bytes = metadata.len(), "initial check-in");
                    self.registry.record_metadata(agent_id, metadata);
                }
                debug!(
                    agent = %agent_id,
                    pending_jobs = status.pending_jobs,
                    failures = status.failures,
                    "check-in"
                );
            }
            AgentMessage::JobResults { results } => {
                info!(agent = %agent_id, count = results.len(), "job results received");
                self.registry.record_results(agent_id, results);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pake::Psk;

    fn server() -> CommandServer {
        CommandServer::new(&ServerConfig::new(Psk::new("test"))).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::auth("no")), 401);
        assert_eq!(status_for(&Error::Crypto), 401);
        assert_eq!(status_for(&Error::NotAuthenticated), 401);
        assert_eq!(status_for(&Error::InvalidMessage("x".into())), 400);
        assert_eq!(status_for(&Error::transport("x")), 500);
    }

    #[test]
    fn test_garbage_body() {
        let server = server();
        let err = server.handle(Bytes::from_static(b"GET / HTTP/1.1")).unwrap_err();
        assert_eq!(status_for(&err), 400);
    }

    #[test]
    fn test_clear_check_in_refused() {
        let server = server();
        let envelope = Envelope::clear(AgentId::new(), MessageType::CheckIn, &b"{}"[..]);
        let err = server.handle(envelope.encode()).unwrap_err();

        assert!(matches!(err, Error::NotAuthenticated));
        assert_eq!(server.metrics().snapshot().unauthenticated, 1);
    }

    #[test]
    fn test_malformed_opaque_message() {
        let server = server();
        let envelope = Envelope::clear(AgentId::new(), MessageType::Opaque, &b"\x09"[..]);
        assert!(server.handle(envelope.encode()).is_err());
        assert_eq!(server.registry().count(), 0);
    }
}
