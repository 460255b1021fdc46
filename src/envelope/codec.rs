//! Sealing and opening envelopes under a session key.

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::padding::{unpad, PaddingStrategy};
use super::replay::ReplayGuard;
use super::{header_bytes, Body, Envelope, MessageType, BODY_SEALED};
use crate::agent::AgentId;
use crate::crypto::{Aead, Nonce};
use crate::error::{Error, Result};
use crate::pake::SessionKey;
use crate::PROTOCOL_VERSION;

/// Envelope codec bound to one agent identity.
///
/// Both ends of a session hold one: the agent seals with its upstream key
/// and the server with its downstream key, as selected by the
/// [`SessionKey`]'s role.
pub struct Codec {
    identity: AgentId,
    padding: PaddingStrategy,
    replay: Option<Mutex<ReplayGuard>>,
}

impl Codec {
    /// Create a codec for `identity`.
    ///
    /// With `replay` set, a nonce accepted once is refused afterwards.
    pub fn new(identity: AgentId, padding: PaddingStrategy, replay: Option<ReplayGuard>) -> Self {
        Self {
            identity,
            padding,
            replay: replay.map(Mutex::new),
        }
    }

    /// The identity this codec seals for and accepts.
    pub fn identity(&self) -> AgentId {
        self.identity
    }

    /// Current padding strategy.
    pub fn padding(&self) -> PaddingStrategy {
        self.padding
    }

    /// Replace the padding strategy.
    pub fn set_padding(&mut self, padding: PaddingStrategy) {
        self.padding = padding;
    }

    /// Encrypt `payload` into a sealed envelope of `message_type`.
    pub fn seal(
        &self,
        key: &SessionKey,
        payload: &[u8],
        message_type: MessageType,
    ) -> Result<Envelope> {
        let header = header_bytes(PROTOCOL_VERSION, message_type, &self.identity, BODY_SEALED);
        let plaintext = self.padding.pad(payload)?;
        let nonce = Nonce::random();

        let ciphertext = Aead::new(key.seal_key()).encrypt(&nonce, &plaintext, &header)?;

        Ok(Envelope {
            version: PROTOCOL_VERSION,
            message_type,
            agent_id: self.identity,
            body: Body::Sealed {
                nonce,
                ciphertext: Bytes::from(ciphertext),
            },
        })
    }

    /// Verify and decrypt a sealed envelope.
    ///
    /// Every failure surfaces as [`Error::Crypto`]; the reason is only
    /// visible in debug logs.
    pub fn open(&self, key: &SessionKey, envelope: &Envelope) -> Result<Vec<u8>> {
        self.try_open(key, envelope).map_err(|reason| {
            debug!(agent = %self.identity, reason, "envelope rejected");
            Error::Crypto
        })
    }

    fn try_open(
        &self,
        key: &SessionKey,
        envelope: &Envelope,
    ) -> std::result::Result<Vec<u8>, &'static str> {
        if envelope.agent_id != self.identity {
            return Err("foreign identity");
        }
        if envelope.version != PROTOCOL_VERSION {
            return Err("version mismatch");
        }

        let (nonce, ciphertext) = match &envelope.body {
            Body::Sealed { nonce, ciphertext } => (nonce, ciphertext),
            Body::Clear(_) => return Err("clear body"),
        };

        if let Some(replay) = &self.replay {
            if replay.lock().contains(nonce) {
                return Err("replayed nonce");
            }
        }

        let plaintext = Aead::new(key.open_key())
            .decrypt(nonce, ciphertext, &envelope.header())
            .map_err(|_| "authentication tag mismatch")?;

        let payload = unpad(&plaintext).ok_or("malformed padding")?.to_vec();

        // Only authentic envelopes enter the window
        if let Some(replay) = &self.replay {
            if !replay.lock().insert(*nonce) {
                return Err("replayed nonce");
            }
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pake::Role;

    fn keys(id: &AgentId) -> (SessionKey, SessionKey) {
        let raw = [0x33u8; 64];
        (
            SessionKey::derive(&raw, id, Role::Agent).unwrap(),
            SessionKey::derive(&raw, id, Role::Server).unwrap(),
        )
    }

    fn codec(id: AgentId) -> Codec {
        Codec::new(id, PaddingStrategy::Randomized { max: 32 }, Some(ReplayGuard::default()))
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let id = AgentId::new();
        let (agent_key, server_key) = keys(&id);
        let agent = codec(id);
        let server = codec(id);

        let env = agent.seal(&agent_key, b"status: ok", MessageType::CheckIn).unwrap();
        assert!(env.is_sealed());
        assert_eq!(server.open(&server_key, &env).unwrap(), b"status: ok");

        let reply = server.seal(&server_key, b"idle", MessageType::JobRequest).unwrap();
        assert_eq!(agent.open(&agent_key, &reply).unwrap(), b"idle");
    }

    #[test]
    fn test_seals_differ() {
        let id = AgentId::new();
        let (agent_key, _) = keys(&id);
        let agent = Codec::new(id, PaddingStrategy::None, None);

        let a = agent.seal(&agent_key, b"same", MessageType::CheckIn).unwrap();
        let b = agent.seal(&agent_key, b"same", MessageType::CheckIn).unwrap();
        assert_ne!(a.encode(), b.encode());
    }

    #[test]
    fn test_reflected_envelope_rejected() {
        let id = AgentId::new();
        let (agent_key, _) = keys(&id);
        let agent = codec(id);

        // An agent must not accept its own upstream envelope as a reply
        let env = agent.seal(&agent_key, b"hi", MessageType::CheckIn).unwrap();
        assert!(matches!(agent.open(&agent_key, &env), Err(Error::Crypto)));
    }

    #[test]
    fn test_replay_rejected() {
        let id = AgentId::new();
        let (agent_key, server_key) = keys(&id);
        let agent = codec(id);
        let server = codec(id);

        let env = agent.seal(&agent_key, b"once", MessageType::CheckIn).unwrap();
        assert!(server.open(&server_key, &env).is_ok());
        assert!(matches!(server.open(&server_key, &env), Err(Error::Crypto)));
    }

    #[test]
    fn test_tampering_rejected() {
        let id = AgentId::new();
        let (agent_key, server_key) = keys(&id);
        let agent = codec(id);
        let server = codec(id);

        let env = agent.seal(&agent_key, b"payload", MessageType::CheckIn).unwrap();

        // Header is authenticated
        let mut retyped = env.clone();
        retyped.message_type = MessageType::Control;
        assert!(matches!(server.open(&server_key, &retyped), Err(Error::Crypto)));

        // Ciphertext is authenticated
        let mut flipped = env.clone();
        if let Body::Sealed { ciphertext, .. } = &mut flipped.body {
            let mut bytes = ciphertext.to_vec();
            bytes[0] ^= 0x01;
            *ciphertext = Bytes::from(bytes);
        }
        assert!(matches!(server.open(&server_key, &flipped), Err(Error::Crypto)));

        // Untouched envelope still opens: failures above did not poison the window
        assert!(server.open(&server_key, &env).is_ok());
    }

    #[test]
    fn test_foreign_identity_and_version() {
        let id = AgentId::new();
        let (agent_key, server_key) = keys(&id);
        let agent = codec(id);

        let env = agent.seal(&agent_key, b"payload", MessageType::CheckIn).unwrap();

        let other = codec(AgentId::new());
        assert!(matches!(other.open(&server_key, &env), Err(Error::Crypto)));

        let mut old = env.clone();
        old.version = 0;
        assert!(matches!(codec(id).open(&server_key, &old), Err(Error::Crypto)));
    }

    #[test]
    fn test_clear_body_never_accepted() {
        let id = AgentId::new();
        let (_, server_key) = keys(&id);
        let env = Envelope::clear(id, MessageType::CheckIn, &b"plaintext"[..]);
        assert!(matches!(codec(id).open(&server_key, &env), Err(Error::Crypto)));
    }
}
