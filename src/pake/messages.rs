//! Framing of OPAQUE messages inside clear envelopes.
//!
//! ```text
//! ┌──────────┬────────────────────────────────┐
//! │ Step (1) │ OPAQUE message (variable)      │
//! └──────────┴────────────────────────────────┘
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::agent::AgentId;
use crate::envelope::{Body, Envelope, MessageType};
use crate::error::{Error, Result};

/// Position of a message in the OPAQUE exchange.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    /// Registration request / response
    RegisterInit = 0x01,
    /// Registration upload / acknowledgement
    RegisterComplete = 0x02,
    /// Credential request / response
    AuthInit = 0x03,
    /// Credential finalization / acknowledgement
    AuthComplete = 0x04,
}

impl TryFrom<u8> for AuthStep {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(AuthStep::RegisterInit),
            0x02 => Ok(AuthStep::RegisterComplete),
            0x03 => Ok(AuthStep::AuthInit),
            0x04 => Ok(AuthStep::AuthComplete),
            _ => Err(Error::InvalidMessage(format!("unknown auth step: {value}"))),
        }
    }
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthStep::RegisterInit => "register-init",
            AuthStep::RegisterComplete => "register-complete",
            AuthStep::AuthInit => "auth-init",
            AuthStep::AuthComplete => "auth-complete",
        };
        f.write_str(name)
    }
}

/// One OPAQUE protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PakeMessage {
    /// Exchange step
    pub step: AuthStep,
    /// Serialized OPAQUE message (empty for acknowledgements)
    pub body: Bytes,
}

impl PakeMessage {
    /// Create a message.
    pub fn new(step: AuthStep, body: impl Into<Bytes>) -> Self {
        Self {
            step,
            body: body.into(),
        }
    }

    /// An empty acknowledgement for `step`.
    pub fn ack(step: AuthStep) -> Self {
        Self::new(step, Bytes::new())
    }

    /// Serialize to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.body.len());
        buf.put_u8(self.step as u8);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Deserialize from bytes.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Buffer {
                expected: 1,
                actual: 0,
            });
        }
        let step = AuthStep::try_from(data[0])?;
        let body = data.split_off(1);
        Ok(Self { step, body })
    }

    /// Wrap into a clear envelope.
    pub fn into_envelope(self, agent_id: AgentId) -> Envelope {
        Envelope::clear(agent_id, MessageType::Opaque, self.encode())
    }

    /// Extract from a clear `Opaque` envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        match (&envelope.body, envelope.message_type) {
            (Body::Clear(bytes), MessageType::Opaque) => Self::decode(bytes.clone()),
            _ => Err(Error::InvalidMessage(
                "expected a clear opaque envelope".into(),
            )),
        }
    }

    /// Check the message belongs to `step`.
    pub fn expect(self, step: AuthStep) -> Result<Self> {
        if self.step == step {
            Ok(self)
        } else {
            Err(Error::auth(format!(
                "unexpected {} message during {step}",
                self.step
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_through_envelope() {
        let id = AgentId::new();
        let msg = PakeMessage::new(AuthStep::AuthInit, &b"credential-request"[..]);

        let env = msg.clone().into_envelope(id);
        assert_eq!(env.message_type, MessageType::Opaque);
        assert!(!env.is_sealed());

        let decoded = PakeMessage::from_envelope(&env).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.expect(AuthStep::AuthInit).is_ok());
    }

    #[test]
    fn test_unexpected_step() {
        let msg = PakeMessage::ack(AuthStep::RegisterComplete);
        assert!(matches!(msg.expect(AuthStep::AuthComplete), Err(Error::Auth(_))));
    }

    #[test]
    fn test_decode_invalid() {
        assert!(PakeMessage::decode(Bytes::new()).is_err());
        assert!(PakeMessage::decode(Bytes::from_static(&[0x09, 1, 2])).is_err());

        let env = Envelope::clear(AgentId::new(), MessageType::CheckIn, &b"\x01"[..]);
        assert!(PakeMessage::from_envelope(&env).is_err());
    }
}
