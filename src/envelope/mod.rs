//! The envelope: the unit every agent/server exchange travels in.
//!
//! Wire format:
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Version (1) │ Type (1) │ Agent ID (16) │ Body Kind (1)       │  <- header (AAD)
//! ├──────────────────────────────────────────────────────────────┤
//! │ Nonce (12, sealed bodies only)                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Body Len (4) │ Body (clear bytes, or ciphertext || tag)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Clear bodies only carry the OPAQUE exchange that precedes any session key.
//! Everything else goes through [`Codec::seal`].

mod codec;
mod padding;
mod replay;

pub use codec::Codec;
pub use padding::{PaddingStrategy, MAX_PADDING};
pub use replay::{ReplayGuard, DEFAULT_REPLAY_WINDOW};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::agent::AgentId;
use crate::crypto::{Nonce, NONCE_SIZE};
use crate::error::{Error, Result};
use crate::{MAX_ENVELOPE_SIZE, PROTOCOL_VERSION};

/// Size of the authenticated header in bytes.
pub const HEADER_SIZE: usize = 1 + 1 + 16 + 1;

const BODY_CLEAR: u8 = 0x00;
const BODY_SEALED: u8 = 0x01;

/// What an envelope carries.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Agent check-in (metadata on first contact, status afterwards)
    CheckIn = 0x01,
    /// Server-to-agent directive answering a check-in
    JobRequest = 0x02,
    /// Agent-to-server job results
    JobResult = 0x03,
    /// Control traffic (configuration updates, termination)
    Control = 0x04,
    /// Error report
    Error = 0x05,
    /// Pre-authentication OPAQUE exchange (clear body)
    Opaque = 0x06,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageType::CheckIn),
            0x02 => Ok(MessageType::JobRequest),
            0x03 => Ok(MessageType::JobResult),
            0x04 => Ok(MessageType::Control),
            0x05 => Ok(MessageType::Error),
            0x06 => Ok(MessageType::Opaque),
            _ => Err(Error::InvalidMessage(format!("unknown message type: {value}"))),
        }
    }
}

/// Envelope payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Unencrypted bytes. Only valid for [`MessageType::Opaque`].
    Clear(Bytes),
    /// AEAD output with the nonce it was sealed under
    Sealed {
        /// Per-message random nonce
        nonce: Nonce,
        /// Ciphertext with the 16-byte tag appended
        ciphertext: Bytes,
    },
}

impl Body {
    fn kind(&self) -> u8 {
        match self {
            Body::Clear(_) => BODY_CLEAR,
            Body::Sealed { .. } => BODY_SEALED,
        }
    }

    fn payload(&self) -> &Bytes {
        match self {
            Body::Clear(bytes) => bytes,
            Body::Sealed { ciphertext, .. } => ciphertext,
        }
    }
}

/// A framed message between an agent and the command server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Wire format version
    pub version: u8,
    /// What the body carries
    pub message_type: MessageType,
    /// Identity of the agent this envelope belongs to
    pub agent_id: AgentId,
    /// Clear or sealed payload
    pub body: Body,
}

impl Envelope {
    /// Build a clear envelope for the pre-authentication exchange.
    pub fn clear(agent_id: AgentId, message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            agent_id,
            body: Body::Clear(payload.into()),
        }
    }

    /// Whether the body is sealed.
    pub fn is_sealed(&self) -> bool {
        matches!(self.body, Body::Sealed { .. })
    }

    /// The header bytes, authenticated as AEAD associated data.
    pub fn header(&self) -> [u8; HEADER_SIZE] {
        header_bytes(
            self.version,
            self.message_type,
            &self.agent_id,
            self.body.kind(),
        )
    }

    /// Serialize the envelope to bytes.
    pub fn encode(&self) -> Bytes {
        let payload = self.body.payload();
        let mut buf = BytesMut::with_capacity(self.wire_size());

        buf.put_slice(&self.header());
        if let Body::Sealed { nonce, .. } = &self.body {
            buf.put_slice(nonce.as_bytes());
        }
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);

        buf.freeze()
    }

    /// Deserialize an envelope from bytes.
    ///
    /// The version is carried through unchecked; [`Codec::open`] and the
    /// server decide what to do with a foreign version.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() > MAX_ENVELOPE_SIZE {
            return Err(Error::InvalidMessage(format!(
                "envelope of {} bytes exceeds limit",
                data.len()
            )));
        }
        if data.len() < HEADER_SIZE + 4 {
            return Err(Error::Buffer {
                expected: HEADER_SIZE + 4,
                actual: data.len(),
            });
        }

        let version = data.get_u8();
        let message_type = MessageType::try_from(data.get_u8())?;

        let mut id = [0u8; 16];
        data.copy_to_slice(&mut id);
        let agent_id = AgentId::from_bytes(id);

        let kind = data.get_u8();
        let nonce = match kind {
            BODY_CLEAR => None,
            BODY_SEALED => {
                if data.len() < NONCE_SIZE + 4 {
                    return Err(Error::Buffer {
                        expected: NONCE_SIZE + 4,
                        actual: data.len(),
                    });
                }
                let mut nonce = [0u8; NONCE_SIZE];
                data.copy_to_slice(&mut nonce);
                Some(Nonce::from_bytes(nonce))
            }
            other => {
                return Err(Error::InvalidMessage(format!("unknown body kind: {other}")));
            }
        };

        let len = data.get_u32() as usize;
        if data.len() != len {
            return Err(Error::Buffer {
                expected: len,
                actual: data.len(),
            });
        }

        let body = match nonce {
            Some(nonce) => Body::Sealed {
                nonce,
                ciphertext: data,
            },
            None => Body::Clear(data),
        };

        Ok(Self {
            version,
            message_type,
            agent_id,
            body,
        })
    }

    /// Total encoded size in bytes.
    pub fn wire_size(&self) -> usize {
        let nonce = if self.is_sealed() { NONCE_SIZE } else { 0 };
        HEADER_SIZE + nonce + 4 + self.body.payload().len()
    }
}

pub(crate) fn header_bytes(
    version: u8,
    message_type: MessageType,
    agent_id: &AgentId,
    body_kind: u8,
) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = version;
    header[1] = message_type as u8;
    header[2..18].copy_from_slice(agent_id.as_bytes());
    header[18] = body_kind;
    header
}
