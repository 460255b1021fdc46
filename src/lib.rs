//! # agentlink
//!
//! Secure communication core for a remote-controlled agent: an OPAQUE-authenticated,
//! ChaCha20-Poly1305-sealed message channel carried over interchangeable HTTP
//! transports with a shaped TLS fingerprint.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │   Agent Session (check-in loop, retry, kill date, jobs) │
//! ├──────────────────────────────┬──────────────────────────┤
//! │  PAKE Authenticator (OPAQUE) │  Envelope Codec (AEAD,   │
//! │  register / authenticate     │  padding, replay window) │
//! ├──────────────────────────────┴──────────────────────────┤
//! │  Fingerprinted Transport (HTTP/1.1, h2, h2c, h3 + JA3)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto Layer (ChaCha20-Poly1305, HKDF-SHA256, OsRng)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **No secret on the wire**: the pre-shared secret only ever feeds OPAQUE
//! 2. **Fail closed**: a wrong secret always ends in [`Error::Auth`], never a key
//! 3. **Fresh nonces**: every sealed envelope uses a random 96-bit nonce
//! 4. **Bounded lifetime**: kill date and retry budget end all network activity

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod agent;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod pake;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

pub use agent::{Agent, AgentId, AgentState, TerminationCause};
pub use envelope::{Codec, Envelope, MessageType};
pub use error::{Error, ErrorKind, Result};
pub use pake::{Authenticator, Psk, SessionKey};
pub use transport::{ConnectionProfile, HttpTransport, Protocol, Transport};

/// Envelope wire format version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Largest envelope accepted from the network (bytes).
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Default per-request timeout (milliseconds).
pub const REQUEST_TIMEOUT_MS: u64 = 30_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(PROTOCOL_VERSION, 1);
        assert!(MAX_ENVELOPE_SIZE > envelope::HEADER_SIZE);
        assert!(REQUEST_TIMEOUT_MS >= 1_000);
    }
}
