//! Shared test helpers for integration tests.
//!
//! `Loopback` answers envelopes with an in-process command server, so the
//! agent session can be driven without sockets. `start_server` runs the
//! real HTTP listener for transport round trips.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentlink::agent::{AgentConfig, RetrySchedule};
use agentlink::envelope::Envelope;
use agentlink::server::{status_for, CommandServer, Server, ServerConfig, ServerHandle};
use agentlink::transport::{ConnectionProfile, Protocol, TlsVerification, Transport};
use agentlink::{Error, Psk, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

// ── Tracing ─────────────────────────────────────────────────────────────────

/// Route tracing output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// ── In-process transport ────────────────────────────────────────────────────

/// Transport that hands every envelope straight to a [`CommandServer`].
///
/// Server errors come back as [`Error::Rejected`] with the status the HTTP
/// listener would have used.
pub struct Loopback {
    command: Arc<CommandServer>,
    secret: Mutex<Option<Psk>>,
    calls: AtomicUsize,
    faults: AtomicUsize,
    rotations: AtomicUsize,
}

impl Loopback {
    pub fn new(command: Arc<CommandServer>, secret: &str) -> Arc<Self> {
        Arc::new(Self {
            command,
            secret: Mutex::new(Some(Psk::new(secret))),
            calls: AtomicUsize::new(0),
            faults: AtomicUsize::new(0),
            rotations: AtomicUsize::new(0),
        })
    }

    /// Fail the next `n` sends with a transport error before reaching the server.
    pub fn fail_next(&self, n: usize) {
        self.faults.store(n, Ordering::SeqCst);
    }

    /// Envelopes sent so far, including injected failures.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn rotations(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }

    pub fn command(&self) -> &Arc<CommandServer> {
        &self.command
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn send(&self, envelope: &Envelope) -> Result<Envelope> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::transport("connection reset by peer"));
        }

        let reply = self
            .command
            .handle(envelope.encode())
            .map_err(|e| Error::Rejected(status_for(&e)))?;
        Envelope::decode(reply)
    }

    fn set_secret(&self, secret: Psk) {
        *self.secret.lock() = Some(secret);
    }

    fn secret(&self) -> Option<Psk> {
        self.secret.lock().clone()
    }

    fn rotate(&self) {
        self.rotations.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Servers ─────────────────────────────────────────────────────────────────

/// Command server logic without a listener.
pub fn command_server(secret: &str) -> Arc<CommandServer> {
    Arc::new(CommandServer::new(&ServerConfig::new(Psk::new(secret))).unwrap())
}

/// Start a plaintext listener on an ephemeral port.
pub async fn start_plain(secret: &str) -> ServerHandle {
    Server::new(ServerConfig::new(Psk::new(secret)))
        .unwrap()
        .start()
        .await
        .unwrap()
}

/// Start a TLS listener with a self-signed certificate.
pub async fn start_tls(secret: &str) -> ServerHandle {
    Server::new(ServerConfig::new(Psk::new(secret)).with_tls())
        .unwrap()
        .start()
        .await
        .unwrap()
}

/// Profile pointing at `handle` that trusts its self-signed certificate.
pub fn profile_for(handle: &ServerHandle, protocol: Protocol) -> ConnectionProfile {
    ConnectionProfile::new(vec![handle.url()], protocol)
        .with_tls_verification(TlsVerification::AcceptAny)
        .with_timeout(Duration::from_secs(10))
}

// ── Agent configuration ─────────────────────────────────────────────────────

/// Short sleeps, no jitter, `max_retry` attempts.
pub fn fast_config(max_retry: u32) -> AgentConfig {
    AgentConfig {
        schedule: RetrySchedule {
            sleep: Duration::from_millis(50),
            skew: 0,
            max_retry,
            kill_date: None,
        },
        ..AgentConfig::default()
    }
}
