//! Server configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::agent::messages::humantime_serde;
use crate::envelope::PaddingStrategy;
use crate::error::{Error, Result};
use crate::pake::{Psk, DEFAULT_LOGIN_TIMEOUT, DEFAULT_MAX_PENDING_LOGINS};

/// How the listener frames connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenMode {
    /// Cleartext HTTP/1.1, and HTTP/2 with prior knowledge (h2c)
    #[default]
    Plain,
    /// TLS with a self-signed certificate; ALPN `h2` and `http/1.1`
    Tls,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,
    /// Listen port (0 picks a free one)
    pub listen_port: u16,
    /// Listener framing
    pub mode: ListenMode,
    /// Secret agents must hold to register
    pub secret: Psk,
    /// Padding applied to sealed replies
    pub padding: PaddingStrategy,
    /// Authenticated sessions kept at once
    pub max_sessions: usize,
    /// Idle time after which a session key is dropped
    pub session_timeout: Duration,
    /// OPAQUE logins in flight at once
    pub max_pending_logins: usize,
    /// Time allowed between the two login messages
    pub login_timeout: Duration,
    /// Names on the self-signed certificate
    pub certificate_names: Vec<String>,
}

impl ServerConfig {
    /// Loopback configuration on a free port.
    pub fn new(secret: Psk) -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 0,
            mode: ListenMode::Plain,
            secret,
            padding: PaddingStrategy::None,
            max_sessions: 10_000,
            session_timeout: Duration::from_secs(3600),
            max_pending_logins: DEFAULT_MAX_PENDING_LOGINS,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            certificate_names: vec!["localhost".to_string(), "127.0.0.1".to_string()],
        }
    }

    /// Serve TLS instead of cleartext.
    pub fn with_tls(mut self) -> Self {
        self.mode = ListenMode::Tls;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr cannot be empty"));
        }
        if self.secret.is_empty() {
            return Err(Error::config("server secret cannot be empty"));
        }
        if self.max_sessions == 0 {
            return Err(Error::config("max_sessions must be at least 1"));
        }
        if self.max_pending_logins == 0 {
            return Err(Error::config("max_pending_logins must be at least 1"));
        }
        self.padding.validate()?;
        if self.mode == ListenMode::Tls && self.certificate_names.is_empty() {
            return Err(Error::config("TLS needs at least one certificate name"));
        }
        Ok(())
    }
}

/// Configuration file format.
#[derive(Deserialize)]
pub struct ServerConfigFile {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Listen port
    #[serde(default)]
    pub listen_port: u16,
    /// Serve TLS
    #[serde(default)]
    pub tls: bool,
    /// Pre-shared secret
    pub psk: Psk,
    /// Maximum random padding on replies
    #[serde(default)]
    pub padding: usize,
    /// Session idle timeout, e.g. `1h`
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(3600)
}

impl ServerConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::new(self.psk.clone());
        config.listen_addr = self.listen_addr.clone();
        config.listen_port = self.listen_port;
        config.padding = PaddingStrategy::from_max(self.padding);
        config.session_timeout = self.session_timeout;
        if self.tls {
            config.mode = ListenMode::Tls;
        }
        config.validate()?;
        Ok(config)
    }
}
