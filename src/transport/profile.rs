//! Connection profiles: where to connect and what the connection looks like.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::warn;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::fingerprint::{Fingerprint, Ja3, Parrot};
use crate::REQUEST_TIMEOUT_MS;

/// Default User-Agent when none is configured.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// HTTP protocol generation and security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1 cleartext
    Http,
    /// HTTP/1.1 over TLS
    Https,
    /// HTTP/2 over TLS
    H2,
    /// HTTP/2 cleartext with prior knowledge
    H2c,
    /// HTTP/3 over QUIC
    Http3,
}

impl Protocol {
    /// Every variant.
    pub const ALL: [Protocol; 5] = [
        Protocol::Http,
        Protocol::Https,
        Protocol::H2,
        Protocol::H2c,
        Protocol::Http3,
    ];

    /// Whether the variant runs over TLS (or QUIC's TLS 1.3).
    pub fn is_tls(&self) -> bool {
        matches!(self, Protocol::Https | Protocol::H2 | Protocol::Http3)
    }

    /// URL scheme this variant is normally reached through.
    pub fn scheme(&self) -> &'static str {
        if self.is_tls() {
            "https"
        } else {
            "http"
        }
    }

    /// ALPN identifiers offered in the TLS handshake.
    pub fn alpn(&self) -> Vec<Vec<u8>> {
        match self {
            Protocol::Https => vec![b"http/1.1".to_vec()],
            Protocol::H2 => vec![b"h2".to_vec()],
            Protocol::Http3 => vec![b"h3".to_vec()],
            Protocol::Http | Protocol::H2c => Vec::new(),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "plain-http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "h2" => Ok(Protocol::H2),
            "h2c" | "h2-cleartext" => Ok(Protocol::H2c),
            "http3" | "h3" => Ok(Protocol::Http3),
            other => Err(Error::config(format!("unknown protocol: {other}"))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::H2 => "h2",
            Protocol::H2c => "h2c",
            Protocol::Http3 => "http3",
        };
        f.write_str(name)
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// How the next URL is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrlPolicy {
    /// Advance to the next URL on every request
    #[default]
    RoundRobin,
    /// Stay on a URL until a request to it fails
    Failover,
}

/// How the server's TLS certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVerification {
    /// Verify against the Mozilla root store
    #[default]
    WebPki,
    /// Accept any certificate. Server identity then rests on OPAQUE alone.
    AcceptAny,
}

/// Everything needed to build a transport.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    /// Candidate endpoints (at least one)
    pub urls: Vec<String>,
    /// Protocol variant
    pub protocol: Protocol,
    /// Forward proxy URL (http, https or socks5)
    pub proxy: Option<String>,
    /// Explicit JA3 fingerprint
    pub ja3: Option<String>,
    /// Named fingerprint profile
    pub parrot: Option<String>,
    /// User-Agent header
    pub user_agent: String,
    /// Host header override
    pub host: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// URL rotation policy
    pub url_policy: UrlPolicy,
    /// Certificate verification mode
    pub tls_verification: TlsVerification,
}

impl ConnectionProfile {
    /// Create a profile with defaults for everything but the endpoints.
    pub fn new(urls: Vec<String>, protocol: Protocol) -> Self {
        Self {
            urls,
            protocol,
            proxy: None,
            ja3: None,
            parrot: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            host: None,
            timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
            url_policy: UrlPolicy::default(),
            tls_verification: TlsVerification::default(),
        }
    }

    /// Set a named fingerprint profile.
    pub fn with_parrot(mut self, name: impl Into<String>) -> Self {
        self.parrot = Some(name.into());
        self
    }

    /// Set an explicit JA3 fingerprint.
    pub fn with_ja3(mut self, ja3: impl Into<String>) -> Self {
        self.ja3 = Some(ja3.into());
        self
    }

    /// Set a forward proxy.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Override the Host header.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the User-Agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the URL rotation policy.
    pub fn with_url_policy(mut self, policy: UrlPolicy) -> Self {
        self.url_policy = policy;
        self
    }

    /// Set the certificate verification mode.
    pub fn with_tls_verification(mut self, verification: TlsVerification) -> Self {
        self.tls_verification = verification;
        self
    }

    /// The configured fingerprint, if any.
    pub fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        match (&self.ja3, &self.parrot) {
            (Some(_), Some(_)) => Err(Error::config(
                "JA3 and Parrot are mutually exclusive",
            )),
            (Some(ja3), None) => Ok(Some(Fingerprint::Ja3(ja3.parse::<Ja3>()?))),
            (None, Some(name)) => Ok(Some(Fingerprint::Parrot(name.parse::<Parrot>()?))),
            (None, None) => Ok(None),
        }
    }

    /// Parsed candidate URLs.
    pub fn parsed_urls(&self) -> Result<Vec<Url>> {
        if self.urls.is_empty() {
            return Err(Error::config("at least one URL must be configured"));
        }

        self.urls
            .iter()
            .map(|raw| {
                let url = Url::parse(raw)
                    .map_err(|e| Error::config(format!("invalid URL {raw:?}: {e}")))?;
                match url.scheme() {
                    "http" | "https" => {}
                    other => {
                        return Err(Error::config(format!(
                            "unsupported URL scheme {other:?} in {raw:?}"
                        )))
                    }
                }
                if url.host_str().is_none() {
                    return Err(Error::config(format!("URL without host: {raw:?}")));
                }
                if url.scheme() != self.protocol.scheme() {
                    warn!(url = %raw, protocol = %self.protocol, "URL scheme does not match protocol");
                }
                Ok(url)
            })
            .collect()
    }

    /// Parsed proxy URL, if one is configured.
    pub fn parsed_proxy(&self) -> Result<Option<Url>> {
        let Some(raw) = &self.proxy else {
            return Ok(None);
        };
        let url =
            Url::parse(raw).map_err(|e| Error::config(format!("invalid proxy URL {raw:?}: {e}")))?;
        match url.scheme() {
            "http" | "https" | "socks5" | "socks5h" => Ok(Some(url)),
            other => Err(Error::config(format!("unsupported proxy scheme: {other}"))),
        }
    }

    /// Validate the profile.
    ///
    /// Returns the resolved fingerprint so callers do not parse it twice.
    pub fn validate(&self) -> Result<Option<Fingerprint>> {
        self.parsed_urls()?;
        self.parsed_proxy()?;

        if self.user_agent.is_empty() {
            return Err(Error::config("user agent cannot be empty"));
        }
        if self.timeout.is_zero() {
            return Err(Error::config("timeout must be non-zero"));
        }
        if let Some(host) = &self.host {
            if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(Error::config(format!("invalid Host override: {host:?}")));
            }
        }

        let fingerprint = self.fingerprint()?;
        if fingerprint.is_some() && !self.protocol.is_tls() {
            return Err(Error::config(format!(
                "a TLS fingerprint cannot be used with cleartext protocol {}",
                self.protocol
            )));
        }

        if self.protocol == Protocol::Http3 {
            if self.proxy.is_some() {
                return Err(Error::config("http3 cannot be used through a proxy"));
            }
            if let Some(fp) = &fingerprint {
                if !fp.resolve()?.supports_tls13() {
                    return Err(Error::config(
                        "http3 requires a fingerprint with TLS 1.3 cipher suites",
                    ));
                }
            }
        }

        Ok(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(protocol: Protocol) -> ConnectionProfile {
        ConnectionProfile::new(vec![format!("{}://127.0.0.1:8443/", protocol.scheme())], protocol)
    }

    #[test]
    fn test_protocol_aliases() {
        assert_eq!("http".parse::<Protocol>().unwrap(), Protocol::Http);
        assert_eq!("plain-http".parse::<Protocol>().unwrap(), Protocol::Http);
        assert_eq!("HTTPS".parse::<Protocol>().unwrap(), Protocol::Https);
        assert_eq!("h2".parse::<Protocol>().unwrap(), Protocol::H2);
        assert_eq!("h2c".parse::<Protocol>().unwrap(), Protocol::H2c);
        assert_eq!("h2-cleartext".parse::<Protocol>().unwrap(), Protocol::H2c);
        assert_eq!("h3".parse::<Protocol>().unwrap(), Protocol::Http3);
        assert_eq!("http3".parse::<Protocol>().unwrap(), Protocol::Http3);
        assert!("spdy".parse::<Protocol>().is_err());

        for p in Protocol::ALL {
            assert_eq!(p.to_string().parse::<Protocol>().unwrap(), p);
        }
    }

    #[test]
    fn test_valid_profiles() {
        for p in Protocol::ALL {
            assert!(profile(p).validate().is_ok(), "{p}");
        }
        assert!(profile(Protocol::H2)
            .with_parrot("HelloChrome_Auto")
            .validate()
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_url_validation() {
        let mut p = profile(Protocol::Http);
        p.urls.clear();
        assert!(matches!(p.validate(), Err(Error::Config(_))));

        let p = ConnectionProfile::new(vec!["ftp://example.com".into()], Protocol::Http);
        assert!(p.validate().is_err());

        let p = ConnectionProfile::new(vec!["not a url".into()], Protocol::Http);
        assert!(p.validate().is_err());

        // Scheme mismatch only warns
        let p = ConnectionProfile::new(vec!["http://example.com".into()], Protocol::H2);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_fingerprint_conflicts() {
        let both = profile(Protocol::Https)
            .with_parrot("HelloChrome_Auto")
            .with_ja3("771,4865,0,29,0");
        assert!(matches!(both.validate(), Err(Error::Config(_))));

        let cleartext = profile(Protocol::H2c).with_parrot("HelloChrome_Auto");
        assert!(cleartext.validate().is_err());

        let cleartext = profile(Protocol::Http).with_ja3("771,4865,0,29,0");
        assert!(cleartext.validate().is_err());

        let unknown = profile(Protocol::Https).with_parrot("HelloOpera_Auto");
        assert!(matches!(unknown.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_proxy_validation() {
        assert!(profile(Protocol::Http)
            .with_proxy("socks5://127.0.0.1:1080")
            .validate()
            .is_ok());
        assert!(profile(Protocol::H2)
            .with_proxy("http://proxy.local:3128")
            .validate()
            .is_ok());
        assert!(profile(Protocol::Http)
            .with_proxy("ftp://proxy.local")
            .validate()
            .is_err());
        assert!(profile(Protocol::Http)
            .with_proxy("::garbage::")
            .validate()
            .is_err());
    }

    #[test]
    fn test_http3_constraints() {
        assert!(profile(Protocol::Http3)
            .with_proxy("socks5://127.0.0.1:1080")
            .validate()
            .is_err());

        // TLS 1.2-only fingerprint
        assert!(profile(Protocol::Http3)
            .with_ja3("771,49199-49195,0,23,0")
            .validate()
            .is_err());

        assert!(profile(Protocol::Http3)
            .with_parrot("HelloFirefox_Auto")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_host_override_validation() {
        assert!(profile(Protocol::Http).with_host("cdn.example.com").validate().is_ok());
        assert!(profile(Protocol::Http).with_host("bad host").validate().is_err());
        assert!(profile(Protocol::Http).with_host("").validate().is_err());
    }
}
