//! TLS ClientHello fingerprint shaping.
//!
//! A fingerprint is either an explicit JA3 string or the name of a built-in
//! browser profile ("parrot"). At build time it is resolved against what the
//! TLS stack actually implements:
//!
//! ```text
//!   JA3 "771,4865-4866-49195-...,0-23-...,29-23-24,0"
//!          │        │                       │
//!          │        └─ cipher suites ───────┼──► ordered subset of provider suites
//!          │                                └──► ordered subset of provider kx groups
//!          └─ enabled versions derived from the suites that survive
//! ```
//!
//! Suites or groups the stack does not implement are dropped; their relative
//! order is kept. A fingerprint with nothing left fails; there is never a
//! silent fallback to the stack's default hello. Extension order is decided
//! by the TLS stack and is not shaped.

use std::fmt;
use std::str::FromStr;

use rustls::crypto::{CryptoProvider, SupportedKxGroup};
use rustls::{SupportedCipherSuite, SupportedProtocolVersion};

use crate::error::{Error, Result};

const CHROME_JA3: &str = "771,4865-4866-4867-49195-49199-49196-49200-52393-52392-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-13-18-51-45-43-27-17513-21,29-23-24,0";
const FIREFOX_JA3: &str = "771,4865-4867-4866-49195-49199-52393-52392-49196-49200-49162-49161-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-34-51-43-13-45-28-21,29-23-24-25-256-257,0";
const SAFARI_JA3: &str = "771,4865-4866-4867-49196-49195-52393-49200-49199-52392-49162-49161-49172-49171-157-156-53-47-49160-49170-10,0-23-65281-10-11-16-5-13-18-51-45-43-27-21,29-23-24-25,0";

/// GREASE values (RFC 8701) are random placeholders and never part of a JA3.
pub fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a && value >> 8 == value & 0xff
}

/// The five fields of a JA3 fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ja3 {
    /// ClientHello legacy version (771 = TLS 1.2)
    pub version: u16,
    /// Offered cipher suites, in order
    pub ciphers: Vec<u16>,
    /// Extension types, in order
    pub extensions: Vec<u16>,
    /// Supported groups (elliptic curves), in order
    pub curves: Vec<u16>,
    /// EC point formats
    pub point_formats: Vec<u8>,
}

fn parse_list<T: FromStr>(field: &str, name: &str) -> Result<Vec<T>> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split('-')
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| Error::config(format!("malformed JA3 {name}: {v:?}")))
        })
        .collect()
}

fn join<T: fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

impl FromStr for Ja3 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.trim().split(',').collect();
        if fields.len() != 5 {
            return Err(Error::config(format!(
                "malformed JA3: expected 5 fields, got {}",
                fields.len()
            )));
        }

        let version = fields[0]
            .parse::<u16>()
            .map_err(|_| Error::config(format!("malformed JA3 version: {:?}", fields[0])))?;
        let strip = |v: Vec<u16>| v.into_iter().filter(|x| !is_grease(*x)).collect::<Vec<_>>();

        let ja3 = Ja3 {
            version,
            ciphers: strip(parse_list(fields[1], "cipher list")?),
            extensions: strip(parse_list(fields[2], "extension list")?),
            curves: strip(parse_list(fields[3], "curve list")?),
            point_formats: parse_list(fields[4], "point format list")?,
        };

        if ja3.ciphers.is_empty() {
            return Err(Error::config("malformed JA3: no cipher suites"));
        }
        Ok(ja3)
    }
}

impl fmt::Display for Ja3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            self.version,
            join(&self.ciphers),
            join(&self.extensions),
            join(&self.curves),
            join(&self.point_formats)
        )
    }
}

/// Built-in browser ClientHello profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parrot {
    /// Current Chrome
    ChromeAuto,
    /// Chrome 120
    Chrome120,
    /// Current Firefox
    FirefoxAuto,
    /// Firefox 120
    Firefox120,
    /// Current Safari
    SafariAuto,
    /// Current iOS Safari
    IosAuto,
    /// Current Edge
    EdgeAuto,
}

impl Parrot {
    /// Every profile, in name order.
    pub const ALL: [Parrot; 7] = [
        Parrot::ChromeAuto,
        Parrot::Chrome120,
        Parrot::FirefoxAuto,
        Parrot::Firefox120,
        Parrot::SafariAuto,
        Parrot::IosAuto,
        Parrot::EdgeAuto,
    ];

    /// Profile name as accepted in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Parrot::ChromeAuto => "HelloChrome_Auto",
            Parrot::Chrome120 => "HelloChrome_120",
            Parrot::FirefoxAuto => "HelloFirefox_Auto",
            Parrot::Firefox120 => "HelloFirefox_120",
            Parrot::SafariAuto => "HelloSafari_Auto",
            Parrot::IosAuto => "HelloIOS_Auto",
            Parrot::EdgeAuto => "HelloEdge_Auto",
        }
    }

    /// The JA3 this profile imitates.
    pub fn ja3(&self) -> Result<Ja3> {
        let spec = match self {
            // Edge ships Chromium's TLS stack
            Parrot::ChromeAuto | Parrot::Chrome120 | Parrot::EdgeAuto => CHROME_JA3,
            Parrot::FirefoxAuto | Parrot::Firefox120 => FIREFOX_JA3,
            Parrot::SafariAuto | Parrot::IosAuto => SAFARI_JA3,
        };
        spec.parse()
    }
}

impl FromStr for Parrot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Parrot::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| Error::config(format!("unknown parrot profile: {s}")))
    }
}

impl fmt::Display for Parrot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A requested ClientHello shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    /// Named browser profile
    Parrot(Parrot),
    /// Explicit JA3 specification
    Ja3(Ja3),
}

impl Fingerprint {
    /// The JA3 fields to shape the hello after.
    pub fn ja3(&self) -> Result<Ja3> {
        match self {
            Fingerprint::Parrot(parrot) => parrot.ja3(),
            Fingerprint::Ja3(ja3) => Ok(ja3.clone()),
        }
    }

    /// Resolve against the TLS stack's implemented suites and groups.
    pub fn resolve(&self) -> Result<TlsShape> {
        TlsShape::from_ja3(&self.ja3()?)
    }
}

/// Concrete TLS client parameters realizing a fingerprint.
#[derive(Debug, Clone)]
pub struct TlsShape {
    /// Cipher suites, in offer order
    pub cipher_suites: Vec<SupportedCipherSuite>,
    /// Key-exchange groups, in offer order
    pub kx_groups: Vec<&'static dyn SupportedKxGroup>,
    /// Protocol versions to enable
    pub versions: Vec<&'static SupportedProtocolVersion>,
}

impl TlsShape {
    /// The full default TLS stack, unshaped.
    pub fn unshaped() -> Self {
        let provider = rustls::crypto::ring::default_provider();
        let versions = versions_for(&provider.cipher_suites);
        Self {
            cipher_suites: provider.cipher_suites,
            kx_groups: provider.kx_groups,
            versions,
        }
    }

    /// Pick the implemented subset of a JA3's suites and groups, in JA3 order.
    pub fn from_ja3(ja3: &Ja3) -> Result<Self> {
        let provider = rustls::crypto::ring::default_provider();

        let cipher_suites: Vec<SupportedCipherSuite> = ja3
            .ciphers
            .iter()
            .filter_map(|id| {
                provider
                    .cipher_suites
                    .iter()
                    .find(|s| u16::from(s.suite()) == *id)
                    .copied()
            })
            .collect();
        if cipher_suites.is_empty() {
            return Err(Error::config(
                "fingerprint offers no cipher suite the TLS stack supports",
            ));
        }

        let kx_groups: Vec<&'static dyn SupportedKxGroup> = ja3
            .curves
            .iter()
            .filter_map(|id| {
                provider
                    .kx_groups
                    .iter()
                    .find(|g| u16::from(g.name()) == *id)
                    .copied()
            })
            .collect();
        if kx_groups.is_empty() {
            return Err(Error::config(
                "fingerprint offers no key-exchange group the TLS stack supports",
            ));
        }

        let versions = versions_for(&cipher_suites);
        Ok(Self {
            cipher_suites,
            kx_groups,
            versions,
        })
    }

    /// Whether TLS 1.3 is among the enabled versions.
    pub fn supports_tls13(&self) -> bool {
        self.versions
            .iter()
            .any(|v| v.version == rustls::ProtocolVersion::TLSv1_3)
    }

    /// Suite identifiers in offer order.
    pub fn cipher_ids(&self) -> Vec<u16> {
        self.cipher_suites
            .iter()
            .map(|s| u16::from(s.suite()))
            .collect()
    }

    /// Group identifiers in offer order.
    pub fn group_ids(&self) -> Vec<u16> {
        self.kx_groups.iter().map(|g| u16::from(g.name())).collect()
    }

    /// A crypto provider restricted to this shape.
    pub fn provider(&self) -> CryptoProvider {
        CryptoProvider {
            cipher_suites: self.cipher_suites.clone(),
            kx_groups: self.kx_groups.clone(),
            ..rustls::crypto::ring::default_provider()
        }
    }
}

fn versions_for(suites: &[SupportedCipherSuite]) -> Vec<&'static SupportedProtocolVersion> {
    let mut versions = Vec::with_capacity(2);
    if suites
        .iter()
        .any(|s| matches!(s, SupportedCipherSuite::Tls13(_)))
    {
        versions.push(&rustls::version::TLS13);
    }
    if suites
        .iter()
        .any(|s| matches!(s, SupportedCipherSuite::Tls12(_)))
    {
        versions.push(&rustls::version::TLS12);
    }
    versions
}
