//! Key Derivation Functions.
//!
//! Uses HKDF (HMAC-based Key Derivation Function) with SHA-256
//! to turn the OPAQUE session key into one envelope key per direction.

use hkdf::Hkdf as HkdfImpl;
use sha2::Sha256;

use crate::crypto::{AeadKey, KEY_SIZE};
use crate::error::{Error, Result};

/// HKDF salt binding derived keys to this protocol.
const SALT: &[u8] = b"agentlink/v1";

/// HKDF key derivation using SHA-256.
pub struct Hkdf {
    prk: HkdfImpl<Sha256>,
}

impl Hkdf {
    /// Create a new HKDF instance from input keying material.
    ///
    /// # Arguments
    ///
    /// * `salt` - Optional salt (recommended for better security)
    /// * `ikm` - Input keying material (e.g., the PAKE session key)
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            prk: HkdfImpl::new(salt, ikm),
        }
    }

    /// Expand to a fixed-size array.
    pub fn expand_fixed<const N: usize>(&self, info: &[u8]) -> Result<[u8; N]> {
        let mut okm = [0u8; N];
        self.prk
            .expand(info, &mut okm)
            .map_err(|_| Error::auth("HKDF expansion failed"))?;
        Ok(okm)
    }

    /// Derive an AEAD key.
    pub fn derive_aead_key(&self, info: &[u8]) -> Result<AeadKey> {
        let key_bytes = self.expand_fixed::<KEY_SIZE>(info)?;
        Ok(AeadKey::from_bytes(key_bytes))
    }
}

/// Envelope keys for both directions of one agent session.
///
/// `upstream` protects agent-to-server traffic and `downstream` the replies,
/// so a captured request can never be reflected back as a valid response.
pub struct DirectionalKeys {
    upstream: AeadKey,
    downstream: AeadKey,
}

impl DirectionalKeys {
    /// Derive both keys from a shared secret.
    ///
    /// # Arguments
    ///
    /// * `shared_secret` - Output of the key exchange
    /// * `context` - Binds the keys to a session (e.g. the agent identity)
    pub fn derive(shared_secret: &[u8], context: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::new(Some(SALT), shared_secret);

        let upstream_info = [b"upstream".as_slice(), context].concat();
        let downstream_info = [b"downstream".as_slice(), context].concat();

        Ok(Self {
            upstream: hkdf.derive_aead_key(&upstream_info)?,
            downstream: hkdf.derive_aead_key(&downstream_info)?,
        })
    }

    /// Key for agent-to-server envelopes.
    pub fn upstream(&self) -> &AeadKey {
        &self.upstream
    }

    /// Key for server-to-agent envelopes.
    pub fn downstream(&self) -> &AeadKey {
        &self.downstream
    }

    /// Split into `(upstream, downstream)`.
    pub fn into_parts(self) -> (AeadKey, AeadKey) {
        (self.upstream, self.downstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_expand_is_deterministic() {
        let hkdf = Hkdf::new(Some(&[0u8; 13]), &[0x0bu8; 22]);

        let okm: [u8; 42] = hkdf.expand_fixed(&[0xf0u8; 10]).unwrap();
        let okm2: [u8; 42] = hkdf.expand_fixed(&[0xf0u8; 10]).unwrap();
        assert_eq!(okm, okm2);
    }

    #[test]
    fn test_directional_keys() {
        let secret = [0x42u8; 64];

        let a = DirectionalKeys::derive(&secret, b"ctx").unwrap();
        let b = DirectionalKeys::derive(&secret, b"ctx").unwrap();

        assert_eq!(a.upstream(), b.upstream());
        assert_eq!(a.downstream(), b.downstream());
        assert_ne!(a.upstream(), a.downstream());

        // Different context, different keys
        let c = DirectionalKeys::derive(&secret, b"other").unwrap();
        assert_ne!(a.upstream(), c.upstream());
    }
}
