//! Plaintext padding to blur envelope sizes.
//!
//! Every sealed plaintext is framed as
//! `[4-byte big-endian length][payload][random padding]`, whatever the
//! strategy, so the receiver never needs to know how the sender padded.

use crate::crypto::random::{random_padding, random_up_to};
use crate::error::{Error, Result};

const LEN_PREFIX: usize = 4;

/// Largest padding the `Padding` option or a `Fixed` target may ask for.
///
/// Keeps a padded envelope far below [`crate::MAX_ENVELOPE_SIZE`], which
/// the receiver would otherwise refuse.
pub const MAX_PADDING: usize = 1024 * 1024;

/// Padding strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingStrategy {
    /// No padding beyond the length prefix
    #[default]
    None,
    /// Append a uniform random number of bytes in `0..=max`
    Randomized {
        /// Largest pad length
        max: usize,
    },
    /// Pad the framed plaintext up to a fixed size (larger payloads are not truncated)
    Fixed(usize),
}

impl PaddingStrategy {
    /// The strategy selected by the `Padding` option: `0` disables padding.
    pub fn from_max(max: usize) -> Self {
        if max == 0 {
            PaddingStrategy::None
        } else {
            PaddingStrategy::Randomized { max }
        }
    }

    /// Reject pad sizes above [`MAX_PADDING`].
    pub fn validate(&self) -> Result<()> {
        match *self {
            PaddingStrategy::Randomized { max } | PaddingStrategy::Fixed(max)
                if max > MAX_PADDING =>
            {
                Err(Error::config(format!(
                    "padding of {max} bytes exceeds the {MAX_PADDING} byte limit"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Number of padding bytes to add after a payload of `payload_len` bytes.
    pub fn padding_len(&self, payload_len: usize) -> usize {
        match *self {
            PaddingStrategy::None => 0,
            PaddingStrategy::Randomized { max } => random_up_to(max),
            PaddingStrategy::Fixed(target) => {
                target.saturating_sub(payload_len.saturating_add(LEN_PREFIX))
            }
        }
    }

    /// Apply padding to data.
    pub fn pad(&self, data: &[u8]) -> Result<Vec<u8>> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::InvalidMessage("payload too large to frame".into()))?;
        self.validate()?;
        let padding_len = self.padding_len(data.len());
        let capacity = (LEN_PREFIX + data.len())
            .checked_add(padding_len)
            .ok_or_else(|| Error::InvalidMessage("padded payload too large".into()))?;

        let mut result = Vec::with_capacity(capacity);
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(data);
        if padding_len > 0 {
            result.extend_from_slice(&random_padding(padding_len));
        }

        Ok(result)
    }
}

/// Remove padding from data.
///
/// Returns `None` if the length prefix is missing or points past the end.
pub fn unpad(data: &[u8]) -> Option<&[u8]> {
    let prefix: [u8; LEN_PREFIX] = data.get(..LEN_PREFIX)?.try_into().ok()?;
    let len = u32::from_be_bytes(prefix) as usize;
    data.get(LEN_PREFIX..LEN_PREFIX.checked_add(len)?)
}
