//! Engine wide decryption options.

use crate::{
    decrypter::DecryptPolicy,
    error::{DecryptError, Result},
};
use std::{fmt, str::FromStr};

/// Content key supplied by the caller, optionally bound to a KID.
///
/// Keys without a KID apply to streams whose scheme does not signal one
/// (ISMACryp, OMA, Adobe and SAMPLE-AES).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyOverride {
    pub kid: Option<[u8; 16]>,
    pub key: [u8; 16],
}

impl FromStr for KeyOverride {
    type Err = String;

    /// Parse `KID:KEY` or `KEY`, each 32 hex characters. Dashes in the KID are ignored.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (kid, key) = match s.split_once(':') {
            Some((kid, key)) => (Some(kid), key),
            None => (None, s),
        };

        let kid = kid
            .map(|x| parse_hex_16(&x.replace('-', "")))
            .transpose()
            .map_err(|e| format!("invalid KID in \"{}\" ({})", s, e))?;
        let key = parse_hex_16(key).map_err(|e| format!("invalid key in \"{}\" ({})", s, e))?;

        Ok(Self { kid, key })
    }
}

impl fmt::Display for KeyOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kid) = &self.kid {
            write!(f, "{}:", hex::encode(kid))?;
        }
        write!(f, "{}", hex::encode(self.key))
    }
}

/// Options shared by every stream of a [`DecryptEngine`](crate::DecryptEngine).
#[derive(Clone, Debug, Default)]
pub struct DecryptConfig {
    pub policy: DecryptPolicy,
    /// Checked first, in order, before any other key source.
    pub keys: Vec<KeyOverride>,
    /// 1-based key slots to treat as unresolved.
    pub invalid_slots: Vec<usize>,
    /// Ignore per-sample IV updates once a key slot has been seeded.
    pub hls_iv_patch: bool,
    /// Key/IV mapping file used when a stream does not reference one.
    pub key_file: Option<String>,
    /// Temporary key exchange endpoint used when a stream does not declare one.
    pub clearkey_url: Option<String>,
}

impl DecryptConfig {
    /// Create a new builder for configuring the engine.
    ///
    /// # Example
    ///
    /// ```
    /// use vsd_cenc::{DecryptConfig, DecryptPolicy};
    ///
    /// let config = DecryptConfig::builder()
    ///     .key("eb676abbcb345e96bbcf616630f1a3da", "100b6c20940f779a4589152b57d2dacb")?
    ///     .policy(DecryptPolicy::Pad0)
    ///     .build();
    /// assert_eq!(config.keys.len(), 1);
    /// # Ok::<(), vsd_cenc::DecryptError>(())
    /// ```
    pub fn builder() -> DecryptConfigBuilder {
        DecryptConfigBuilder::default()
    }

    /// Override for a KID, or for a KID-less slot when `kid` is `None`.
    pub fn key_for(&self, kid: Option<&[u8; 16]>) -> Option<&KeyOverride> {
        self.keys.iter().find(|x| x.kid.as_ref() == kid)
    }

    pub fn is_slot_invalidated(&self, slot: usize) -> bool {
        self.invalid_slots.contains(&slot)
    }
}

/// Builder for creating [`DecryptConfig`] instances.
#[derive(Default)]
pub struct DecryptConfigBuilder {
    config: DecryptConfig,
}

impl DecryptConfigBuilder {
    /// Add a KID/key pair.
    ///
    /// # Arguments
    ///
    /// * `kid` - The Key ID as a 32-character hexadecimal string (16 bytes)
    /// * `key` - The decryption key as a 32-character hexadecimal string (16 bytes)
    pub fn key(mut self, kid: &str, key: &str) -> Result<Self> {
        self.config.keys.push(KeyOverride {
            kid: Some(parse_hex_16(&kid.replace('-', ""))?),
            key: parse_hex_16(key)?,
        });
        Ok(self)
    }

    /// Add a KID/key pair from raw bytes.
    pub fn key_bytes(mut self, kid: [u8; 16], key: [u8; 16]) -> Self {
        self.config.keys.push(KeyOverride {
            kid: Some(kid),
            key,
        });
        self
    }

    /// Add a key for streams that do not signal KIDs.
    pub fn default_key(mut self, key: [u8; 16]) -> Self {
        self.config.keys.push(KeyOverride { kid: None, key });
        self
    }

    pub fn keys<I: IntoIterator<Item = KeyOverride>>(mut self, keys: I) -> Self {
        self.config.keys.extend(keys);
        self
    }

    pub fn policy(mut self, policy: DecryptPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn invalidate_slot(mut self, slot: usize) -> Self {
        self.config.invalid_slots.push(slot);
        self
    }

    pub fn hls_iv_patch(mut self, hls_iv_patch: bool) -> Self {
        self.config.hls_iv_patch = hls_iv_patch;
        self
    }

    pub fn key_file<T: Into<String>>(mut self, key_file: T) -> Self {
        self.config.key_file = Some(key_file.into());
        self
    }

    pub fn clearkey_url<T: Into<String>>(mut self, clearkey_url: T) -> Self {
        self.config.clearkey_url = Some(clearkey_url.into());
        self
    }

    pub fn build(self) -> DecryptConfig {
        self.config
    }
}

/// Decode 32 hex characters, with an optional `0x` prefix.
pub fn parse_hex_16(input: &str) -> Result<[u8; 16]> {
    let input = input.trim();
    let input = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    let bytes = hex::decode(input)?;

    bytes.try_into().map_err(|x: Vec<u8>| {
        DecryptError::config(format!("expected 16 bytes of hex, got {}", x.len()))
    })
}
