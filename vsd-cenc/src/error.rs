//! Error types for sample decryption.

use thiserror::Error;

/// Errors that can occur while configuring a stream or decrypting one of its samples.
///
/// The variants are the complete failure taxonomy of the engine, callers are expected
/// to match on all of them.
#[derive(Debug, Error)]
pub enum DecryptError {
    /// No usable key material or an unsupported protection setup.
    /// Fatal for the stream, which moves to the error state.
    #[error("configuration error: {0}")]
    Config(String),

    /// Structurally invalid key info, sample auxiliary information,
    /// protection header or sample payload.
    #[error("malformed input: {0}")]
    Malformed(#[from] MalformedInput),

    /// Key resolution exhausted every source for a key slot.
    #[error("key not found for slot {slot} (KID {kid})")]
    KeyNotFound { slot: usize, kid: String },

    /// A key fetch failed at the network or file layer.
    #[error("key fetch failed: {0}")]
    TransientIo(String),
}

/// Variant of a [`DecryptError`] without its payload, kept as the last error of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Malformed,
    KeyNotFound,
    TransientIo,
}

/// Reasons why a piece of binary metadata was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedInput {
    /// A read went past the end of the buffer.
    #[error("cannot read {needed} bytes at offset {offset} ({available} bytes available)")]
    ShortRead {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Declared layout does not fit the data it describes.
    #[error("non compliant bitstream: {0}")]
    NonCompliantBitstream(String),

    /// Any other inconsistency (bad counts, sizes or indices).
    #[error("{0}")]
    Invalid(String),
}

impl DecryptError {
    pub(crate) fn config<T: Into<String>>(reason: T) -> Self {
        Self::Config(reason.into())
    }

    pub(crate) fn invalid<T: Into<String>>(reason: T) -> Self {
        Self::Malformed(MalformedInput::Invalid(reason.into()))
    }

    pub(crate) fn non_compliant<T: Into<String>>(reason: T) -> Self {
        Self::Malformed(MalformedInput::NonCompliantBitstream(reason.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Malformed(_) => ErrorKind::Malformed,
            Self::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            Self::TransientIo(_) => ErrorKind::TransientIo,
        }
    }

    /// Returns true if the error is a malformed input error.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }

    /// Returns true if the error leaves the stream waiting for a retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

impl From<hex::FromHexError> for DecryptError {
    fn from(value: hex::FromHexError) -> Self {
        Self::Config(format!("invalid hex string: {}", value))
    }
}

/// Result type for decryption operations.
pub type Result<T> = std::result::Result<T, DecryptError>;
