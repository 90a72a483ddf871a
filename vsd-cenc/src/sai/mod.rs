//! Sample auxiliary information: per-sample IVs and subsample layout.
//!
//! Two encodings produce the same [`SampleAuxInfo`]:
//!
//! - an inline per-sample record ([`SampleAuxInfo::parse`]).
//! - `saiz`/`saio` tables pointing into an auxiliary data region ([`SaiTableReader`]).

mod inline;
mod table;

pub use table::{AuxSource, SaiOffsetTable, SaiSizeTable, SaiTableReader, StreamSource};

use crate::error::{DecryptError, Result};

/// Entry describing a subsample's cleartext and encrypted portions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subsample {
    /// Number of cleartext bytes at the start of the subsample.
    pub clear_bytes: u16,
    /// Number of encrypted bytes following the cleartext.
    pub encrypted_bytes: u32,
    /// 1-based key index, 0 marks the encrypted run as clear.
    pub key_index: u16,
}

impl Subsample {
    pub fn new(clear_bytes: u16, encrypted_bytes: u32) -> Self {
        Self {
            clear_bytes,
            encrypted_bytes,
            key_index: 1,
        }
    }

    pub fn with_key(clear_bytes: u16, encrypted_bytes: u32, key_index: u16) -> Self {
        Self {
            clear_bytes,
            encrypted_bytes,
            key_index,
        }
    }

    pub fn len(&self) -> u64 {
        self.clear_bytes as u64 + self.encrypted_bytes as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// IV used to reseed one key slot before the sample is decrypted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IvInit {
    pub key_index: u16,
    pub iv: Vec<u8>,
}

/// Decoded auxiliary information of one sample.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleAuxInfo {
    pub ivs: Vec<IvInit>,
    /// Empty for full-sample encryption.
    pub subsamples: Vec<Subsample>,
}

impl SampleAuxInfo {
    /// Single key, full-sample encryption.
    pub fn full_sample(iv: &[u8]) -> Self {
        Self {
            ivs: vec![IvInit {
                key_index: 1,
                iv: iv.to_vec(),
            }],
            subsamples: Vec::new(),
        }
    }

    pub fn is_full_sample(&self) -> bool {
        self.subsamples.is_empty()
    }

    pub fn iv_for(&self, key_index: u16) -> Option<&[u8]> {
        self.ivs
            .iter()
            .find(|x| x.key_index == key_index)
            .map(|x| x.iv.as_slice())
    }

    /// Reject subsample maps whose byte total differs from the sample length.
    pub fn check_layout(&self, sample_len: usize) -> Result<()> {
        if self.is_full_sample() {
            return Ok(());
        }

        let total = self.subsamples.iter().map(|x| x.len()).sum::<u64>();

        if total != sample_len as u64 {
            return Err(DecryptError::non_compliant(format!(
                "subsamples cover {} bytes but the sample has {} bytes",
                total, sample_len
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MalformedInput;

    #[test]
    fn test_layout_must_match_sample_length() {
        let sai = SampleAuxInfo {
            ivs: Vec::new(),
            subsamples: vec![Subsample::new(10, 32), Subsample::new(6, 16)],
        };

        assert!(sai.check_layout(64).is_ok());
        assert!(matches!(
            sai.check_layout(60),
            Err(DecryptError::Malformed(
                MalformedInput::NonCompliantBitstream(_)
            ))
        ));
        assert!(sai.check_layout(70).is_err());
    }

    #[test]
    fn test_full_sample_has_no_layout() {
        let sai = SampleAuxInfo::full_sample(&[0; 8]);
        assert!(sai.is_full_sample());
        assert!(sai.check_layout(1234).is_ok());
        assert_eq!(sai.iv_for(1), Some(&[0u8; 8][..]));
        assert_eq!(sai.iv_for(2), None);
    }
}
