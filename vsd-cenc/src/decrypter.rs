use crate::{
    cipher::CipherContext,
    error::{DecryptError, Result},
    key_info::KeyInfoRecord,
    sai::SampleAuxInfo,
    scheme::{CipherMode, CryptPattern},
};
use std::{fmt, str::FromStr};

/// What to do with bytes whose key is missing or invalid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecryptPolicy {
    /// Fail the sample (and the stream if no key resolves at all).
    #[default]
    Full,
    /// Forward ranges under missing keys as ciphertext, decrypt the rest.
    NoKey,
    /// Disable decryption, forward samples unchanged.
    Skip,
    /// Replace undecryptable bytes with `0x00`.
    Pad0,
    /// Replace undecryptable bytes with `0x01`.
    Pad1,
    /// Replace undecryptable bytes with the repeating `00 00 01` start code.
    PadStartCode,
}

impl FromStr for DecryptPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "full" => Self::Full,
            "nokey" => Self::NoKey,
            "skip" => Self::Skip,
            "pad0" => Self::Pad0,
            "pad1" => Self::Pad1,
            "padsc" | "padstartcode" => Self::PadStartCode,
            x => {
                return Err(format!(
                    "invalid decryption policy \"{}\" (possible values: full, nokey, skip, pad0, pad1, padsc)",
                    x
                ));
            }
        })
    }
}

impl fmt::Display for DecryptPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::NoKey => "nokey",
            Self::Skip => "skip",
            Self::Pad0 => "pad0",
            Self::Pad1 => "pad1",
            Self::PadStartCode => "padsc",
        })
    }
}

impl DecryptPolicy {
    /// Output for a whole access unit whose key is missing.
    pub(crate) fn missing_key(
        &self,
        data: &[u8],
        slot: usize,
        kid: Option<&[u8; 16]>,
    ) -> Result<Vec<u8>> {
        if *self == Self::Full {
            return Err(DecryptError::KeyNotFound {
                slot,
                kid: kid.map(hex::encode).unwrap_or_default(),
            });
        }

        let mut output = data.to_vec();
        self.fill(&mut output);
        Ok(output)
    }

    fn fill(&self, data: &mut [u8]) {
        match self {
            Self::Pad0 => data.fill(0),
            Self::Pad1 => data.fill(1),
            Self::PadStartCode => {
                for (i, x) in data.iter_mut().enumerate() {
                    *x = if i % 3 == 2 { 1 } else { 0 };
                }
            }
            Self::Full | Self::NoKey | Self::Skip => (),
        }
    }
}

/// Applies full-sample, subsample and pattern decryption to one sample at a time.
///
/// Cipher contexts are indexed by key slot (key index - 1) and owned by the caller,
/// they carry IV and keystream state from one sample to the next.
#[derive(Clone, Copy, Debug)]
pub struct SampleDecrypter {
    pub mode: CipherMode,
    pub pattern: Option<CryptPattern>,
    pub policy: DecryptPolicy,
    /// Ignore per-sample IVs of a slot once it has been seeded.
    pub iv_patch: bool,
}

impl SampleDecrypter {
    pub fn new(mode: CipherMode) -> Self {
        Self {
            mode,
            pattern: None,
            policy: DecryptPolicy::Full,
            iv_patch: false,
        }
    }

    pub fn pattern(mut self, pattern: Option<CryptPattern>) -> Self {
        self.pattern = pattern.filter(|x| x.is_active());
        self
    }

    pub fn policy(mut self, policy: DecryptPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn iv_patch(mut self, iv_patch: bool) -> Self {
        self.iv_patch = iv_patch;
        self
    }

    pub fn decrypt_sample(
        &self,
        sample: &[u8],
        sai: &SampleAuxInfo,
        key_info: &KeyInfoRecord,
        contexts: &mut [CipherContext],
    ) -> Result<Vec<u8>> {
        if self.policy == DecryptPolicy::Skip {
            return Ok(sample.to_vec());
        }

        sai.check_layout(sample.len())?;
        self.seed(sai, key_info, contexts)?;

        let mut output = sample.to_vec();

        if sai.is_full_sample() {
            let ranges = vec![(0, self.decryptable_len(output.len()))];
            self.apply(&mut output, 1, &ranges, key_info, contexts)?;
            return Ok(output);
        }

        let mut offset = 0;

        for subsample in &sai.subsamples {
            offset += subsample.clear_bytes as usize;
            let end = offset + subsample.encrypted_bytes as usize;

            if subsample.key_index != 0 && subsample.encrypted_bytes != 0 {
                let slot = self.slot(subsample.key_index, contexts.len())?;
                if self.mode == CipherMode::Cbc
                    && key_info
                        .entry(subsample.key_index)
                        .is_some_and(|x| x.constant_iv.is_some())
                {
                    contexts[slot].restart();
                }

                let ranges = self.crypt_ranges(offset, end);
                self.apply(
                    &mut output,
                    subsample.key_index,
                    &ranges,
                    key_info,
                    contexts,
                )?;
            }

            offset = end;
        }

        Ok(output)
    }

    fn seed(
        &self,
        sai: &SampleAuxInfo,
        key_info: &KeyInfoRecord,
        contexts: &mut [CipherContext],
    ) -> Result<()> {
        for (i, entry) in key_info.entries.iter().enumerate() {
            if let Some(constant_iv) = &entry.constant_iv
                && let Some(context) = contexts.get_mut(i)
            {
                context.seed_iv(constant_iv)?;
            }
        }

        for init in &sai.ivs {
            let slot = self.slot(init.key_index, contexts.len())?;
            let context = &mut contexts[slot];

            if self.iv_patch && context.is_initialized() {
                log::trace!("ignoring IV update for key slot {}", init.key_index);
                continue;
            }

            context.seed_iv(&init.iv)?;
        }

        Ok(())
    }

    fn slot(&self, key_index: u16, count: usize) -> Result<usize> {
        match (key_index as usize).checked_sub(1) {
            Some(x) if x < count => Ok(x),
            _ => Err(DecryptError::invalid(format!(
                "key index {} out of range ({} key slots)",
                key_index, count
            ))),
        }
    }

    fn decryptable_len(&self, len: usize) -> usize {
        match self.mode {
            CipherMode::Ctr => len,
            CipherMode::Cbc => len / 16 * 16,
        }
    }

    /// Byte ranges inside `[start, end)` that carry ciphertext.
    fn crypt_ranges(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let Some(pattern) = self.pattern else {
            return vec![(start, start + self.decryptable_len(end - start))];
        };

        let mut ranges = Vec::new();
        let mut offset = start;

        while offset < end {
            let crypt = pattern.crypt_size().min(end - offset);
            let len = self.decryptable_len(crypt);
            if len > 0 {
                ranges.push((offset, offset + len));
            }
            offset += crypt;
            offset += pattern.skip_size().min(end - offset);
        }

        ranges
    }

    fn apply(
        &self,
        output: &mut [u8],
        key_index: u16,
        ranges: &[(usize, usize)],
        key_info: &KeyInfoRecord,
        contexts: &mut [CipherContext],
    ) -> Result<()> {
        let slot = self.slot(key_index, contexts.len())?;
        let context = &mut contexts[slot];

        if !context.key_valid() {
            if self.policy == DecryptPolicy::Full {
                return Err(DecryptError::KeyNotFound {
                    slot: key_index as usize,
                    kid: key_info
                        .entry(key_index)
                        .map(|x| x.kid_hex())
                        .unwrap_or_default(),
                });
            }

            for (start, end) in ranges {
                self.policy.fill(&mut output[*start..*end]);
            }
            return Ok(());
        }

        if !context.is_initialized() {
            return Err(DecryptError::invalid(format!(
                "key slot {} used before any IV was signalled",
                key_index
            )));
        }

        for (start, end) in ranges {
            context.decrypt(&mut output[*start..*end])?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cipher::{apply_ctr, tests::*},
        key_info::KeyEntry,
        sai::{IvInit, Subsample},
    };

    fn contexts(mode: CipherMode, keys: &[Option<[u8; 16]>]) -> Vec<CipherContext> {
        keys.iter()
            .map(|x| match x {
                Some(key) => CipherContext::with_key(mode, key),
                None => CipherContext::new(mode),
            })
            .collect()
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("full".parse::<DecryptPolicy>().unwrap(), DecryptPolicy::Full);
        assert_eq!("NOKEY".parse::<DecryptPolicy>().unwrap(), DecryptPolicy::NoKey);
        assert_eq!(
            "padstartcode".parse::<DecryptPolicy>().unwrap(),
            DecryptPolicy::PadStartCode
        );
        assert_eq!(DecryptPolicy::PadStartCode.to_string(), "padsc");
        assert!("pad2".parse::<DecryptPolicy>().is_err());
    }

    #[test]
    fn test_full_sample_ctr() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([0; 16], 16));
        let sai = SampleAuxInfo::full_sample(&NIST_CTR_IV);
        let mut contexts = contexts(CipherMode::Ctr, &[Some(NIST_KEY)]);

        let output = SampleDecrypter::new(CipherMode::Ctr)
            .decrypt_sample(&NIST_CTR_CIPHER, &sai, &key_info, &mut contexts)
            .unwrap();
        assert_eq!(output, NIST_PLAIN);
    }

    #[test]
    fn test_full_sample_cbc_leaves_tail() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([0; 16], 16));
        let sai = SampleAuxInfo::full_sample(&NIST_CBC_IV);
        let mut contexts = contexts(CipherMode::Cbc, &[Some(NIST_KEY)]);

        let mut sample = NIST_CBC_CIPHER.to_vec();
        sample.extend_from_slice(&[0x55; 15]);

        let output = SampleDecrypter::new(CipherMode::Cbc)
            .decrypt_sample(&sample, &sai, &key_info, &mut contexts)
            .unwrap();
        assert_eq!(output[..32], NIST_PLAIN);
        assert_eq!(output[32..], [0x55; 15]);
    }

    #[test]
    fn test_subsample_ctr_counter_spans_ranges() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([0; 16], 16));
        let mut sample = vec![0xC0; 3];
        sample.extend_from_slice(&NIST_CTR_CIPHER[..10]);
        sample.extend_from_slice(&[0xC1; 5]);
        sample.extend_from_slice(&NIST_CTR_CIPHER[10..]);

        let sai = SampleAuxInfo {
            subsamples: vec![Subsample::new(3, 10), Subsample::new(5, 22)],
            ..SampleAuxInfo::full_sample(&NIST_CTR_IV)
        };
        let mut contexts = contexts(CipherMode::Ctr, &[Some(NIST_KEY)]);

        let output = SampleDecrypter::new(CipherMode::Ctr)
            .decrypt_sample(&sample, &sai, &key_info, &mut contexts)
            .unwrap();
        assert_eq!(output[..3], [0xC0; 3]);
        assert_eq!(output[3..13], NIST_PLAIN[..10]);
        assert_eq!(output[13..18], [0xC1; 5]);
        assert_eq!(output[18..], NIST_PLAIN[10..]);
    }

    #[test]
    fn test_cbc_constant_iv_restarts_per_subsample() {
        let key_info =
            KeyInfoRecord::single(KeyEntry::with_constant_iv([0; 16], NIST_CBC_IV.to_vec()));
        let mut sample = vec![0x11; 4];
        sample.extend_from_slice(&NIST_CBC_CIPHER[..16]);
        sample.extend_from_slice(&[0x22; 2]);
        sample.extend_from_slice(&NIST_CBC_CIPHER[..16]);

        let sai = SampleAuxInfo {
            ivs: Vec::new(),
            subsamples: vec![Subsample::new(4, 16), Subsample::new(2, 16)],
        };
        let mut contexts = contexts(CipherMode::Cbc, &[Some(NIST_KEY)]);

        let output = SampleDecrypter::new(CipherMode::Cbc)
            .decrypt_sample(&sample, &sai, &key_info, &mut contexts)
            .unwrap();
        assert_eq!(output[4..20], NIST_PLAIN[..16]);
        assert_eq!(output[22..], NIST_PLAIN[..16]);
    }

    #[test]
    fn test_cbc_per_sample_iv_chains_across_subsamples() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([0; 16], 16));
        let mut sample = vec![0x11; 4];
        sample.extend_from_slice(&NIST_CBC_CIPHER[..16]);
        sample.extend_from_slice(&[0x22; 2]);
        sample.extend_from_slice(&NIST_CBC_CIPHER[16..]);

        let sai = SampleAuxInfo {
            subsamples: vec![Subsample::new(4, 16), Subsample::new(2, 16)],
            ..SampleAuxInfo::full_sample(&NIST_CBC_IV)
        };
        let mut contexts = contexts(CipherMode::Cbc, &[Some(NIST_KEY)]);

        let output = SampleDecrypter::new(CipherMode::Cbc)
            .decrypt_sample(&sample, &sai, &key_info, &mut contexts)
            .unwrap();
        assert_eq!(output[4..20], NIST_PLAIN[..16]);
        assert_eq!(output[22..], NIST_PLAIN[16..]);
    }

    #[test]
    fn test_pattern_ranges() {
        let decrypter = SampleDecrypter::new(CipherMode::Cbc).pattern(Some(CryptPattern::new(1, 9)));
        assert_eq!(decrypter.crypt_ranges(0, 160), vec![(0, 16)]);
        assert_eq!(
            decrypter.crypt_ranges(10, 10 + 336),
            vec![(10, 26), (170, 186), (330, 346)]
        );
        // partial crypt block at the end stays clear under CBC
        assert_eq!(decrypter.crypt_ranges(10, 10 + 330), vec![(10, 26), (170, 186)]);
        assert_eq!(decrypter.crypt_ranges(0, 8), Vec::<(usize, usize)>::new());

        let ctr = SampleDecrypter::new(CipherMode::Ctr).pattern(Some(CryptPattern::new(2, 1)));
        assert_eq!(ctr.crypt_ranges(0, 60), vec![(0, 32), (48, 60)]);
    }

    #[test]
    fn test_inactive_pattern_is_dropped() {
        let decrypter = SampleDecrypter::new(CipherMode::Cbc).pattern(Some(CryptPattern::new(1, 0)));
        assert!(decrypter.pattern.is_none());
        assert_eq!(decrypter.crypt_ranges(0, 40), vec![(0, 32)]);
    }

    #[test]
    fn test_cens_pattern_keystream_skips_clear_blocks() {
        let key = NIST_KEY;
        let iv = NIST_CTR_IV;
        let plain: Vec<u8> = (0..64u8).collect();

        let mut keystream_input = plain[..16].to_vec();
        keystream_input.extend_from_slice(&plain[32..48]);
        apply_ctr(&key, &iv, &mut keystream_input);

        let mut sample = plain.clone();
        sample[..16].copy_from_slice(&keystream_input[..16]);
        sample[32..48].copy_from_slice(&keystream_input[16..]);

        let key_info = KeyInfoRecord::single(KeyEntry::new([0; 16], 16));
        let sai = SampleAuxInfo {
            subsamples: vec![Subsample::new(0, 64)],
            ..SampleAuxInfo::full_sample(&iv)
        };
        let mut contexts = contexts(CipherMode::Ctr, &[Some(key)]);

        let output = SampleDecrypter::new(CipherMode::Ctr)
            .pattern(Some(CryptPattern::new(1, 1)))
            .decrypt_sample(&sample, &sai, &key_info, &mut contexts)
            .unwrap();
        assert_eq!(output, plain);
    }

    #[test]
    fn test_layout_mismatch_rejected_before_decrypting() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([0; 16], 16));
        let sai = SampleAuxInfo {
            subsamples: vec![Subsample::new(0, 64)],
            ..SampleAuxInfo::full_sample(&NIST_CTR_IV)
        };
        let mut contexts = contexts(CipherMode::Ctr, &[Some(NIST_KEY)]);

        let result = SampleDecrypter::new(CipherMode::Ctr).decrypt_sample(
            &NIST_CTR_CIPHER,
            &sai,
            &key_info,
            &mut contexts,
        );
        assert!(result.unwrap_err().is_malformed());
        assert!(!contexts[0].is_initialized());
    }

    #[test]
    fn test_missing_key_policies() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([9; 16], 8));
        let sai = SampleAuxInfo {
            subsamples: vec![Subsample::new(2, 6)],
            ..SampleAuxInfo::full_sample(&[0; 8])
        };
        let sample = [0xAA; 8];

        let run = |policy| {
            let mut contexts = contexts(CipherMode::Ctr, &[None]);
            SampleDecrypter::new(CipherMode::Ctr)
                .policy(policy)
                .decrypt_sample(&sample, &sai, &key_info, &mut contexts)
        };

        assert!(matches!(
            run(DecryptPolicy::Full),
            Err(DecryptError::KeyNotFound { slot: 1, .. })
        ));
        assert_eq!(run(DecryptPolicy::NoKey).unwrap(), sample);
        assert_eq!(run(DecryptPolicy::Skip).unwrap(), sample);
        assert_eq!(
            run(DecryptPolicy::Pad0).unwrap(),
            [0xAA, 0xAA, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            run(DecryptPolicy::Pad1).unwrap(),
            [0xAA, 0xAA, 1, 1, 1, 1, 1, 1]
        );
        assert_eq!(
            run(DecryptPolicy::PadStartCode).unwrap(),
            [0xAA, 0xAA, 0, 0, 1, 0, 0, 1]
        );
    }

    #[test]
    fn test_clear_key_index_zero() {
        let key_info = KeyInfoRecord::multi(vec![KeyEntry::new([1; 16], 16)]);
        let sai = SampleAuxInfo {
            ivs: Vec::new(),
            subsamples: vec![Subsample::with_key(0, 16, 0)],
        };
        let mut contexts = contexts(CipherMode::Ctr, &[None]);

        let output = SampleDecrypter::new(CipherMode::Ctr)
            .decrypt_sample(&[0x42; 16], &sai, &key_info, &mut contexts)
            .unwrap();
        assert_eq!(output, [0x42; 16]);
    }

    #[test]
    fn test_unseeded_slot_rejected() {
        let key_info = KeyInfoRecord::multi(vec![
            KeyEntry::new([1; 16], 16),
            KeyEntry::new([2; 16], 16),
        ]);
        let sai = SampleAuxInfo {
            ivs: vec![IvInit {
                key_index: 1,
                iv: vec![0; 16],
            }],
            subsamples: vec![Subsample::with_key(0, 16, 2)],
        };
        let mut contexts = contexts(CipherMode::Ctr, &[Some([1; 16]), Some([2; 16])]);

        let result = SampleDecrypter::new(CipherMode::Ctr).decrypt_sample(
            &[0; 16],
            &sai,
            &key_info,
            &mut contexts,
        );
        assert!(result.unwrap_err().is_malformed());
    }

    #[test]
    fn test_iv_patch_ignores_later_ivs() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([0; 16], 16));
        let mut contexts = contexts(CipherMode::Ctr, &[Some(NIST_KEY)]);
        let decrypter = SampleDecrypter::new(CipherMode::Ctr).iv_patch(true);

        let first = SampleAuxInfo::full_sample(&NIST_CTR_IV);
        let bogus = SampleAuxInfo::full_sample(&[0x99; 16]);

        let a = decrypter
            .decrypt_sample(&NIST_CTR_CIPHER[..16], &first, &key_info, &mut contexts)
            .unwrap();
        let b = decrypter
            .decrypt_sample(&NIST_CTR_CIPHER[16..], &bogus, &key_info, &mut contexts)
            .unwrap();
        assert_eq!(a, NIST_PLAIN[..16]);
        assert_eq!(b, NIST_PLAIN[16..]);
    }
}
