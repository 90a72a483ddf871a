use super::{IvInit, SampleAuxInfo, Subsample};
use crate::{
    error::{DecryptError, Result},
    key_info::KeyInfoRecord,
    reader::Reader,
};

impl SampleAuxInfo {
    /// Decode an inline record. The key descriptor selects single or multi-key layout
    /// and provides the IV size of every slot.
    pub fn parse(data: &[u8], key_info: &KeyInfoRecord) -> Result<Self> {
        let mut reader = Reader::new(data);

        let sai = if key_info.multi_key {
            parse_multi_key(&mut reader, key_info)?
        } else {
            parse_single_key(&mut reader, key_info)?
        };

        if reader.has_more_data() {
            return Err(DecryptError::invalid(format!(
                "{} trailing bytes in sample auxiliary information",
                reader.remaining()
            )));
        }

        Ok(sai)
    }

    pub fn to_bytes(&self, key_info: &KeyInfoRecord) -> Result<Vec<u8>> {
        let mut data = Vec::new();

        if key_info.multi_key {
            data.extend_from_slice(&(self.ivs.len() as u16).to_be_bytes());
            for init in &self.ivs {
                data.extend_from_slice(&init.key_index.to_be_bytes());
                data.extend_from_slice(&init.iv);
            }
            data.extend_from_slice(&(self.subsamples.len() as u32).to_be_bytes());
            for subsample in &self.subsamples {
                data.extend_from_slice(&subsample.key_index.to_be_bytes());
                data.extend_from_slice(&subsample.clear_bytes.to_be_bytes());
                data.extend_from_slice(&subsample.encrypted_bytes.to_be_bytes());
            }
        } else {
            let entry = key_info
                .entry(1)
                .ok_or_else(|| DecryptError::invalid("key descriptor has no entries"))?;

            if entry.iv_size != 0 {
                let iv = self.iv_for(1).ok_or_else(|| {
                    DecryptError::invalid("single key record requires a per-sample IV")
                })?;
                data.extend_from_slice(iv);
            }

            if !self.subsamples.is_empty() {
                data.extend_from_slice(&(self.subsamples.len() as u16).to_be_bytes());
                for subsample in &self.subsamples {
                    data.extend_from_slice(&subsample.clear_bytes.to_be_bytes());
                    data.extend_from_slice(&subsample.encrypted_bytes.to_be_bytes());
                }
            }
        }

        Ok(data)
    }
}

fn parse_single_key(reader: &mut Reader, key_info: &KeyInfoRecord) -> Result<SampleAuxInfo> {
    let entry = key_info
        .entry(1)
        .ok_or_else(|| DecryptError::invalid("key descriptor has no entries"))?;

    let mut sai = SampleAuxInfo::default();

    if entry.iv_size != 0 {
        let iv = reader.read_bytes_u8(entry.iv_size as usize)?;
        sai.ivs.push(IvInit {
            key_index: 1,
            iv: iv.to_vec(),
        });
    }

    if reader.has_more_data() {
        let subsample_count = reader.read_u16()?;
        if reader.remaining() < subsample_count as usize * 6 {
            return Err(DecryptError::invalid(format!(
                "{} subsamples declared but only {} bytes left",
                subsample_count,
                reader.remaining()
            )));
        }

        for _ in 0..subsample_count {
            let clear_bytes = reader.read_u16()?;
            let encrypted_bytes = reader.read_u32()?;
            sai.subsamples
                .push(Subsample::new(clear_bytes, encrypted_bytes));
        }
    }

    Ok(sai)
}

fn parse_multi_key(reader: &mut Reader, key_info: &KeyInfoRecord) -> Result<SampleAuxInfo> {
    let mut sai = SampleAuxInfo::default();
    let iv_count = reader.read_u16()?;

    for _ in 0..iv_count {
        let key_index = reader.read_u16()?;
        let entry = key_info.entry(key_index).ok_or_else(|| {
            DecryptError::invalid(format!(
                "IV for key index {} but only {} keys are signalled",
                key_index,
                key_info.len()
            ))
        })?;

        if entry.iv_size == 0 {
            return Err(DecryptError::invalid(format!(
                "IV for key index {} which uses a constant IV",
                key_index
            )));
        }

        let iv = reader.read_bytes_u8(entry.iv_size as usize)?;
        sai.ivs.push(IvInit {
            key_index,
            iv: iv.to_vec(),
        });
    }

    let subsample_count = reader.read_u32()?;
    if (reader.remaining() as u64) < subsample_count as u64 * 8 {
        return Err(DecryptError::invalid(format!(
            "{} subsamples declared but only {} bytes left",
            subsample_count,
            reader.remaining()
        )));
    }

    for _ in 0..subsample_count {
        let key_index = reader.read_u16()?;
        let clear_bytes = reader.read_u16()?;
        let encrypted_bytes = reader.read_u32()?;

        if key_index != 0 && key_info.entry(key_index).is_none() {
            return Err(DecryptError::invalid(format!(
                "subsample uses key index {} but only {} keys are signalled",
                key_index,
                key_info.len()
            )));
        }

        sai.subsamples
            .push(Subsample::with_key(clear_bytes, encrypted_bytes, key_index));
    }

    Ok(sai)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::MalformedInput, key_info::KeyEntry};

    fn multi_key_info() -> KeyInfoRecord {
        KeyInfoRecord::multi(vec![
            KeyEntry::new([1; 16], 8),
            KeyEntry::new([2; 16], 16),
            KeyEntry::with_constant_iv([3; 16], vec![0x33; 16]),
        ])
    }

    #[test]
    fn test_single_key_with_subsamples() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([1; 16], 8));
        let data = [
            0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, // IV
            0x00, 0x02, // subsample count
            0x00, 0x05, 0x00, 0x00, 0x00, 0x20, // 5 clear, 32 encrypted
            0x00, 0x03, 0x00, 0x00, 0x00, 0x10, // 3 clear, 16 encrypted
        ];

        let sai = SampleAuxInfo::parse(&data, &key_info).unwrap();
        assert_eq!(sai.iv_for(1).unwrap(), &data[..8]);
        assert_eq!(
            sai.subsamples,
            vec![Subsample::new(5, 32), Subsample::new(3, 16)]
        );
        assert_eq!(sai.to_bytes(&key_info).unwrap(), data);
    }

    #[test]
    fn test_single_key_iv_only() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([1; 16], 16));
        let sai = SampleAuxInfo::parse(&[0xAB; 16], &key_info).unwrap();
        assert!(sai.is_full_sample());
        assert_eq!(sai.ivs.len(), 1);
    }

    #[test]
    fn test_single_key_constant_iv_has_no_iv_bytes() {
        let key_info = KeyInfoRecord::single(KeyEntry::with_constant_iv([1; 16], vec![0; 16]));
        let data = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20];

        let sai = SampleAuxInfo::parse(&data, &key_info).unwrap();
        assert!(sai.ivs.is_empty());
        assert_eq!(sai.subsamples, vec![Subsample::new(0, 32)]);
    }

    #[test]
    fn test_multi_key_record() {
        let key_info = multi_key_info();
        let sai = SampleAuxInfo {
            ivs: vec![
                IvInit {
                    key_index: 1,
                    iv: vec![0x01; 8],
                },
                IvInit {
                    key_index: 2,
                    iv: vec![0x02; 16],
                },
            ],
            subsamples: vec![
                Subsample::with_key(4, 16, 1),
                Subsample::with_key(4, 32, 2),
                Subsample::with_key(8, 0, 0),
                Subsample::with_key(0, 16, 3),
            ],
        };

        let data = sai.to_bytes(&key_info).unwrap();
        assert_eq!(data.len(), 2 + (2 + 8) + (2 + 16) + 4 + 4 * 8);
        assert_eq!(SampleAuxInfo::parse(&data, &key_info).unwrap(), sai);
    }

    #[test]
    fn test_multi_key_index_out_of_range() {
        let key_info = multi_key_info();
        let mut data = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        data.extend_from_slice(&[0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10]);

        assert!(matches!(
            SampleAuxInfo::parse(&data, &key_info),
            Err(DecryptError::Malformed(MalformedInput::Invalid(_)))
        ));
    }

    #[test]
    fn test_multi_key_iv_for_constant_slot_rejected() {
        let key_info = multi_key_info();
        let data = [0x00, 0x01, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00];
        assert!(SampleAuxInfo::parse(&data, &key_info).is_err());
    }

    #[test]
    fn test_declared_subsamples_exceed_buffer() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([1; 16], 8));
        let mut data = vec![0; 8];
        data.extend_from_slice(&[0xFF, 0xFF, 0x00, 0x01]);

        assert!(SampleAuxInfo::parse(&data, &key_info).is_err());

        let key_info = multi_key_info();
        let data = [0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(SampleAuxInfo::parse(&data, &key_info).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([1; 16], 8));
        let mut data = vec![0; 8];
        data.extend_from_slice(&[0x00, 0x01, 0, 0, 0, 0, 0, 16, 0xEE]);
        assert!(SampleAuxInfo::parse(&data, &key_info).is_err());
    }

    #[test]
    fn test_truncated_iv() {
        let key_info = KeyInfoRecord::single(KeyEntry::new([1; 16], 16));
        assert!(matches!(
            SampleAuxInfo::parse(&[0; 10], &key_info),
            Err(DecryptError::Malformed(MalformedInput::ShortRead { .. }))
        ));
    }
}
