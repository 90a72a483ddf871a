//! HLS SAMPLE-AES (`saes`) sample decryption.
//!
//! Video samples are length prefixed AVC access units. Only slice NAL units (types 1 and 5)
//! longer than 48 bytes are protected:
//!
//! ```text
//! Encrypted_nal_unit () {
//!     nal_unit_type_byte                // 1 byte
//!     unencrypted_leader                // 31 bytes
//!     while (bytes_remaining() > 0) {
//!         if (bytes_remaining() > 16) {
//!             encrypted_block           // 16 bytes
//!         }
//!         unencrypted_block             // MIN(144, bytes_remaining()) bytes
//!     }
//! }
//! ```
//!
//! Audio frames keep a 16 byte clear leader, every following full block is encrypted and
//! a trailing partial block stays clear.

use crate::{
    cipher::{CipherContext, decrypt_cbc_blocks},
    error::{DecryptError, Result},
    reader::Reader,
    scheme::CipherMode,
};

/// Payload layout of a SAMPLE-AES stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleAesCodec {
    /// AVC samples with NAL units prefixed by a `nal_length_size` byte length.
    Avc { nal_length_size: u8 },
    /// AAC or AC-3 frames.
    Audio,
}

#[derive(Clone)]
pub struct SampleAesDecrypter {
    key: [u8; 16],
    iv: [u8; 16],
    codec: SampleAesCodec,
}

impl SampleAesDecrypter {
    pub fn new(key: &[u8; 16], iv: &[u8; 16], codec: SampleAesCodec) -> Result<Self> {
        if let SampleAesCodec::Avc { nal_length_size } = codec
            && !matches!(nal_length_size, 1 | 2 | 4)
        {
            return Err(DecryptError::config(format!(
                "unsupported NAL length size {}",
                nal_length_size
            )));
        }

        Ok(Self {
            key: *key,
            iv: *iv,
            codec,
        })
    }

    pub fn decrypt(&self, sample: &[u8]) -> Result<Vec<u8>> {
        match self.codec {
            SampleAesCodec::Avc { nal_length_size } => self.decrypt_avc(sample, nal_length_size),
            SampleAesCodec::Audio => self.decrypt_audio(sample),
        }
    }

    fn decrypt_avc(&self, sample: &[u8], nal_length_size: u8) -> Result<Vec<u8>> {
        let size = nal_length_size as usize;
        let mut reader = Reader::new(sample);
        let mut output = Vec::with_capacity(sample.len());

        while reader.has_more_data() {
            let length = reader.read_uint(size)? as usize;
            let nal = reader.read_bytes_u8(length).map_err(|_| {
                DecryptError::non_compliant(format!(
                    "NAL unit of {} bytes overruns the sample at offset {}",
                    length,
                    reader.get_position()
                ))
            })?;

            let nal_type = nal.first().map(|x| x & 0x1F).unwrap_or(0);

            if (nal_type == 1 || nal_type == 5) && nal.len() > 48 {
                let mut nal = remove_emulation_prevention(nal);
                self.decrypt_nal(&mut nal)?;
                write_length(&mut output, nal.len(), size)?;
                output.extend_from_slice(&nal);
            } else {
                write_length(&mut output, nal.len(), size)?;
                output.extend_from_slice(nal);
            }
        }

        Ok(output)
    }

    fn decrypt_nal(&self, nal: &mut [u8]) -> Result<()> {
        let mut context = CipherContext::with_key(CipherMode::Cbc, &self.key);
        context.seed_iv(&self.iv)?;

        let mut position = 32;
        while position < nal.len() {
            if nal.len() - position > 16 {
                context.decrypt(&mut nal[position..position + 16])?;
                position += 16;
            }
            position += 144.min(nal.len() - position);
        }

        Ok(())
    }

    fn decrypt_audio(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut output = frame.to_vec();
        if output.len() > 16 {
            decrypt_cbc_blocks(&self.key, &self.iv, &mut output[16..])?;
        }
        Ok(output)
    }
}

fn write_length(output: &mut Vec<u8>, length: usize, size: usize) -> Result<()> {
    if size < size_of::<usize>() && length >> (size * 8) != 0 {
        return Err(DecryptError::invalid(format!(
            "NAL unit of {} bytes does not fit a {} byte length field",
            length, size
        )));
    }

    output.extend_from_slice(&(length as u64).to_be_bytes()[8 - size..]);
    Ok(())
}

/// Strip `emulation_prevention_three_byte`s (`00 00 03` becomes `00 00`).
///
/// A `03` is only removed when the byte after it is `00` to `03`, as in a conformant
/// stream. A trailing `00 00 03` is kept.
pub fn remove_emulation_prevention(nal: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(nal.len());
    let mut zeros = 0;

    for (i, x) in nal.iter().enumerate() {
        if zeros >= 2 && *x == 3 && nal.get(i + 1).is_some_and(|next| *next <= 3) {
            zeros = 0;
            continue;
        }

        zeros = if *x == 0 { zeros + 1 } else { 0 };
        output.push(*x);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::tests::{NIST_CBC_IV, NIST_KEY, encrypt_cbc};

    fn encrypt_nal(nal: &mut [u8]) {
        let mut chain = NIST_CBC_IV;
        let mut position = 32;
        while position < nal.len() {
            if nal.len() - position > 16 {
                let block = &mut nal[position..position + 16];
                encrypt_cbc(&NIST_KEY, &chain, block);
                chain.copy_from_slice(block);
                position += 16;
            }
            position += 144.min(nal.len() - position);
        }
    }

    #[test]
    fn test_emulation_prevention_removed() {
        assert_eq!(
            remove_emulation_prevention(&[0x65, 0, 0, 3, 1, 0, 0, 3, 0, 0, 3]),
            vec![0x65, 0, 0, 1, 0, 0, 0, 0, 3]
        );
        assert_eq!(remove_emulation_prevention(&[0, 3, 0]), vec![0, 3, 0]);
    }

    #[test]
    fn test_emulation_prevention_edges_kept() {
        assert_eq!(
            remove_emulation_prevention(&[0x65, 0xAA, 0, 0, 3]),
            vec![0x65, 0xAA, 0, 0, 3]
        );
        assert_eq!(
            remove_emulation_prevention(&[0x65, 0, 0, 3, 0x80]),
            vec![0x65, 0, 0, 3, 0x80]
        );
    }

    #[test]
    fn test_short_and_non_slice_nals_untouched() {
        let decrypter = SampleAesDecrypter::new(
            &NIST_KEY,
            &NIST_CBC_IV,
            SampleAesCodec::Avc { nal_length_size: 4 },
        )
        .unwrap();

        let mut sample = vec![0, 0, 0, 48, 0x65];
        sample.extend_from_slice(&[0xAB; 47]);
        sample.extend_from_slice(&[0, 0, 0, 60, 0x06]);
        sample.extend_from_slice(&[0, 0, 3, 1]);
        sample.extend_from_slice(&[0xCD; 55]);

        assert_eq!(decrypter.decrypt(&sample).unwrap(), sample);
    }

    #[test]
    fn test_slice_block_walk() {
        // header + 31 byte leader, 16 encrypted, 144 clear, 16 encrypted, 10 clear
        let mut plain = vec![0x65];
        plain.extend((1..218).map(|x| (x % 251) as u8 | 0x10));
        assert_eq!(plain.len(), 218);

        let mut nal = plain.clone();
        encrypt_nal(&mut nal);
        assert_ne!(nal[32..48], plain[32..48]);
        assert_eq!(nal[48..192], plain[48..192]);
        assert_ne!(nal[192..208], plain[192..208]);

        let mut sample = (nal.len() as u16).to_be_bytes().to_vec();
        sample.extend_from_slice(&nal);

        let decrypter = SampleAesDecrypter::new(
            &NIST_KEY,
            &NIST_CBC_IV,
            SampleAesCodec::Avc { nal_length_size: 2 },
        )
        .unwrap();
        let output = decrypter.decrypt(&sample).unwrap();
        assert_eq!(output[..2], [0, 218]);
        assert_eq!(output[2..], plain);
    }

    #[test]
    fn test_last_block_needs_more_than_sixteen_bytes() {
        // leader, 16 encrypted, 144 clear, then exactly 16 bytes left which stay clear
        let mut plain = vec![0x41];
        plain.extend((1..208).map(|x| (x % 200) as u8 | 0x20));

        let mut nal = plain.clone();
        encrypt_nal(&mut nal);
        assert_eq!(nal[192..], plain[192..]);

        let mut sample = vec![0, 208];
        sample.extend_from_slice(&nal);

        let decrypter = SampleAesDecrypter::new(
            &NIST_KEY,
            &NIST_CBC_IV,
            SampleAesCodec::Avc { nal_length_size: 2 },
        )
        .unwrap();
        assert_eq!(decrypter.decrypt(&sample).unwrap()[2..], plain);
    }

    #[test]
    fn test_emulation_bytes_shrink_length_field() {
        let mut nal = vec![0x65];
        nal.extend_from_slice(&[0x11; 20]);
        nal.extend_from_slice(&[0, 0, 3, 1]);
        nal.extend_from_slice(&[0x22; 40]);

        let mut sample = (nal.len() as u32).to_be_bytes().to_vec();
        sample.extend_from_slice(&nal);

        let decrypter = SampleAesDecrypter::new(
            &NIST_KEY,
            &NIST_CBC_IV,
            SampleAesCodec::Avc { nal_length_size: 4 },
        )
        .unwrap();
        let output = decrypter.decrypt(&sample).unwrap();
        assert_eq!(output.len(), sample.len() - 1);
        assert_eq!(output[..4], (nal.len() as u32 - 1).to_be_bytes());
        assert_eq!(output[4 + 21..4 + 24], [0, 0, 1]);
    }

    #[test]
    fn test_truncated_nal() {
        let decrypter = SampleAesDecrypter::new(
            &NIST_KEY,
            &NIST_CBC_IV,
            SampleAesCodec::Avc { nal_length_size: 4 },
        )
        .unwrap();
        let result = decrypter.decrypt(&[0, 0, 0, 90, 0x65, 1, 2, 3]);
        assert!(result.unwrap_err().is_malformed());
        assert!(
            SampleAesDecrypter::new(
                &NIST_KEY,
                &NIST_CBC_IV,
                SampleAesCodec::Avc { nal_length_size: 3 }
            )
            .is_err()
        );
    }

    #[test]
    fn test_audio_frame() {
        let plain: Vec<u8> = (0..16 + 32 + 7).map(|x| x as u8).collect();
        let mut frame = plain.clone();
        encrypt_cbc(&NIST_KEY, &NIST_CBC_IV, &mut frame[16..48]);

        let decrypter =
            SampleAesDecrypter::new(&NIST_KEY, &NIST_CBC_IV, SampleAesCodec::Audio).unwrap();
        assert_eq!(decrypter.decrypt(&frame).unwrap(), plain);
    }
}
