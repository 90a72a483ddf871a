//! Sample formats of the pre-CENC schemes: ISMACryp (`iAEC`), OMA DRM (`odkm`) and
//! Adobe Access (`adkm`).

use crate::{
    cipher::{CipherContext, decrypt_cbc_padded},
    error::{DecryptError, Result},
    reader::Reader,
    scheme::CipherMode,
};

/// Access unit header layout declared by an ISMACryp or OMA stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsmaSampleFormat {
    pub selective_encryption: bool,
    pub key_indicator_length: u8,
    /// Size of the byte stream offset field, 0 when the offset comes with the packet.
    pub iv_length: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsmaSample<'a> {
    pub encrypted: bool,
    pub bso: Option<u64>,
    pub key_indicator: &'a [u8],
    pub payload: &'a [u8],
}

impl IsmaSampleFormat {
    pub fn parse<'a>(&self, data: &'a [u8]) -> Result<IsmaSample<'a>> {
        let mut reader = Reader::new(data);

        let encrypted = if self.selective_encryption {
            reader.read_u8()? & 0x80 != 0
        } else {
            true
        };

        let mut bso = None;
        let mut key_indicator: &[u8] = &[];

        if encrypted {
            if self.iv_length != 0 {
                bso = Some(reader.read_uint(self.iv_length as usize)?);
            }
            key_indicator = reader.read_bytes_u8(self.key_indicator_length as usize)?;
        }

        Ok(IsmaSample {
            encrypted,
            bso,
            key_indicator,
            payload: reader.read_remaining(),
        })
    }
}

/// AES-128-CTR keystream addressed by byte stream offset.
///
/// The counter block is `salt || u64(bso / 16)` and `bso % 16` keystream bytes are
/// discarded. The keystream is only repositioned when a packet does not continue where
/// the previous one ended.
pub struct IsmaDecrypter {
    context: CipherContext,
    salt: [u8; 8],
    next_bso: Option<u64>,
}

impl IsmaDecrypter {
    pub fn new(key: &[u8; 16], salt: &[u8; 8]) -> Self {
        Self {
            context: CipherContext::with_key(CipherMode::Ctr, key),
            salt: *salt,
            next_bso: None,
        }
    }

    /// Offset right after the last decrypted packet.
    pub fn next_bso(&self) -> u64 {
        self.next_bso.unwrap_or(0)
    }

    pub fn decrypt(&mut self, data: &[u8], bso: u64) -> Result<Vec<u8>> {
        if self.next_bso != Some(bso) {
            log::trace!("resync ISMA keystream at byte offset {}", bso);
            let mut iv = [0; 16];
            iv[..8].copy_from_slice(&self.salt);
            self.context.seed_iv(&iv)?;
            self.context.seek(bso)?;
        }

        let mut output = data.to_vec();
        self.context.decrypt(&mut output)?;
        self.next_bso = bso.checked_add(data.len() as u64);
        Ok(output)
    }
}

/// OMA DRM access unit: optional selective encryption byte, 16 byte IV and
/// AES-128-CBC ciphertext with PKCS#7 padding.
pub fn decrypt_oma(key: &[u8; 16], data: &[u8], selective_encryption: bool) -> Result<Vec<u8>> {
    let mut reader = Reader::new(data);

    if selective_encryption && reader.read_u8()? & 0x80 == 0 {
        return Ok(reader.read_remaining().to_vec());
    }

    let iv = reader.read_array::<16>()?;
    decrypt_cbc_padded(key, &iv, reader.read_remaining())
}

/// Adobe access unit: a flag byte (bit 7 set when encrypted), then for encrypted units a
/// 16 byte IV and AES-128-CBC ciphertext with PKCS#7 padding.
pub fn decrypt_adobe(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    let mut reader = Reader::new(data);
    let flags = reader
        .read_u8()
        .map_err(|_| DecryptError::non_compliant("empty Adobe access unit"))?;

    if flags & 0x80 == 0 {
        return Ok(reader.read_remaining().to_vec());
    }

    let iv = reader.read_array::<16>()?;
    decrypt_cbc_padded(key, &iv, reader.read_remaining())
}
