use crate::{
    error::{DecryptError, Result},
    scheme::CipherMode,
};
use aes::{
    Aes128,
    cipher::{
        BlockDecrypt, BlockDecryptMut, KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek,
        block_padding::Pkcs7, generic_array::GenericArray,
    },
};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128Cbc = cbc::Decryptor<Aes128>;

/// AES state of one key slot.
///
/// CTR contexts keep their keystream position between calls, CBC contexts keep the last
/// ciphertext block as chaining value. Both start over from the stored IV on [`seed_iv`]
/// and [`restart`].
///
/// [`seed_iv`]: CipherContext::seed_iv
/// [`restart`]: CipherContext::restart
pub struct CipherContext {
    mode: CipherMode,
    key: Option<[u8; 16]>,
    block: Option<Aes128>,
    iv: [u8; 16],
    initialized: bool,
    ctr: Option<Aes128Ctr>,
    chain: [u8; 16],
}

impl CipherContext {
    pub fn new(mode: CipherMode) -> Self {
        Self {
            mode,
            key: None,
            block: None,
            iv: [0; 16],
            initialized: false,
            ctr: None,
            chain: [0; 16],
        }
    }

    pub fn with_key(mode: CipherMode, key: &[u8; 16]) -> Self {
        let mut context = Self::new(mode);
        context.set_key(key);
        context
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn set_key(&mut self, key: &[u8; 16]) {
        self.key = Some(*key);
        self.block = Some(Aes128::new(GenericArray::from_slice(key)));
        self.initialized = false;
        self.ctr = None;
    }

    /// Forget the key. The slot is then treated as unresolved.
    pub fn invalidate(&mut self) {
        self.key = None;
        self.block = None;
        self.ctr = None;
        self.initialized = false;
    }

    pub fn key_valid(&self) -> bool {
        self.key.is_some()
    }

    /// True once an IV has been applied since the key was set.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    /// Load an 8 or 16 byte IV, right padded with zeros, and restart the cipher from it.
    pub fn seed_iv(&mut self, iv: &[u8]) -> Result<()> {
        if iv.is_empty() || iv.len() > 16 {
            return Err(DecryptError::invalid(format!(
                "IV must be 1 to 16 bytes long (got {})",
                iv.len()
            )));
        }

        self.iv = [0; 16];
        self.iv[..iv.len()].copy_from_slice(iv);
        self.initialized = true;
        self.restart();
        Ok(())
    }

    /// Restart from the stored IV without changing it.
    pub fn restart(&mut self) {
        self.chain = self.iv;
        self.ctr = self.key.as_ref().map(|key| {
            Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&self.iv))
        });
    }

    /// Move the CTR keystream to an absolute byte position from the IV.
    pub fn seek(&mut self, position: u64) -> Result<()> {
        match self.ctr.as_mut() {
            Some(ctr) => ctr.try_seek(position).map_err(|_| {
                DecryptError::invalid(format!("cannot seek keystream to {}", position))
            }),
            None => Err(DecryptError::config("keystream seek without key or IV")),
        }
    }

    /// Decrypt in place. CBC only touches the largest multiple of 16 bytes.
    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
        match self.mode {
            CipherMode::Ctr => self.decrypt_ctr(data),
            CipherMode::Cbc => self.decrypt_cbc(data),
        }
    }

    fn decrypt_ctr(&mut self, data: &mut [u8]) -> Result<()> {
        let ctr = self
            .ctr
            .as_mut()
            .ok_or_else(|| DecryptError::config("CTR context used before key and IV"))?;
        ctr.apply_keystream(data);
        Ok(())
    }

    fn decrypt_cbc(&mut self, data: &mut [u8]) -> Result<()> {
        let block = self
            .block
            .as_ref()
            .ok_or_else(|| DecryptError::config("CBC context used without key"))?;

        let full = data.len() / 16 * 16;
        for chunk in data[..full].chunks_exact_mut(16) {
            let mut ciphertext = [0; 16];
            ciphertext.copy_from_slice(chunk);

            block.decrypt_block(GenericArray::from_mut_slice(chunk));
            for (x, y) in chunk.iter_mut().zip(self.chain.iter()) {
                *x ^= y;
            }
            self.chain = ciphertext;
        }

        Ok(())
    }
}

/// One shot AES-128-CBC decryption with PKCS#7 padding removal.
pub fn decrypt_cbc_padded(key: &[u8; 16], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(DecryptError::invalid(format!(
            "CBC payload of {} bytes is not a multiple of 16",
            data.len()
        )));
    }

    let mut buf = data.to_vec();
    let len = Aes128Cbc::new(key.into(), iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| DecryptError::invalid("invalid PKCS#7 padding"))?
        .len();
    buf.truncate(len);
    Ok(buf)
}

/// AES-128-CBC without padding, a trailing partial block is left as is.
pub fn decrypt_cbc_blocks(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    let mut context = CipherContext::with_key(CipherMode::Cbc, key);
    context.seed_iv(iv)?;
    context.decrypt(data)
}

/// AES-128-CTR keystream applied from the start of `iv`.
pub fn apply_ctr(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    Aes128Ctr::new(key.into(), iv.into()).apply_keystream(data);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;

    // NIST SP 800-38A, F.5.1 and F.2.1
    pub const NIST_KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];
    pub const NIST_PLAIN: [u8; 32] = [
        0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17,
        0x2a, 0xae, 0x2d, 0x8a, 0x57, 0x1e, 0x03, 0xac, 0x9c, 0x9e, 0xb7, 0x6f, 0xac, 0x45, 0xaf,
        0x8e, 0x51,
    ];
    pub const NIST_CTR_IV: [u8; 16] = [
        0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe,
        0xff,
    ];
    pub const NIST_CTR_CIPHER: [u8; 32] = [
        0x87, 0x4d, 0x61, 0x91, 0xb6, 0x20, 0xe3, 0x26, 0x1b, 0xef, 0x68, 0x64, 0x99, 0x0d, 0xb6,
        0xce, 0x98, 0x06, 0xf6, 0x6b, 0x79, 0x70, 0xfd, 0xff, 0x86, 0x17, 0x18, 0x7b, 0xb9, 0xff,
        0xfd, 0xff,
    ];
    pub const NIST_CBC_IV: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];
    pub const NIST_CBC_CIPHER: [u8; 32] = [
        0x76, 0x49, 0xab, 0xac, 0x81, 0x19, 0xb2, 0x46, 0xce, 0xe9, 0x8e, 0x9b, 0x12, 0xe9, 0x19,
        0x7d, 0x50, 0x86, 0xcb, 0x9b, 0x50, 0x72, 0x19, 0xee, 0x95, 0xdb, 0x11, 0x3a, 0x91, 0x76,
        0x78, 0xb2,
    ];

    pub fn encrypt_cbc(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
        let aes = Aes128::new(key.into());
        let mut chain = *iv;
        for chunk in data.chunks_exact_mut(16) {
            for (x, y) in chunk.iter_mut().zip(chain.iter()) {
                *x ^= y;
            }
            aes.encrypt_block(GenericArray::from_mut_slice(chunk));
            chain.copy_from_slice(chunk);
        }
    }

    #[test]
    fn test_ctr_nist_vector() {
        let mut context = CipherContext::with_key(CipherMode::Ctr, &NIST_KEY);
        context.seed_iv(&NIST_CTR_IV).unwrap();

        let mut data = NIST_CTR_CIPHER;
        context.decrypt(&mut data).unwrap();
        assert_eq!(data, NIST_PLAIN);
    }

    #[test]
    fn test_ctr_keystream_continues_across_calls() {
        let mut context = CipherContext::with_key(CipherMode::Ctr, &NIST_KEY);
        context.seed_iv(&NIST_CTR_IV).unwrap();

        let mut first = NIST_CTR_CIPHER[..7].to_vec();
        let mut second = NIST_CTR_CIPHER[7..].to_vec();
        context.decrypt(&mut first).unwrap();
        context.decrypt(&mut second).unwrap();
        first.extend(second);
        assert_eq!(first, NIST_PLAIN);
    }

    #[test]
    fn test_ctr_seek() {
        let mut context = CipherContext::with_key(CipherMode::Ctr, &NIST_KEY);
        context.seed_iv(&NIST_CTR_IV).unwrap();
        context.seek(20).unwrap();

        let mut data = NIST_CTR_CIPHER[20..].to_vec();
        context.decrypt(&mut data).unwrap();
        assert_eq!(data, NIST_PLAIN[20..]);
    }

    #[test]
    fn test_cbc_nist_vector_and_chain() {
        let mut context = CipherContext::with_key(CipherMode::Cbc, &NIST_KEY);
        context.seed_iv(&NIST_CBC_IV).unwrap();

        let mut first = NIST_CBC_CIPHER[..16].to_vec();
        let mut second = NIST_CBC_CIPHER[16..].to_vec();
        context.decrypt(&mut first).unwrap();
        context.decrypt(&mut second).unwrap();
        assert_eq!(first, NIST_PLAIN[..16]);
        assert_eq!(second, NIST_PLAIN[16..]);
    }

    #[test]
    fn test_cbc_leaves_partial_block() {
        let mut context = CipherContext::with_key(CipherMode::Cbc, &NIST_KEY);
        context.seed_iv(&NIST_CBC_IV).unwrap();

        let mut data = NIST_CBC_CIPHER[..16].to_vec();
        data.extend_from_slice(&[0xEE; 5]);
        context.decrypt(&mut data).unwrap();
        assert_eq!(data[..16], NIST_PLAIN[..16]);
        assert_eq!(data[16..], [0xEE; 5]);
    }

    #[test]
    fn test_one_shot_cbc_blocks() {
        let mut data = NIST_CBC_CIPHER.to_vec();
        data.extend_from_slice(&[0xEE; 3]);
        decrypt_cbc_blocks(&NIST_KEY, &NIST_CBC_IV, &mut data).unwrap();
        assert_eq!(data[..32], NIST_PLAIN);
        assert_eq!(data[32..], [0xEE; 3]);
    }

    #[test]
    fn test_restart_reuses_iv() {
        let mut context = CipherContext::with_key(CipherMode::Cbc, &NIST_KEY);
        context.seed_iv(&NIST_CBC_IV).unwrap();

        let mut first = NIST_CBC_CIPHER[..16].to_vec();
        context.decrypt(&mut first).unwrap();
        context.restart();
        let mut again = NIST_CBC_CIPHER[..16].to_vec();
        context.decrypt(&mut again).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_short_iv_is_right_padded() {
        let mut context = CipherContext::with_key(CipherMode::Ctr, &NIST_KEY);
        context.seed_iv(&[0xAB; 8]).unwrap();
        assert_eq!(context.iv()[..8], [0xAB; 8]);
        assert_eq!(context.iv()[8..], [0; 8]);
        assert!(context.seed_iv(&[0; 17]).is_err());
    }

    #[test]
    fn test_missing_key() {
        let mut context = CipherContext::new(CipherMode::Ctr);
        context.seed_iv(&[0; 16]).unwrap();
        assert!(!context.key_valid());
        assert!(context.decrypt(&mut [0; 16]).is_err());

        context.set_key(&NIST_KEY);
        context.invalidate();
        assert!(!context.key_valid());
    }

    #[test]
    fn test_padded_cbc() {
        let mut data = b"sample payload".to_vec();
        data.extend_from_slice(&[2, 2]);
        encrypt_cbc(&NIST_KEY, &NIST_CBC_IV, &mut data);

        let plain = decrypt_cbc_padded(&NIST_KEY, &NIST_CBC_IV, &data).unwrap();
        assert_eq!(plain, b"sample payload");
        assert!(decrypt_cbc_padded(&NIST_KEY, &NIST_CBC_IV, &data[..15]).is_err());
    }
}
