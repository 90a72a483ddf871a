//! Multi-key descriptor used to signal KIDs, IV sizes and constant IVs.
//!
//! Layout (big endian):
//!
//! ```text
//! multi_key: u8
//! key_count: u16          (ignored when multi_key == 0, one entry follows)
//! entries[key_count] {
//!     iv_size: u8
//!     kid: [u8; 16]
//!     if iv_size == 0 {
//!         constant_iv_size: u8
//!         constant_iv: [u8; constant_iv_size]
//!     }
//! }
//! ```

use crate::{
    error::{DecryptError, MalformedInput, Result},
    reader::Reader,
};

/// One key slot of a [`KeyInfoRecord`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEntry {
    pub kid: [u8; 16],
    /// Per-sample IV size, 0 when a constant IV is used.
    pub iv_size: u8,
    pub constant_iv: Option<Vec<u8>>,
}

impl KeyEntry {
    pub fn new(kid: [u8; 16], iv_size: u8) -> Self {
        Self {
            kid,
            iv_size,
            constant_iv: None,
        }
    }

    pub fn with_constant_iv(kid: [u8; 16], constant_iv: Vec<u8>) -> Self {
        Self {
            kid,
            iv_size: 0,
            constant_iv: Some(constant_iv),
        }
    }

    pub fn kid_hex(&self) -> String {
        hex::encode(self.kid)
    }
}

/// Parsed key descriptor, entries are addressed with 1-based key indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyInfoRecord {
    pub multi_key: bool,
    pub entries: Vec<KeyEntry>,
}

impl KeyInfoRecord {
    pub fn single(entry: KeyEntry) -> Self {
        Self {
            multi_key: false,
            entries: vec![entry],
        }
    }

    pub fn multi(entries: Vec<KeyEntry>) -> Self {
        Self {
            multi_key: true,
            entries,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let multi_key = reader.read_u8()? != 0;
        let declared = reader.read_u16()?;
        let count = if multi_key { declared as usize } else { 1 };

        if multi_key && count == 0 {
            return Err(DecryptError::invalid("multi-key descriptor without keys"));
        }

        let mut entries = Vec::with_capacity(count.min(reader.remaining() / 17));

        for _ in 0..count {
            let iv_size = reader.read_u8()?;
            let kid = reader.read_array::<16>()?;

            if iv_size == 0 {
                let constant_iv_size = reader.read_u8()?;
                check_iv_size(constant_iv_size, "constant IV")?;
                let constant_iv = reader.read_bytes_u8(constant_iv_size as usize)?;
                entries.push(KeyEntry::with_constant_iv(kid, constant_iv.to_vec()));
            } else {
                check_iv_size(iv_size, "per-sample IV")?;
                entries.push(KeyEntry::new(kid, iv_size));
            }
        }

        if reader.has_more_data() {
            return Err(DecryptError::invalid(format!(
                "{} trailing bytes after {} key entries",
                reader.remaining(),
                count
            )));
        }

        Ok(Self { multi_key, entries })
    }

    /// Walk the descriptor without allocating. Fails closed on any short read.
    pub fn validate(data: &[u8]) -> bool {
        fn walk(data: &[u8]) -> std::result::Result<(), MalformedInput> {
            let mut reader = Reader::new(data);
            let multi_key = reader.read_u8()? != 0;
            let declared = reader.read_u16()?;
            let count = if multi_key { declared } else { 1 };

            if count == 0 {
                return Err(MalformedInput::Invalid(String::new()));
            }

            for _ in 0..count {
                let iv_size = reader.read_u8()?;
                reader.skip(16)?;

                let size = if iv_size == 0 {
                    let size = reader.read_u8()?;
                    reader.skip(size as usize)?;
                    size
                } else {
                    iv_size
                };

                if size != 8 && size != 16 {
                    return Err(MalformedInput::Invalid(String::new()));
                }
            }

            if reader.has_more_data() {
                return Err(MalformedInput::Invalid(String::new()));
            }

            Ok(())
        }

        walk(data).is_ok()
    }

    /// Serialise the descriptor. Records that [`parse`](Self::parse) would not read back
    /// unchanged are rejected.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let count = match (self.multi_key, self.entries.len()) {
            (false, 1) => 1,
            (false, x) => {
                return Err(DecryptError::invalid(format!(
                    "single-key descriptor with {} entries",
                    x
                )));
            }
            (true, 0) => return Err(DecryptError::invalid("multi-key descriptor without keys")),
            (true, x) => u16::try_from(x).map_err(|_| {
                DecryptError::invalid(format!("{} key entries do not fit a u16 count", x))
            })?,
        };

        let mut data = Vec::with_capacity(3 + self.entries.len() * 34);
        data.push(self.multi_key as u8);
        data.extend_from_slice(&count.to_be_bytes());

        for entry in &self.entries {
            data.push(entry.iv_size);
            data.extend_from_slice(&entry.kid);

            match (&entry.constant_iv, entry.iv_size) {
                (Some(iv), 0) => {
                    let size = u8::try_from(iv.len()).unwrap_or(u8::MAX);
                    check_iv_size(size, "constant IV")?;
                    data.push(size);
                    data.extend_from_slice(iv);
                }
                (None, 0) => {
                    return Err(DecryptError::invalid(format!(
                        "key {} has neither a per-sample IV size nor a constant IV",
                        entry.kid_hex()
                    )));
                }
                (Some(_), _) => {
                    return Err(DecryptError::invalid(format!(
                        "key {} has both a per-sample IV size and a constant IV",
                        entry.kid_hex()
                    )));
                }
                (None, size) => check_iv_size(size, "per-sample IV")?,
            }
        }

        Ok(data)
    }

    /// Entry for a 1-based key index.
    pub fn entry(&self, key_index: u16) -> Option<&KeyEntry> {
        (key_index as usize)
            .checked_sub(1)
            .and_then(|x| self.entries.get(x))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Content hash used to detect that a re-signalled descriptor did not change.
    pub fn hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[self.multi_key as u8]);
        hasher.update(&(self.entries.len() as u64).to_be_bytes());

        for entry in &self.entries {
            hasher.update(&[entry.iv_size]);
            hasher.update(&entry.kid);
            if let Some(iv) = &entry.constant_iv {
                hasher.update(&(iv.len() as u64).to_be_bytes());
                hasher.update(iv);
            }
        }

        hasher.finalize()
    }
}

fn check_iv_size(size: u8, what: &str) -> Result<()> {
    match size {
        8 | 16 => Ok(()),
        x => Err(DecryptError::invalid(format!(
            "{} size must be 8 or 16 bytes (got {})",
            what, x
        ))),
    }
}
