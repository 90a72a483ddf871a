/*
    REFERENCES
    ----------

    1. https://github.com/shaka-project/shaka-packager/blob/56e227267c9091a0f65b4d92d9064dda4557f3a7/packager/tools/pssh/pssh-box.py
    2. https://w3c.github.io/encrypted-media/format-registry/initdata/cenc.html

*/

use crate::{
    cipher::apply_ctr,
    error::{DecryptError, Result},
    reader::Reader,
};
use aes::{
    Aes128,
    cipher::{BlockDecrypt, KeyInit, generic_array::GenericArray},
};

pub const COMMON_SYSTEM_ID: [u8; 16] = hex_id(b"1077efecc0b24d02ace33c1e52e2fb4b");
pub const PLAYREADY_SYSTEM_ID: [u8; 16] = hex_id(b"9a04f07998404286ab92e65be0885f95");
pub const WIDEVINE_SYSTEM_ID: [u8; 16] = hex_id(b"edef8ba979d64acea3c827dcd51d21ed");
/// Test system whose private data carries wrapped content keys.
pub const BOOTSTRAP_SYSTEM_ID: [u8; 16] = hex_id(b"6770616363656e6364726d746f6f6c31");

const BOOTSTRAP_IV: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];

const fn hex_id(value: &[u8; 32]) -> [u8; 16] {
    const fn nibble(x: u8) -> u8 {
        match x {
            b'0'..=b'9' => x - b'0',
            b'a'..=b'f' => x - b'a' + 10,
            _ => 0,
        }
    }

    let mut id = [0; 16];
    let mut i = 0;
    while i < 16 {
        id[i] = (nibble(value[2 * i]) << 4) | nibble(value[2 * i + 1]);
        i += 1;
    }
    id
}

/// Protection system specific header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PsshRecord {
    pub system_id: [u8; 16],
    pub version: u32,
    /// Only carried by version 1 and later.
    pub kids: Vec<[u8; 16]>,
    pub private_data: Vec<u8>,
}

impl PsshRecord {
    /// Parse a property list: `count:u32` followed by `count` records.
    pub fn parse_list(data: &[u8]) -> Result<Vec<Self>> {
        let mut reader = Reader::new(data);
        let count = reader.read_u32()?;
        let mut records = Vec::new();

        for _ in 0..count {
            records.push(Self::read_record(&mut reader)?);
        }

        if reader.has_more_data() {
            return Err(DecryptError::invalid(format!(
                "{} trailing bytes after {} protection headers",
                reader.remaining(),
                count
            )));
        }

        Ok(records)
    }

    /// Parse one or more concatenated `pssh` boxes.
    pub fn parse_boxes(data: &[u8]) -> Result<Vec<Self>> {
        let mut reader = Reader::new(data);
        let mut records = Vec::new();

        while reader.has_more_data() {
            let size = reader.read_u32()? as usize;
            let box_type = reader.read_array::<4>()?;

            if &box_type != b"pssh" || size < 12 {
                return Err(DecryptError::invalid(format!(
                    "expected a pssh box, found {:?} of {} bytes",
                    String::from_utf8_lossy(&box_type),
                    size
                )));
            }

            let mut body = Reader::new(reader.read_bytes_u8(size - 8)?);
            let version = body.read_u8()? as u32;
            body.skip(3)?;

            let system_id = body.read_array::<16>()?;
            let record = Self::read_body(&mut body, system_id, version)?;

            if body.has_more_data() {
                return Err(DecryptError::invalid("trailing bytes inside pssh box"));
            }

            records.push(record);
        }

        Ok(records)
    }

    /// Accept either the property list or `pssh` boxes.
    pub fn parse_any(data: &[u8]) -> Result<Vec<Self>> {
        if data.get(4..8) == Some(&b"pssh"[..]) {
            Self::parse_boxes(data)
        } else {
            Self::parse_list(data)
        }
    }

    fn read_record(reader: &mut Reader) -> Result<Self> {
        let system_id = reader.read_array::<16>()?;
        let version = reader.read_u32()?;
        Self::read_body(reader, system_id, version)
    }

    fn read_body(reader: &mut Reader, system_id: [u8; 16], version: u32) -> Result<Self> {
        let mut kids = Vec::new();

        if version > 0 {
            let kid_count = reader.read_u32()? as usize;
            if reader.remaining() / 16 < kid_count {
                return Err(DecryptError::invalid(format!(
                    "{} KIDs declared but only {} bytes left",
                    kid_count,
                    reader.remaining()
                )));
            }

            for _ in 0..kid_count {
                kids.push(reader.read_array::<16>()?);
            }
        }

        let data_size = reader.read_u32()? as usize;
        let private_data = reader.read_bytes_u8(data_size)?.to_vec();

        Ok(Self {
            system_id,
            version,
            kids,
            private_data,
        })
    }

    fn write_record(&self, data: &mut Vec<u8>) {
        data.extend_from_slice(&self.system_id);
        data.extend_from_slice(&self.version.to_be_bytes());
        if self.version > 0 {
            data.extend_from_slice(&(self.kids.len() as u32).to_be_bytes());
            for kid in &self.kids {
                data.extend_from_slice(kid);
            }
        }
        data.extend_from_slice(&(self.private_data.len() as u32).to_be_bytes());
        data.extend_from_slice(&self.private_data);
    }

    pub fn list_to_bytes(records: &[Self]) -> Vec<u8> {
        let mut data = (records.len() as u32).to_be_bytes().to_vec();
        for record in records {
            record.write_record(&mut data);
        }
        data
    }

    /// Content hash of a protection header list.
    pub fn hash_list(records: &[Self]) -> blake3::Hash {
        blake3::hash(&Self::list_to_bytes(records))
    }

    pub fn system_name(&self) -> &'static str {
        match self.system_id {
            COMMON_SYSTEM_ID => "common",
            PLAYREADY_SYSTEM_ID => "playready",
            WIDEVINE_SYSTEM_ID => "widevine",
            BOOTSTRAP_SYSTEM_ID => "bootstrap",
            _ => "unknown",
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        self.system_id == BOOTSTRAP_SYSTEM_ID
    }

    /// URL announced in bootstrap private data.
    pub fn bootstrap_url(&self) -> Option<String> {
        let (url, _) = self.bootstrap_parts().ok()?;
        Some(String::from_utf8_lossy(url).into_owned())
    }

    fn bootstrap_parts(&self) -> Result<(&[u8], &[u8])> {
        let mut reader = Reader::new(&self.private_data);
        let url_length = reader.read_u8()?;
        let url = reader.read_bytes_u8(url_length as usize)?;
        Ok((url, reader.read_remaining()))
    }

    /// Recover `(kid, key)` pairs from bootstrap private data.
    ///
    /// `url_len:u8 | url | wrapped`. When `wrapped` holds one more block than there are KIDs,
    /// its first block is a master key and every other block is a leaf key encrypted under
    /// it. Otherwise every block is a content key. The system id is the wrapping key.
    pub fn bootstrap_keys(&self) -> Result<Vec<([u8; 16], [u8; 16])>> {
        if !self.is_bootstrap() {
            return Err(DecryptError::config(format!(
                "{} is not a bootstrap system",
                hex::encode(self.system_id)
            )));
        }

        let (_, wrapped) = self.bootstrap_parts()?;
        let count = self.kids.len();

        if wrapped.len() == 16 * (count + 1) && count > 0 {
            let mut master = [0; 16];
            master.copy_from_slice(&wrapped[..16]);
            apply_ctr(&BOOTSTRAP_SYSTEM_ID, &BOOTSTRAP_IV, &mut master);

            let aes = Aes128::new(GenericArray::from_slice(&master));
            let keys = self
                .kids
                .iter()
                .zip(wrapped[16..].chunks_exact(16))
                .map(|(kid, leaf)| {
                    let mut key = [0; 16];
                    key.copy_from_slice(leaf);
                    // single block CBC with a zero IV
                    aes.decrypt_block(GenericArray::from_mut_slice(&mut key));
                    (*kid, key)
                })
                .collect();
            return Ok(keys);
        }

        if wrapped.len() < 16 * count {
            return Err(DecryptError::invalid(format!(
                "bootstrap data carries {} bytes for {} keys",
                wrapped.len(),
                count
            )));
        }

        let mut plain = wrapped[..16 * count].to_vec();
        apply_ctr(&BOOTSTRAP_SYSTEM_ID, &BOOTSTRAP_IV, &mut plain);

        Ok(self
            .kids
            .iter()
            .zip(plain.chunks_exact(16))
            .map(|(kid, key)| {
                let mut value = [0; 16];
                value.copy_from_slice(key);
                (*kid, value)
            })
            .collect())
    }
}

/// Format a 16 byte identifier as `8-4-4-4-12` hex groups.
pub fn uuid(value: &[u8; 16]) -> String {
    let x = hex::encode(value);
    format!(
        "{}-{}-{}-{}-{}",
        &x[..8],
        &x[8..12],
        &x[12..16],
        &x[16..20],
        &x[20..]
    )
}
