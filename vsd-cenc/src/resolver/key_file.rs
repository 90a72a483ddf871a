//! External key/IV mapping file.
//!
//! ```xml
//! <DRMInfo>
//!   <CrypTrack trackID="1" key="0x..." salt="0x...">
//!     <key KID="0x..." value="0x..."/>
//!   </CrypTrack>
//! </DRMInfo>
//! ```

use crate::{
    config::parse_hex_16,
    error::{DecryptError, Result},
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename = "DRMInfo")]
pub struct KeyFile {
    #[serde(rename = "CrypTrack", default)]
    pub tracks: Vec<CrypTrack>,
}

#[derive(Debug, Deserialize)]
pub struct CrypTrack {
    #[serde(rename = "@trackID")]
    pub track_id: Option<u32>,
    #[serde(rename = "@rep")]
    pub rep: Option<String>,
    #[serde(rename = "@period")]
    pub period: Option<String>,
    #[serde(rename = "@key")]
    pub key: Option<String>,
    #[serde(rename = "@salt")]
    pub salt: Option<String>,
    #[serde(rename = "@IV")]
    pub iv: Option<String>,
    #[serde(rename = "key", default)]
    pub keys: Vec<KeyEntry>,
}

#[derive(Debug, Deserialize)]
pub struct KeyEntry {
    #[serde(rename = "@KID")]
    pub kid: String,
    #[serde(rename = "@value")]
    pub value: String,
}

impl KeyFile {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let xml = std::str::from_utf8(data)
            .map_err(|_| DecryptError::invalid("key file is not valid UTF-8"))?;
        quick_xml::de::from_str(xml)
            .map_err(|e| DecryptError::invalid(format!("cannot parse key file ({})", e)))
    }

    /// First track whose declared identifiers all equal the stream's.
    pub fn find(
        &self,
        track_id: Option<u32>,
        rep: Option<&str>,
        period: Option<&str>,
    ) -> Option<&CrypTrack> {
        self.tracks.iter().find(|x| {
            x.track_id.is_none_or(|id| Some(id) == track_id)
                && x.rep.as_deref().is_none_or(|id| Some(id) == rep)
                && x.period.as_deref().is_none_or(|id| Some(id) == period)
        })
    }
}

impl CrypTrack {
    /// Key for a KID, falling back to the track wide key.
    pub fn key_for(&self, kid: Option<&[u8; 16]>) -> Result<Option<[u8; 16]>> {
        if let Some(kid) = kid {
            for entry in &self.keys {
                if &parse_hex_16(&entry.kid.replace('-', ""))? == kid {
                    return parse_hex_16(&entry.value).map(Some);
                }
            }
        }

        self.key.as_deref().map(parse_hex_16).transpose()
    }

    pub fn salt(&self) -> Result<Option<[u8; 8]>> {
        self.salt
            .as_deref()
            .map(|x| {
                let x = x.trim().trim_start_matches("0x");
                let bytes = hex::decode(x)?;
                bytes.try_into().map_err(|x: Vec<u8>| {
                    DecryptError::config(format!("salt must be 8 bytes, got {}", x.len()))
                })
            })
            .transpose()
    }

    pub fn iv(&self) -> Result<Option<[u8; 16]>> {
        self.iv.as_deref().map(parse_hex_16).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DRMInfo>
  <CrypTrack trackID="1" rep="video" key="0x0102030405060708090a0b0c0d0e0f10" salt="0x0807060504030201">
    <key KID="0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa" value="0x11111111111111111111111111111111"/>
    <key KID="bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbbbb" value="22222222222222222222222222222222"/>
  </CrypTrack>
  <CrypTrack trackID="2" IV="0x000102030405060708090a0b0c0d0e0f" key="0x33333333333333333333333333333333"/>
</DRMInfo>"#;

    #[test]
    fn test_parse_and_match() {
        let file = KeyFile::parse(XML.as_bytes()).unwrap();
        assert_eq!(file.tracks.len(), 2);

        let track = file.find(Some(1), Some("video"), None).unwrap();
        assert_eq!(track.keys.len(), 2);
        assert_eq!(
            track.key_for(Some(&[0xBB; 16])).unwrap(),
            Some([0x22; 16])
        );
        assert_eq!(
            track.key_for(Some(&[0xCC; 16])).unwrap().unwrap()[0],
            0x01
        );
        assert_eq!(track.salt().unwrap(), Some([8, 7, 6, 5, 4, 3, 2, 1]));

        assert!(file.find(Some(1), Some("audio"), None).is_none());
        assert!(file.find(Some(1), None, None).is_none());

        let other = file.find(Some(2), Some("anything"), Some("p0")).unwrap();
        assert_eq!(other.iv().unwrap().unwrap()[15], 0x0F);
        assert_eq!(other.key_for(None).unwrap(), Some([0x33; 16]));
    }

    #[test]
    fn test_invalid_xml() {
        assert!(KeyFile::parse(b"<DRMInfo><CrypTrack").is_err());
    }
}
