use crate::error::{DecryptError, Result};
use base64::Engine;
use std::path::PathBuf;

/// Where the bytes of a key live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyLocation {
    Inline(Vec<u8>),
    File(PathBuf),
    Remote(String),
}

impl KeyLocation {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

/// Interpret a key URI of an HLS style stream.
///
/// Supports `data:` URIs (base64 or raw), `base64:` and `hex:`/`0x` inline values,
/// `http(s)://` URLs, `file://` URLs and bare local paths.
pub fn parse_key_uri(uri: &str) -> Result<KeyLocation> {
    let uri = uri.trim();

    if uri.is_empty() {
        return Err(DecryptError::config("empty key URI"));
    }

    if let Some(data) = uri.strip_prefix("data:") {
        let (header, payload) = data
            .split_once(',')
            .ok_or_else(|| DecryptError::config(format!("invalid data URI {}", uri)))?;

        return Ok(KeyLocation::Inline(if header.ends_with(";base64") {
            decode_base64(payload)?
        } else {
            payload.as_bytes().to_vec()
        }));
    }

    if let Some(payload) = uri.strip_prefix("base64:") {
        return decode_base64(payload).map(KeyLocation::Inline);
    }

    if let Some(payload) = uri
        .strip_prefix("hex:")
        .or_else(|| uri.strip_prefix("0x"))
        .or_else(|| uri.strip_prefix("0X"))
    {
        return Ok(KeyLocation::Inline(hex::decode(payload)?));
    }

    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(KeyLocation::Remote(uri.to_owned()));
    }

    Ok(KeyLocation::File(PathBuf::from(
        uri.strip_prefix("file://").unwrap_or(uri),
    )))
}

/// Key management URI of an ISMACryp or OMA stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KmsUri {
    /// Content key and salt carried inline.
    Inline { key: [u8; 16], salt: [u8; 8] },
    /// A key file to look the track up in.
    KeyFile(String),
}

/// Interpret an ISMACryp key management URI.
///
/// `(key)` carries base64 of key and salt, `(key-hexa)` their hex encoding and `(uri)`
/// prefixes a key file location. Any other value is taken as a key file location.
pub fn parse_isma_kms(uri: &str) -> Result<KmsUri> {
    let uri = uri.trim();

    if let Some(payload) = uri.strip_prefix("(key)") {
        return inline_kms(&decode_base64(payload)?);
    }

    if let Some(payload) = uri.strip_prefix("(key-hexa)") {
        return inline_kms(&hex::decode(payload.trim())?);
    }

    if let Some(location) = uri.strip_prefix("(uri)") {
        return Ok(KmsUri::KeyFile(location.trim().to_owned()));
    }

    if uri.starts_with("(ipmp)") || uri.contains("AudioKey") || uri.contains("VideoKey") {
        return Err(DecryptError::config(format!(
            "unsupported key management system {}",
            uri
        )));
    }

    if uri.is_empty() {
        return Err(DecryptError::config("empty key management URI"));
    }

    Ok(KmsUri::KeyFile(uri.to_owned()))
}

fn inline_kms(data: &[u8]) -> Result<KmsUri> {
    if data.len() < 24 {
        return Err(DecryptError::config(format!(
            "inline key management data has {} bytes, expected 24",
            data.len()
        )));
    }

    let mut key = [0; 16];
    let mut salt = [0; 8];
    key.copy_from_slice(&data[..16]);
    salt.copy_from_slice(&data[16..24]);
    Ok(KmsUri::Inline { key, salt })
}

fn decode_base64(data: &str) -> Result<Vec<u8>> {
    let data = data.trim().trim_end_matches('=');
    base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(data)
        .map_err(|e| DecryptError::config(format!("invalid base64 key data ({})", e)))
}

/// Read a key value from raw bytes: 16 binary bytes or 32 hex characters.
pub fn key_from_bytes(data: &[u8]) -> Result<[u8; 16]> {
    if let Ok(key) = <[u8; 16]>::try_from(data) {
        return Ok(key);
    }

    let text = std::str::from_utf8(data)
        .map_err(|_| DecryptError::config(format!("key data has {} bytes", data.len())))?;
    crate::config::parse_hex_16(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_uri_forms() {
        assert_eq!(
            parse_key_uri("data:text/plain;base64,AAECAwQFBgcICQoLDA0ODw==").unwrap(),
            KeyLocation::Inline((0..16).collect())
        );
        assert_eq!(
            parse_key_uri("data:,abc").unwrap(),
            KeyLocation::Inline(b"abc".to_vec())
        );
        assert_eq!(
            parse_key_uri("hex:0a0b").unwrap(),
            KeyLocation::Inline(vec![0x0A, 0x0B])
        );
        assert_eq!(
            parse_key_uri("0x0a0b").unwrap(),
            KeyLocation::Inline(vec![0x0A, 0x0B])
        );
        assert!(parse_key_uri("https://example.com/key").unwrap().is_remote());
        assert_eq!(
            parse_key_uri("file:///tmp/key.bin").unwrap(),
            KeyLocation::File(PathBuf::from("/tmp/key.bin"))
        );
        assert_eq!(
            parse_key_uri("keys/track1.key").unwrap(),
            KeyLocation::File(PathBuf::from("keys/track1.key"))
        );
        assert!(parse_key_uri("").is_err());
        assert!(parse_key_uri("data:no-comma").is_err());
    }

    #[test]
    fn test_isma_kms() {
        let data = (0..24).collect::<Vec<u8>>();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&data);

        let expected = KmsUri::Inline {
            key: (0..16).collect::<Vec<u8>>().try_into().unwrap(),
            salt: [16, 17, 18, 19, 20, 21, 22, 23],
        };
        assert_eq!(parse_isma_kms(&format!("(key){}", encoded)).unwrap(), expected);
        assert_eq!(
            parse_isma_kms(&format!("(key-hexa){}", hex::encode(&data))).unwrap(),
            expected
        );
        assert_eq!(
            parse_isma_kms("(uri)drm.xml").unwrap(),
            KmsUri::KeyFile("drm.xml".to_owned())
        );
        assert_eq!(
            parse_isma_kms("https://example.com/drm.xml").unwrap(),
            KmsUri::KeyFile("https://example.com/drm.xml".to_owned())
        );

        assert!(parse_isma_kms("(key)AAEC").is_err());
        assert!(parse_isma_kms("(ipmp)").is_err());
        assert!(parse_isma_kms("AudioKey").is_err());
    }

    #[test]
    fn test_key_from_bytes() {
        assert_eq!(key_from_bytes(&[7; 16]).unwrap(), [7; 16]);
        assert_eq!(
            key_from_bytes(b"000102030405060708090a0b0c0d0e0f\n").unwrap()[1],
            1
        );
        assert!(key_from_bytes(&[1, 2, 3]).is_err());
    }
}
