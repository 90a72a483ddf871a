//! Temporary key exchange with a ClearKey license server.
//!
//! Request: `{"kids":["<base64url>"],"type":"temporary"}`
//!
//! Response: `{"keys":[{"kty":"oct","kid":"<base64url>","k":"<base64url>"}]}`

use crate::error::{DecryptError, Result};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

pub const CONTENT_TYPE: &str = "application/json";

#[derive(Serialize)]
struct LicenseRequest<'a> {
    kids: Vec<String>,
    #[serde(rename = "type")]
    session_type: &'a str,
}

#[derive(Deserialize)]
struct LicenseResponse {
    #[serde(default)]
    keys: Vec<JsonWebKey>,
}

#[derive(Deserialize)]
struct JsonWebKey {
    #[serde(default)]
    kty: Option<String>,
    kid: String,
    k: String,
}

pub fn request_body(kids: &[[u8; 16]]) -> Result<Vec<u8>> {
    let request = LicenseRequest {
        kids: kids.iter().map(|x| URL_SAFE_NO_PAD.encode(x)).collect(),
        session_type: "temporary",
    };

    serde_json::to_vec(&request)
        .map_err(|e| DecryptError::config(format!("cannot build license request ({})", e)))
}

pub fn parse_response(data: &[u8]) -> Result<Vec<([u8; 16], [u8; 16])>> {
    let response = serde_json::from_slice::<LicenseResponse>(data)
        .map_err(|e| DecryptError::invalid(format!("cannot parse license response ({})", e)))?;

    let mut keys = Vec::new();

    for key in response.keys {
        if key.kty.as_deref().is_some_and(|x| x != "oct") {
            log::debug!("skipping {:?} license key", key.kty);
            continue;
        }

        keys.push((decode_16(&key.kid)?, decode_16(&key.k)?));
    }

    Ok(keys)
}

fn decode_16(value: &str) -> Result<[u8; 16]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| DecryptError::invalid(format!("invalid base64url value ({})", e)))?;

    bytes.try_into().map_err(|x: Vec<u8>| {
        DecryptError::invalid(format!("license key has {} bytes", x.len()))
    })
}
