use crate::{legacy::IsmaSampleFormat, scheme::CryptPattern};

/// Payload format of a stream, needed by SAMPLE-AES.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MediaCodec {
    Avc {
        nal_length_size: u8,
    },
    Aac,
    Ac3,
    #[default]
    Other,
}

/// Protection metadata of one stream, as announced by the container layer.
///
/// Delivered again whenever the metadata changes, the engine only re-resolves keys that
/// are affected by the change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamProperties {
    /// Four character scheme code such as `cenc` or `iAEC`.
    pub scheme_type: String,
    pub scheme_version: u32,
    pub scheme_uri: Option<String>,
    /// Key management system URI of ISMACryp and OMA streams.
    pub kms_uri: Option<String>,
    /// Protection headers, as a `count:u32` prefixed record list or `pssh` boxes.
    pub pssh: Option<Vec<u8>>,
    /// Binary key descriptor of CENC family streams.
    pub key_info: Option<Vec<u8>>,
    pub pattern: Option<CryptPattern>,
    /// `1` for AES-CTR, `2` for AES-CBC.
    pub piff_algorithm: Option<u32>,
    pub hls_key_uri: Option<String>,
    /// Hex encoded, zero when absent.
    pub hls_iv: Option<String>,
    /// Key/IV mapping file (local path or URL).
    pub key_file: Option<String>,
    pub track_id: Option<u32>,
    pub rep_id: Option<String>,
    pub period_id: Option<String>,
    pub codec: MediaCodec,
    pub isma_format: Option<IsmaSampleFormat>,
    pub oma_selective_encryption: bool,
    pub oma_preview_range: Option<u64>,
    pub clearkey_url: Option<String>,
}

impl StreamProperties {
    pub fn new<T: Into<String>>(scheme_type: T, scheme_version: u32) -> Self {
        Self {
            scheme_type: scheme_type.into(),
            scheme_version,
            ..Default::default()
        }
    }
}

/// One sample handed to [`DecryptEngine::process`](crate::DecryptEngine::process).
#[derive(Clone, Copy, Debug)]
pub struct SamplePacket<'a> {
    pub data: &'a [u8],
    /// Inline sample auxiliary information (CENC family only).
    pub sai: Option<&'a [u8]>,
    /// Samples flagged as clear are forwarded untouched.
    pub encrypted: bool,
    /// Byte stream offset of ISMACryp samples without an in-band header.
    pub isma_bso: Option<u64>,
}

impl<'a> SamplePacket<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            sai: None,
            encrypted: true,
            isma_bso: None,
        }
    }

    pub fn with_sai(data: &'a [u8], sai: &'a [u8]) -> Self {
        Self {
            sai: Some(sai),
            ..Self::new(data)
        }
    }

    pub fn clear(data: &'a [u8]) -> Self {
        Self {
            encrypted: false,
            ..Self::new(data)
        }
    }
}
