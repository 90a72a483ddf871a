use crate::error::{DecryptError, Result};
use std::fmt;

/// Protection scheme signalled by a stream, identified by its 4-character code and version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtectionScheme {
    Cenc,
    Cbc1,
    Cens,
    Cbcs,
    Piff,
    Isma,
    Oma,
    Adobe,
    HlsSampleAes,
}

/// Block cipher mode shared by a family of schemes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
    Ctr,
    Cbc,
}

impl ProtectionScheme {
    pub const CENC_VERSION: u32 = 0x00010000;
    pub const PIFF_VERSION: u32 = 0x00010000;
    pub const ISMA_VERSION: u32 = 1;
    pub const OMA_VERSION: u32 = 0x00000200;
    pub const ADOBE_VERSION: u32 = 1;
    pub const SAES_VERSION: u32 = 1;

    /// Match a scheme code (case sensitive) and version.
    pub fn from_fourcc(scheme_type: u32, version: u32) -> Result<Self> {
        let scheme = match scheme_type {
            0x63656E63 => Self::Cenc,
            0x63626331 => Self::Cbc1,
            0x63656E73 => Self::Cens,
            0x63626373 => Self::Cbcs,
            0x70696666 => Self::Piff,
            0x69414543 => Self::Isma,
            0x6F646B6D => Self::Oma,
            0x61646B6D => Self::Adobe,
            0x73616573 => Self::HlsSampleAes,
            x => {
                return Err(DecryptError::config(format!(
                    "unsupported protection scheme {}",
                    fourcc_to_string(x)
                )));
            }
        };

        if scheme.version() != version {
            return Err(DecryptError::config(format!(
                "unsupported {} scheme version {:#010x}",
                scheme, version
            )));
        }

        Ok(scheme)
    }

    pub fn from_code(code: &str, version: u32) -> Result<Self> {
        let bytes: [u8; 4] = code.as_bytes().try_into().map_err(|_| {
            DecryptError::config(format!("scheme code {:?} is not 4 characters", code))
        })?;
        Self::from_fourcc(u32::from_be_bytes(bytes), version)
    }

    pub fn fourcc(&self) -> u32 {
        match self {
            Self::Cenc => 0x63656E63,
            Self::Cbc1 => 0x63626331,
            Self::Cens => 0x63656E73,
            Self::Cbcs => 0x63626373,
            Self::Piff => 0x70696666,
            Self::Isma => 0x69414543,
            Self::Oma => 0x6F646B6D,
            Self::Adobe => 0x61646B6D,
            Self::HlsSampleAes => 0x73616573,
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            Self::Cenc | Self::Cbc1 | Self::Cens | Self::Cbcs => Self::CENC_VERSION,
            Self::Piff => Self::PIFF_VERSION,
            Self::Isma => Self::ISMA_VERSION,
            Self::Oma => Self::OMA_VERSION,
            Self::Adobe => Self::ADOBE_VERSION,
            Self::HlsSampleAes => Self::SAES_VERSION,
        }
    }

    /// Default cipher mode. PIFF may switch to CBC through its algorithm id.
    pub fn mode(&self) -> CipherMode {
        match self {
            Self::Cenc | Self::Cens | Self::Piff | Self::Isma => CipherMode::Ctr,
            Self::Cbc1 | Self::Cbcs | Self::Oma | Self::Adobe | Self::HlsSampleAes => {
                CipherMode::Cbc
            }
        }
    }

    /// Schemes whose samples carry sample auxiliary information and key info.
    pub fn is_cenc_family(&self) -> bool {
        matches!(
            self,
            Self::Cenc | Self::Cbc1 | Self::Cens | Self::Cbcs | Self::Piff
        )
    }

    pub fn supports_pattern(&self) -> bool {
        matches!(self, Self::Cens | Self::Cbcs)
    }
}

impl fmt::Display for ProtectionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&fourcc_to_string(self.fourcc()))
    }
}

fn fourcc_to_string(code: u32) -> String {
    code.to_be_bytes()
        .iter()
        .map(|x| {
            if x.is_ascii_graphic() {
                *x as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Block pattern `(crypt_blocks, skip_blocks)` counted in 16-byte units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CryptPattern {
    pub crypt_blocks: u8,
    pub skip_blocks: u8,
}

impl CryptPattern {
    pub fn new(crypt_blocks: u8, skip_blocks: u8) -> Self {
        Self {
            crypt_blocks,
            skip_blocks,
        }
    }

    /// A pattern with a zero count on either side means full encryption.
    pub fn is_active(&self) -> bool {
        self.crypt_blocks != 0 && self.skip_blocks != 0
    }

    pub fn crypt_size(&self) -> usize {
        self.crypt_blocks as usize * 16
    }

    pub fn skip_size(&self) -> usize {
        self.skip_blocks as usize * 16
    }
}
