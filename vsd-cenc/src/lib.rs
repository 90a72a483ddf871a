#![cfg_attr(docsrs, feature(doc_cfg))]

//! Sample level decryption of protected media streams.
//!
//! The container layer hands each stream's protection metadata to a [`DecryptEngine`] and
//! then its samples, one at a time. The engine resolves keys, keeps per-stream cipher state
//! and returns plaintext samples.
//!
//! # Supported Protection Schemes
//!
//! | Scheme | Version      | Description                          | Cipher Mode           |
//! |--------|--------------|--------------------------------------|-----------------------|
//! | `cenc` | `0x00010000` | full sample or subsample encryption  | AES-128-CTR           |
//! | `cbc1` | `0x00010000` | full sample or subsample encryption  | AES-128-CBC           |
//! | `cens` | `0x00010000` | pattern encryption                   | AES-128-CTR           |
//! | `cbcs` | `0x00010000` | pattern encryption                   | AES-128-CBC           |
//! | `piff` | `0x00010000` | PIFF 1.1 sample encryption           | AES-128-CTR or CBC    |
//! | `iAEC` | `1`          | ISMACryp                             | AES-128-CTR           |
//! | `odkm` | `0x00000200` | OMA DRM                              | AES-128-CBC (PKCS#7)  |
//! | `adkm` | `1`          | Adobe Access                         | AES-128-CBC (PKCS#7)  |
//! | `saes` | `1`          | HLS SAMPLE-AES (AVC, AAC, AC-3)      | AES-128-CBC           |
//!
//! # Quick Start
//!
//! ```
//! use vsd_cenc::{
//!     DecryptConfig, DecryptEngine, KeyEntry, KeyInfoRecord, Processed, SamplePacket,
//!     StreamProperties,
//! };
//!
//! let kid = [0x11; 16];
//! let config = DecryptConfig::builder()
//!     .key_bytes(kid, [0x22; 16])
//!     .build();
//! let mut engine = DecryptEngine::new(config);
//!
//! let mut props = StreamProperties::new("cenc", 0x00010000);
//! props.key_info = Some(KeyInfoRecord::single(KeyEntry::new(kid, 8)).to_bytes()?);
//! engine.configure_stream(1, props)?;
//! engine.play(1)?;
//!
//! // 8 byte IV, one subsample with 4 clear bytes
//! let sai = [0, 0, 0, 0, 0, 0, 0, 1, 0, 1, 0, 4, 0, 0, 0, 0];
//! let sample = [1, 2, 3, 4];
//! let output = engine.process(1, &SamplePacket::with_sai(&sample, &sai))?;
//! assert_eq!(output, Processed::Sample(sample.to_vec()));
//! # Ok::<(), vsd_cenc::DecryptError>(())
//! ```
//!
//! # Optional Features
//!
//! - **http** (default): fetch key files, key URIs and ClearKey licenses with `reqwest`.
//! - **native-tls** (default): TLS through the platform library.
//! - **rustls-tls-webpki-roots**: TLS through rustls.

mod cipher;
mod config;
mod decrypter;
mod engine;
mod error;
mod hls;
mod key_info;
mod legacy;
mod props;
mod reader;
mod scheme;
mod stream;

pub mod pssh;
pub mod resolver;
pub mod sai;

pub use cipher::{CipherContext, apply_ctr, decrypt_cbc_blocks, decrypt_cbc_padded};
pub use config::{DecryptConfig, DecryptConfigBuilder, KeyOverride, parse_hex_16};
pub use decrypter::{DecryptPolicy, SampleDecrypter};
pub use engine::{DecryptEngine, Processed, StreamId};
pub use error::{DecryptError, ErrorKind, MalformedInput, Result};
pub use hls::{SampleAesCodec, SampleAesDecrypter, remove_emulation_prevention};
pub use key_info::{KeyEntry, KeyInfoRecord};
pub use legacy::{IsmaDecrypter, IsmaSample, IsmaSampleFormat, decrypt_adobe, decrypt_oma};
pub use props::{MediaCodec, SamplePacket, StreamProperties};
pub use reader::Reader;
pub use resolver::{KeySlot, KeySource};
pub use scheme::{CipherMode, CryptPattern, ProtectionScheme};
pub use stream::{StreamCryptState, StreamState};
