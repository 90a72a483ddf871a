use super::read_blob;
use anyhow::{Result, bail};
use clap::{Args, ValueEnum};
use log::{info, warn};
use std::{fs, path::PathBuf, thread, time::Duration};
use vsd_cenc::{
    CryptPattern, DecryptConfig, DecryptEngine, DecryptPolicy, IsmaSampleFormat, KeyOverride,
    MediaCodec, Processed, ProtectionScheme, SamplePacket, StreamProperties, StreamState,
};

const STREAM: u32 = 1;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Scheme {
    Cenc,
    Cbc1,
    Cens,
    Cbcs,
    Piff,
    #[value(name = "iAEC", alias = "isma")]
    Isma,
    #[value(alias = "oma")]
    Odkm,
    #[value(alias = "adobe")]
    Adkm,
    Saes,
}

impl Scheme {
    fn code(&self) -> &'static str {
        match self {
            Self::Cenc => "cenc",
            Self::Cbc1 => "cbc1",
            Self::Cens => "cens",
            Self::Cbcs => "cbcs",
            Self::Piff => "piff",
            Self::Isma => "iAEC",
            Self::Odkm => "odkm",
            Self::Adkm => "adkm",
            Self::Saes => "saes",
        }
    }

    fn version(&self) -> u32 {
        match self {
            Self::Cenc | Self::Cbc1 | Self::Cens | Self::Cbcs => ProtectionScheme::CENC_VERSION,
            Self::Piff => ProtectionScheme::PIFF_VERSION,
            Self::Isma => ProtectionScheme::ISMA_VERSION,
            Self::Odkm => ProtectionScheme::OMA_VERSION,
            Self::Adkm => ProtectionScheme::ADOBE_VERSION,
            Self::Saes => ProtectionScheme::SAES_VERSION,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Codec {
    Avc,
    Aac,
    Ac3,
    Other,
}

#[derive(Args, Clone, Debug)]
/// Decrypt one sample.
///
/// The sample is read from a file and its protection metadata is given on the command line,
/// the way a demultiplexer would announce it.
pub struct Decrypt {
    /// Encrypted sample.
    #[arg(required = true)]
    input: PathBuf,

    /// Path for the decrypted sample.
    #[arg(short, long)]
    output: PathBuf,

    /// Protection scheme of the stream.
    #[arg(long, default_value = "cenc")]
    scheme: Scheme,

    /// Override the scheme version (e.g. 0x10000).
    #[arg(long, value_parser = parse_u32)]
    scheme_version: Option<u32>,

    /// Key info data of CENC family streams.
    #[arg(long, value_name = "PATH|HEX")]
    key_info: Option<String>,

    /// Sample auxiliary information (IVs and subsamples).
    #[arg(long, value_name = "PATH|HEX")]
    sai: Option<String>,

    /// Encryption pattern of cens and cbcs streams.
    #[arg(long, value_name = "CRYPT:SKIP", value_parser = parse_pattern)]
    pattern: Option<CryptPattern>,

    /// PIFF algorithm id (1 for AES-CTR, 2 for AES-CBC).
    #[arg(long)]
    piff_algorithm: Option<u32>,

    /// Protection headers, as a record list or pssh boxes.
    #[arg(long, value_name = "PATH|HEX|BASE64")]
    pssh: Option<String>,

    /// Content key as KID:KEY, or KEY alone for schemes without KIDs.
    ///
    /// This option can be used multiple times.
    #[arg(long = "key", value_name = "KID:KEY")]
    keys: Vec<KeyOverride>,

    /// Handling of bytes whose key is missing
    /// (full, nokey, skip, pad0, pad1, padsc).
    #[arg(long, default_value = "full")]
    policy: DecryptPolicy,

    /// Treat this key slot as undecryptable. Can be used multiple times.
    #[arg(long = "invalid-slot", value_name = "SLOT")]
    invalid_slots: Vec<usize>,

    /// Key/IV mapping file (path or URL).
    #[arg(long, value_name = "PATH|URL")]
    key_file: Option<String>,

    /// ClearKey license server.
    #[arg(long, value_name = "URL")]
    clearkey_url: Option<String>,

    /// Key management URI of ISMACryp and OMA streams.
    #[arg(long, value_name = "URI")]
    kms_uri: Option<String>,

    /// SAMPLE-AES key URI.
    #[arg(long, value_name = "URI")]
    hls_key_uri: Option<String>,

    /// SAMPLE-AES IV in hex.
    #[arg(long, value_name = "HEX")]
    hls_iv: Option<String>,

    /// Payload format of a SAMPLE-AES stream.
    #[arg(long, default_value = "other")]
    codec: Codec,

    /// NAL unit length size of AVC samples.
    #[arg(long, default_value_t = 4)]
    nal_length_size: u8,

    /// Track id used to select entries of the key file.
    #[arg(long)]
    track_id: Option<u32>,

    /// ISMACryp byte stream offset of the sample.
    #[arg(long)]
    isma_bso: Option<u64>,

    /// ISMACryp header layout as SELECTIVE:KEY_INDICATOR_LENGTH:IV_LENGTH.
    #[arg(long, value_name = "0|1:LEN:LEN", value_parser = parse_isma_format)]
    isma_format: Option<IsmaSampleFormat>,

    /// OMA access units carry a selective encryption byte.
    #[arg(long)]
    oma_selective_encryption: bool,

    /// OMA stream has a clear preview.
    #[arg(long)]
    oma_preview: bool,

    /// Forward the sample as it is.
    #[arg(long)]
    clear: bool,
}

impl Decrypt {
    pub fn execute(self) -> Result<()> {
        let sample = fs::read(&self.input)?;
        let sai = self.sai.as_deref().map(read_blob).transpose()?;

        let mut config = DecryptConfig::builder()
            .keys(self.keys.iter().copied())
            .policy(self.policy);
        for slot in &self.invalid_slots {
            config = config.invalidate_slot(*slot);
        }
        if let Some(key_file) = &self.key_file {
            config = config.key_file(key_file);
        }
        if let Some(url) = &self.clearkey_url {
            config = config.clearkey_url(url);
        }

        let mut engine = DecryptEngine::new(config.build());
        let state = engine.configure_stream(STREAM, self.properties()?)?;
        info!("stream configured ({})", state);
        engine.play(STREAM)?;

        while engine.has_pending_keys() {
            for (_, e) in engine.poll_keys() {
                if e.is_transient() && self.policy != DecryptPolicy::Full {
                    warn!("{}", e);
                } else {
                    bail!(e);
                }
            }
            thread::sleep(Duration::from_millis(10));
        }

        if engine.state(STREAM) != Some(StreamState::Play) {
            bail!("stream could not be started, keys are unresolved.");
        }

        for slot in engine.key_slots(STREAM).unwrap_or_default() {
            match (&slot.kid, &slot.source) {
                (Some(kid), Some(source)) => info!("key {} from {}", hex::encode(kid), source),
                (None, Some(source)) => info!("key from {}", source),
                (Some(kid), None) => warn!("no key for {}", hex::encode(kid)),
                (None, None) => warn!("no key"),
            }
        }

        let mut packet = match &sai {
            Some(sai) => SamplePacket::with_sai(&sample, sai),
            None if self.clear => SamplePacket::clear(&sample),
            None => SamplePacket::new(&sample),
        };
        packet.isma_bso = self.isma_bso;

        let output = match engine.process(STREAM, &packet)? {
            Processed::Sample(x) => x,
            Processed::PendingKeys => bail!("keys are still being fetched."),
        };

        fs::write(&self.output, &output)?;
        info!(
            "wrote {} bytes to {}",
            output.len(),
            self.output.to_string_lossy()
        );
        Ok(())
    }

    fn properties(&self) -> Result<StreamProperties> {
        let mut props = StreamProperties::new(
            self.scheme.code(),
            self.scheme_version.unwrap_or(self.scheme.version()),
        );

        props.key_info = self.key_info.as_deref().map(read_blob).transpose()?;
        props.pssh = self.pssh.as_deref().map(read_pssh).transpose()?;
        props.pattern = self.pattern;
        props.piff_algorithm = self.piff_algorithm;
        props.kms_uri = self.kms_uri.clone();
        props.hls_key_uri = self.hls_key_uri.clone();
        props.hls_iv = self.hls_iv.clone();
        props.track_id = self.track_id;
        props.isma_format = self.isma_format;
        props.oma_selective_encryption = self.oma_selective_encryption;
        props.oma_preview_range = self.oma_preview.then_some(0);
        props.codec = match self.codec {
            Codec::Avc => MediaCodec::Avc {
                nal_length_size: self.nal_length_size,
            },
            Codec::Aac => MediaCodec::Aac,
            Codec::Ac3 => MediaCodec::Ac3,
            Codec::Other => MediaCodec::Other,
        };

        Ok(props)
    }
}

fn read_pssh(input: &str) -> Result<Vec<u8>> {
    if input.starts_with("hex:") || input.starts_with("base64:") {
        return read_blob(input);
    }

    match read_blob(input) {
        Ok(data) => Ok(data),
        Err(_) => read_blob(&format!("base64:{}", input)),
    }
}

fn parse_u32(s: &str) -> Result<u32> {
    Ok(match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(x) => u32::from_str_radix(x, 16)?,
        None => s.parse()?,
    })
}

fn parse_pattern(s: &str) -> Result<CryptPattern> {
    let Some((crypt, skip)) = s.split_once(':') else {
        bail!("Expected 'CRYPT:SKIP' but found '{}'.", s);
    };
    Ok(CryptPattern::new(crypt.trim().parse()?, skip.trim().parse()?))
}

fn parse_isma_format(s: &str) -> Result<IsmaSampleFormat> {
    let parts = s.split(':').map(|x| x.trim()).collect::<Vec<_>>();
    let [selective, key_indicator_length, iv_length] = parts.as_slice() else {
        bail!("Expected 'SELECTIVE:KEY_INDICATOR_LENGTH:IV_LENGTH' but found '{}'.", s);
    };

    Ok(IsmaSampleFormat {
        selective_encryption: matches!(*selective, "1" | "true"),
        key_indicator_length: key_indicator_length.parse()?,
        iv_length: iv_length.parse()?,
    })
}
