//! Per-stream protection state and scheme handlers.

use crate::{
    cipher::CipherContext,
    config::DecryptConfig,
    decrypter::{DecryptPolicy, SampleDecrypter},
    error::{DecryptError, ErrorKind, Result},
    hls::{SampleAesCodec, SampleAesDecrypter},
    key_info::KeyInfoRecord,
    legacy::{IsmaDecrypter, IsmaSampleFormat, decrypt_adobe, decrypt_oma},
    props::{MediaCodec, SamplePacket, StreamProperties},
    pssh::PsshRecord,
    resolver::{FetchRequest, FetchResult, KeyResolver, KeySet, Progress, ResolveInput},
    sai::SampleAuxInfo,
    scheme::{CipherMode, ProtectionScheme},
};
use std::fmt;

/// Lifecycle of a protected stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Unusable until reconfigured.
    Error,
    /// Configured, keys being resolved or stream stopped.
    Setup,
    /// Cipher contexts are live and samples are decrypted.
    Play,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Setup => "setup",
            Self::Play => "play",
        })
    }
}

/// Decryption of one scheme, selected once when the stream is configured.
pub(crate) trait SchemeHandler {
    /// Build cipher state from the resolved keys.
    fn start(&mut self, keys: &KeySet) -> Result<()>;
    /// Drop cipher state.
    fn stop(&mut self);
    fn process(&mut self, packet: &SamplePacket, policy: DecryptPolicy) -> Result<Vec<u8>>;
}

struct CencHandler {
    key_info: KeyInfoRecord,
    decrypter: SampleDecrypter,
    contexts: Vec<CipherContext>,
}

impl SchemeHandler for CencHandler {
    fn start(&mut self, keys: &KeySet) -> Result<()> {
        self.contexts = keys
            .slots
            .iter()
            .map(|slot| match &slot.key {
                Some(key) => CipherContext::with_key(self.decrypter.mode, key),
                None => CipherContext::new(self.decrypter.mode),
            })
            .collect();
        Ok(())
    }

    fn stop(&mut self) {
        self.contexts.clear();
    }

    fn process(&mut self, packet: &SamplePacket, policy: DecryptPolicy) -> Result<Vec<u8>> {
        let sai = match packet.sai {
            Some(data) => SampleAuxInfo::parse(data, &self.key_info)?,
            None if self
                .key_info
                .entry(1)
                .is_some_and(|x| x.constant_iv.is_some()) =>
            {
                SampleAuxInfo::default()
            }
            None => {
                return Err(DecryptError::invalid(
                    "encrypted sample without auxiliary information",
                ));
            }
        };

        self.decrypter.policy(policy).decrypt_sample(
            packet.data,
            &sai,
            &self.key_info,
            &mut self.contexts,
        )
    }
}

struct IsmaHandler {
    format: Option<IsmaSampleFormat>,
    decrypter: Option<IsmaDecrypter>,
}

impl SchemeHandler for IsmaHandler {
    fn start(&mut self, keys: &KeySet) -> Result<()> {
        self.decrypter = keys
            .slots
            .first()
            .and_then(|x| x.key)
            .map(|key| IsmaDecrypter::new(&key, &keys.salt.unwrap_or_default()));
        Ok(())
    }

    fn stop(&mut self) {
        self.decrypter = None;
    }

    fn process(&mut self, packet: &SamplePacket, policy: DecryptPolicy) -> Result<Vec<u8>> {
        let (payload, bso) = match &self.format {
            Some(format) => {
                let sample = format.parse(packet.data)?;
                if !sample.encrypted {
                    return Ok(sample.payload.to_vec());
                }
                (sample.payload, sample.bso.or(packet.isma_bso))
            }
            None => (packet.data, packet.isma_bso),
        };

        let Some(decrypter) = self.decrypter.as_mut() else {
            return policy.missing_key(payload, 1, None);
        };

        let bso = bso.unwrap_or(decrypter.next_bso());
        decrypter.decrypt(payload, bso)
    }
}

struct OmaHandler {
    selective_encryption: bool,
    preview: bool,
    key: Option<[u8; 16]>,
}

impl SchemeHandler for OmaHandler {
    fn start(&mut self, keys: &KeySet) -> Result<()> {
        self.key = keys.slots.first().and_then(|x| x.key);
        Ok(())
    }

    fn stop(&mut self) {
        self.key = None;
    }

    fn process(&mut self, packet: &SamplePacket, policy: DecryptPolicy) -> Result<Vec<u8>> {
        match &self.key {
            Some(key) => decrypt_oma(key, packet.data, self.selective_encryption),
            None if self.preview => Ok(packet.data.to_vec()),
            None => policy.missing_key(packet.data, 1, None),
        }
    }
}

struct AdobeHandler {
    key: Option<[u8; 16]>,
}

impl SchemeHandler for AdobeHandler {
    fn start(&mut self, keys: &KeySet) -> Result<()> {
        self.key = keys.slots.first().and_then(|x| x.key);
        Ok(())
    }

    fn stop(&mut self) {
        self.key = None;
    }

    fn process(&mut self, packet: &SamplePacket, policy: DecryptPolicy) -> Result<Vec<u8>> {
        match &self.key {
            Some(key) => decrypt_adobe(key, packet.data),
            None => policy.missing_key(packet.data, 1, None),
        }
    }
}

struct SampleAesHandler {
    codec: SampleAesCodec,
    decrypter: Option<SampleAesDecrypter>,
}

impl SchemeHandler for SampleAesHandler {
    fn start(&mut self, keys: &KeySet) -> Result<()> {
        self.decrypter = match keys.slots.first().and_then(|x| x.key) {
            Some(key) => Some(SampleAesDecrypter::new(
                &key,
                &keys.iv.unwrap_or_default(),
                self.codec,
            )?),
            None => None,
        };
        Ok(())
    }

    fn stop(&mut self) {
        self.decrypter = None;
    }

    fn process(&mut self, packet: &SamplePacket, policy: DecryptPolicy) -> Result<Vec<u8>> {
        match &self.decrypter {
            Some(decrypter) => decrypter.decrypt(packet.data),
            None => policy.missing_key(packet.data, 1, None),
        }
    }
}

/// Protection state of one stream.
///
/// Created when protection metadata is first seen. Cipher contexts live only while the
/// stream plays, key material lives as long as the record.
pub struct StreamCryptState {
    state: StreamState,
    scheme: Option<ProtectionScheme>,
    props: StreamProperties,
    policy: DecryptPolicy,
    key_info: Option<KeyInfoRecord>,
    pssh: Vec<PsshRecord>,
    key_info_hash: Option<blake3::Hash>,
    pssh_hash: Option<blake3::Hash>,
    keys: KeySet,
    resolver: KeyResolver,
    handler: Option<Box<dyn SchemeHandler>>,
    play_requested: bool,
    transient: Option<String>,
    last_error: Option<ErrorKind>,
}

impl StreamCryptState {
    /// A new stream stays in [`StreamState::Error`] until its first successful configure.
    pub(crate) fn new(policy: DecryptPolicy) -> Self {
        Self {
            state: StreamState::Error,
            scheme: None,
            props: StreamProperties::default(),
            policy,
            key_info: None,
            pssh: Vec::new(),
            key_info_hash: None,
            pssh_hash: None,
            keys: KeySet::default(),
            resolver: KeyResolver::new(),
            handler: None,
            play_requested: false,
            transient: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn scheme(&self) -> Option<ProtectionScheme> {
        self.scheme
    }

    pub fn policy(&self) -> DecryptPolicy {
        self.policy
    }

    pub fn keys(&self) -> &KeySet {
        &self.keys
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn is_resolved(&self) -> bool {
        self.resolver.is_finished()
    }

    /// Apply new protection metadata. Returns false when nothing relevant changed.
    pub(crate) fn configure(&mut self, props: StreamProperties, config: &DecryptConfig) -> Result<bool> {
        let configured = self.load(props, config);
        configured.map_err(|e| self.fail(e))
    }

    fn load(&mut self, props: StreamProperties, config: &DecryptConfig) -> Result<bool> {
        let scheme = ProtectionScheme::from_code(&props.scheme_type, props.scheme_version)?;

        let key_info = match &props.key_info {
            Some(data) => Some(KeyInfoRecord::parse(data)?),
            None if scheme.is_cenc_family() => {
                return Err(DecryptError::config(format!(
                    "{} stream without key info",
                    scheme
                )));
            }
            None => None,
        };

        let pssh = match &props.pssh {
            Some(data) => PsshRecord::parse_any(data)?,
            None => Vec::new(),
        };

        let key_info_hash = key_info.as_ref().map(|x| x.hash());
        let pssh_hash = (!pssh.is_empty()).then(|| PsshRecord::hash_list(&pssh));

        if self.state != StreamState::Error
            && self.scheme == Some(scheme)
            && self.key_info_hash == key_info_hash
            && self.pssh_hash == pssh_hash
            && self.props == props
        {
            log::debug!("{} protection metadata unchanged", scheme);
            return Ok(false);
        }

        let handler = build_handler(scheme, &props, key_info.as_ref(), config)?;

        let kids = match &key_info {
            Some(x) => x.entries.iter().map(|x| Some(x.kid)).collect(),
            None => vec![None],
        };

        if let Some(handler) = self.handler.as_mut() {
            handler.stop();
        }

        log::debug!(
            "configuring {} stream ({} key slots)",
            scheme,
            kids.len()
        );

        self.keys = KeySet::new(kids, config, &self.keys);
        self.scheme = Some(scheme);
        self.key_info = key_info;
        self.pssh = pssh;
        self.key_info_hash = key_info_hash;
        self.pssh_hash = pssh_hash;
        self.props = props;
        self.handler = Some(handler);
        self.resolver.restart();
        self.transient = None;
        self.last_error = None;
        self.state = StreamState::Setup;
        Ok(true)
    }

    /// Run key resolution as far as it goes without waiting.
    pub(crate) fn resolve(&mut self, config: &DecryptConfig) -> Result<Option<FetchRequest>> {
        let Some(scheme) = self.scheme else {
            return Ok(None);
        };

        if self.state == StreamState::Error || self.transient.is_some() {
            return Ok(None);
        }

        loop {
            let input = ResolveInput {
                config,
                props: &self.props,
                scheme,
                pssh: &self.pssh,
            };

            match self.resolver.advance(&input, &mut self.keys) {
                Ok(Progress::Fetch(request)) => return Ok(Some(request)),
                Ok(Progress::Waiting) => return Ok(None),
                Ok(Progress::Finished) => {
                    self.settle()?;
                    return Ok(None);
                }
                Err(e) if e.is_transient() && self.policy != DecryptPolicy::Full => {
                    log::warn!("{}, trying the next key source", e);
                    self.resolver.skip();
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Feed the result of a fetch and continue resolution.
    pub(crate) fn complete_fetch(
        &mut self,
        config: &DecryptConfig,
        result: FetchResult,
    ) -> Result<Option<FetchRequest>> {
        let Some(scheme) = self.scheme else {
            return Ok(None);
        };

        let input = ResolveInput {
            config,
            props: &self.props,
            scheme,
            pssh: &self.pssh,
        };

        if let Err(e) = self.resolver.complete(&input, &mut self.keys, result) {
            if !(e.is_transient() && self.policy != DecryptPolicy::Full) {
                return Err(self.fail(e));
            }
            log::warn!("{}, trying the next key source", e);
            self.resolver.skip();
        }

        self.resolve(config)
    }

    /// Every source has been tried.
    fn settle(&mut self) -> Result<()> {
        let preview = self.scheme == Some(ProtectionScheme::Oma)
            && self.props.oma_preview_range.is_some();

        if !self.keys.has_any_key() && self.policy == DecryptPolicy::Full && !preview {
            let error = DecryptError::config(format!(
                "no key resolved for {} stream",
                self.props.scheme_type
            ));
            return Err(self.fail(error));
        }

        for (i, slot) in self.keys.slots.iter().enumerate() {
            if !slot.is_resolved() {
                log::warn!(
                    "key slot {} is unresolved (KID {})",
                    i + 1,
                    slot.kid_hex()
                );
            }
        }

        if self.play_requested && self.state == StreamState::Setup {
            self.start()?;
        }

        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if let Some(handler) = self.handler.as_mut()
            && let Err(e) = handler.start(&self.keys)
        {
            return Err(self.fail(e));
        }

        self.state = StreamState::Play;
        log::debug!("{} stream playing", self.props.scheme_type);
        Ok(())
    }

    /// Record an error. Everything but a failed fetch is fatal for the stream.
    fn fail(&mut self, e: DecryptError) -> DecryptError {
        self.last_error = Some(e.kind());

        if e.is_transient() {
            self.transient = Some(e.to_string());
            log::warn!("{}", e);
        } else {
            log::error!("{}", e);
            self.state = StreamState::Error;
            if let Some(handler) = self.handler.as_mut() {
                handler.stop();
            }
        }

        e
    }

    pub(crate) fn play(&mut self) -> Result<()> {
        self.play_requested = true;

        if self.state == StreamState::Setup && self.resolver.is_finished() {
            self.start()?;
        }

        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        self.play_requested = false;
        self.resolver.cancel();

        if self.state == StreamState::Play {
            if let Some(handler) = self.handler.as_mut() {
                handler.stop();
            }
            self.state = StreamState::Setup;
        }
    }

    /// Clear a fetch failure so resolution can be driven again.
    pub(crate) fn retry(&mut self) -> bool {
        self.transient.take().is_some()
    }

    /// Change the policy. A stream waiting on a failed fetch gives that source up.
    pub(crate) fn relax_policy(&mut self, policy: DecryptPolicy) -> bool {
        self.policy = policy;

        if policy != DecryptPolicy::Full && self.transient.take().is_some() {
            self.resolver.skip();
            return true;
        }

        false
    }

    pub(crate) fn process(&mut self, packet: &SamplePacket) -> Result<Vec<u8>> {
        match self.state {
            StreamState::Error if self.scheme.is_none() => {
                return Err(DecryptError::config("stream is not configured"));
            }
            StreamState::Error => {
                return Err(DecryptError::config(format!(
                    "{} stream is in error state",
                    self.props.scheme_type
                )));
            }
            StreamState::Setup => {
                if let Some(reason) = &self.transient
                    && self.policy == DecryptPolicy::Full
                {
                    return Err(DecryptError::TransientIo(reason.clone()));
                }
                return Err(DecryptError::config("stream is not playing"));
            }
            StreamState::Play => (),
        }

        if !packet.encrypted || self.policy == DecryptPolicy::Skip {
            return Ok(packet.data.to_vec());
        }

        let handler = self
            .handler
            .as_mut()
            .ok_or_else(|| DecryptError::config("stream has no scheme handler"))?;

        handler.process(packet, self.policy).inspect_err(|e| {
            log::debug!("sample dropped: {}", e);
        })
    }
}

fn build_handler(
    scheme: ProtectionScheme,
    props: &StreamProperties,
    key_info: Option<&KeyInfoRecord>,
    config: &DecryptConfig,
) -> Result<Box<dyn SchemeHandler>> {
    Ok(match scheme {
        ProtectionScheme::Cenc
        | ProtectionScheme::Cbc1
        | ProtectionScheme::Cens
        | ProtectionScheme::Cbcs
        | ProtectionScheme::Piff => {
            let key_info = key_info
                .cloned()
                .ok_or_else(|| DecryptError::config(format!("{} stream without key info", scheme)))?;

            let mode = match (scheme, props.piff_algorithm) {
                (ProtectionScheme::Piff, Some(2)) => CipherMode::Cbc,
                (ProtectionScheme::Piff, Some(0 | 1) | None) => CipherMode::Ctr,
                (ProtectionScheme::Piff, Some(x)) => {
                    return Err(DecryptError::config(format!(
                        "unsupported PIFF algorithm {}",
                        x
                    )));
                }
                _ => scheme.mode(),
            };

            let pattern = if scheme.supports_pattern() {
                props.pattern
            } else {
                if props.pattern.is_some_and(|x| x.is_active()) {
                    log::warn!("ignoring crypt pattern of {} stream", scheme);
                }
                None
            };

            Box::new(CencHandler {
                key_info,
                decrypter: SampleDecrypter::new(mode)
                    .pattern(pattern)
                    .iv_patch(config.hls_iv_patch),
                contexts: Vec::new(),
            })
        }
        ProtectionScheme::Isma => Box::new(IsmaHandler {
            format: props.isma_format,
            decrypter: None,
        }),
        ProtectionScheme::Oma => {
            if props.kms_uri.is_none() {
                return Err(DecryptError::invalid("OMA stream without key management URI"));
            }

            Box::new(OmaHandler {
                selective_encryption: props.oma_selective_encryption,
                preview: props.oma_preview_range.is_some(),
                key: None,
            })
        }
        ProtectionScheme::Adobe => Box::new(AdobeHandler { key: None }),
        ProtectionScheme::HlsSampleAes => {
            let codec = match props.codec {
                MediaCodec::Avc { nal_length_size } => SampleAesCodec::Avc { nal_length_size },
                MediaCodec::Aac | MediaCodec::Ac3 => SampleAesCodec::Audio,
                MediaCodec::Other => {
                    return Err(DecryptError::config(
                        "SAMPLE-AES needs an AVC, AAC or AC-3 stream",
                    ));
                }
            };

            Box::new(SampleAesHandler {
                codec,
                decrypter: None,
            })
        }
    })
}
