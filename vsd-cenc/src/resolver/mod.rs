//! Key resolution.
//!
//! Sources are tried in a fixed order, each one only filling slots that are still empty:
//!
//! | Source      | Material                                                    | Fetch |
//! |-------------|-------------------------------------------------------------|-------|
//! | `override`  | keys given to [`DecryptConfig`]                             | no    |
//! | `legacy`    | inline ISMACryp/OMA key management URI                      | no    |
//! | `bootstrap` | wrapped keys inside a bootstrap protection header           | no    |
//! | `key-file`  | `DRMInfo` XML file matched by track, representation, period | http  |
//! | `key-uri`   | SAMPLE-AES key URI                                          | http  |
//! | `clearkey`  | temporary key exchange with a license server                | http  |
//!
//! Local files are read in place. Remote sources hand a [`FetchRequest`] back to the
//! caller and resolution pauses until [`KeyResolver::complete`] is called with the result.

mod clearkey;
mod fetch;
mod key_file;
mod uri;

pub use fetch::{FetchId, FetchRequest, FetchResult, KeyFetcher, OfflineFetcher, default_fetcher};
#[cfg(feature = "http")]
pub use fetch::HttpFetcher;
pub use key_file::{CrypTrack, KeyFile};
pub use uri::{KeyLocation, KmsUri, key_from_bytes, parse_isma_kms, parse_key_uri};

use crate::{
    config::DecryptConfig,
    error::{DecryptError, Result},
    props::StreamProperties,
    pssh::PsshRecord,
    scheme::ProtectionScheme,
};
use std::{fmt, fs};

/// Where the key of a slot came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySource {
    Override,
    Legacy,
    Bootstrap,
    KeyFile,
    KeyUri,
    ClearKey,
}

impl KeySource {
    const ORDER: [Self; 6] = [
        Self::Override,
        Self::Legacy,
        Self::Bootstrap,
        Self::KeyFile,
        Self::KeyUri,
        Self::ClearKey,
    ];
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Override => "override",
            Self::Legacy => "legacy",
            Self::Bootstrap => "bootstrap",
            Self::KeyFile => "key-file",
            Self::KeyUri => "key-uri",
            Self::ClearKey => "clearkey",
        })
    }
}

/// One key slot of a stream, in key info order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySlot {
    /// `None` for schemes that do not signal KIDs.
    pub kid: Option<[u8; 16]>,
    pub key: Option<[u8; 16]>,
    pub source: Option<KeySource>,
    /// Never resolved, see [`DecryptConfig::invalid_slots`].
    pub forced_invalid: bool,
}

impl KeySlot {
    pub fn new(kid: Option<[u8; 16]>) -> Self {
        Self {
            kid,
            key: None,
            source: None,
            forced_invalid: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.key.is_some()
    }

    fn is_open(&self) -> bool {
        self.key.is_none() && !self.forced_invalid
    }

    pub fn kid_hex(&self) -> String {
        self.kid.map(hex::encode).unwrap_or_default()
    }
}

/// Key material of a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySet {
    pub slots: Vec<KeySlot>,
    /// ISMACryp salt.
    pub salt: Option<[u8; 8]>,
    /// Stream wide IV (SAMPLE-AES).
    pub iv: Option<[u8; 16]>,
}

impl KeySet {
    /// Build slots for `kids`, forcing the configured slots invalid and carrying keys over
    /// from `previous` when a KID is unchanged.
    pub fn new(kids: Vec<Option<[u8; 16]>>, config: &DecryptConfig, previous: &KeySet) -> Self {
        let slots = kids
            .into_iter()
            .enumerate()
            .map(|(i, kid)| {
                let mut slot = KeySlot::new(kid);

                if config.is_slot_invalidated(i + 1) {
                    slot.forced_invalid = true;
                } else if kid.is_some()
                    && let Some(x) = previous
                        .slots
                        .iter()
                        .find(|x| x.kid == kid && x.is_resolved())
                {
                    slot.key = x.key;
                    slot.source = x.source;
                }

                slot
            })
            .collect();

        Self {
            slots,
            salt: None,
            iv: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.slots.iter().any(|x| x.is_open())
    }

    pub fn has_any_key(&self) -> bool {
        self.slots.iter().any(|x| x.is_resolved())
    }

    /// Fill open slots for which `lookup` yields a key. Returns the number of slots filled.
    fn fill<F>(&mut self, source: KeySource, mut lookup: F) -> Result<usize>
    where
        F: FnMut(Option<&[u8; 16]>) -> Result<Option<[u8; 16]>>,
    {
        let mut filled = 0;

        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.is_open() {
                continue;
            }

            if let Some(key) = lookup(slot.kid.as_ref())? {
                log::info!(
                    "key slot {} resolved from {} (KID {})",
                    i + 1,
                    source,
                    if slot.kid.is_some() { slot.kid_hex() } else { "none".to_owned() }
                );
                slot.key = Some(key);
                slot.source = Some(source);
                filled += 1;
            }
        }

        Ok(filled)
    }

    fn open_kids(&self) -> Vec<[u8; 16]> {
        self.slots
            .iter()
            .filter(|x| x.is_open())
            .filter_map(|x| x.kid)
            .collect()
    }
}

/// Everything a resolution step reads.
pub struct ResolveInput<'a> {
    pub config: &'a DecryptConfig,
    pub props: &'a StreamProperties,
    pub scheme: ProtectionScheme,
    pub pssh: &'a [PsshRecord],
}

/// Outcome of [`KeyResolver::advance`].
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// Resolution pauses until the request completes.
    Fetch(FetchRequest),
    /// A request handed out earlier is still running.
    Waiting,
    /// Every source has been tried or every slot is filled.
    Finished,
}

/// Cursor over the key sources of one stream.
#[derive(Debug, Default)]
pub struct KeyResolver {
    next: usize,
    waiting: Option<KeySource>,
}

impl KeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start again from the first source.
    pub fn restart(&mut self) {
        self.next = 0;
        self.waiting = None;
    }

    pub fn is_finished(&self) -> bool {
        self.waiting.is_none() && self.next >= KeySource::ORDER.len()
    }

    pub fn waiting(&self) -> Option<KeySource> {
        self.waiting
    }

    /// Forget a running fetch. The next [`advance`](Self::advance) issues it again.
    pub fn cancel(&mut self) {
        self.waiting = None;
    }

    /// Give up on the current source and move on to the next one.
    pub fn skip(&mut self) {
        self.waiting = None;
        self.next += 1;
    }

    /// Run sources until one needs a fetch or none are left.
    pub fn advance(&mut self, input: &ResolveInput, keys: &mut KeySet) -> Result<Progress> {
        if self.waiting.is_some() {
            return Ok(Progress::Waiting);
        }

        while let Some(source) = KeySource::ORDER.get(self.next).copied() {
            if keys.is_complete() {
                self.next = KeySource::ORDER.len();
                break;
            }

            if let Some(request) = self.run(source, input, keys)? {
                self.waiting = Some(source);
                return Ok(Progress::Fetch(request));
            }

            self.next += 1;
        }

        Ok(Progress::Finished)
    }

    /// Apply the result of the fetch returned by the last [`advance`](Self::advance).
    ///
    /// A failed fetch is a [`DecryptError::TransientIo`] and leaves the cursor on the same
    /// source, so a later `advance` retries it.
    pub fn complete(
        &mut self,
        input: &ResolveInput,
        keys: &mut KeySet,
        result: FetchResult,
    ) -> Result<()> {
        let Some(source) = self.waiting.take() else {
            log::warn!("ignoring key fetch result, no fetch is running");
            return Ok(());
        };

        let data = result.map_err(DecryptError::TransientIo)?;

        match source {
            KeySource::KeyFile => apply_key_file(&data, input, keys)?,
            KeySource::KeyUri => {
                let key = key_from_bytes(&data)?;
                keys.fill(source, |_| Ok(Some(key)))?;
            }
            KeySource::ClearKey => {
                let pairs = clearkey::parse_response(&data)?;
                keys.fill(source, |kid| Ok(lookup_pair(&pairs, kid)))?;
            }
            KeySource::Override | KeySource::Legacy | KeySource::Bootstrap => (),
        }

        self.next += 1;
        Ok(())
    }

    fn run(
        &mut self,
        source: KeySource,
        input: &ResolveInput,
        keys: &mut KeySet,
    ) -> Result<Option<FetchRequest>> {
        match source {
            KeySource::Override => {
                keys.fill(source, |kid| Ok(input.config.key_for(kid).map(|x| x.key)))?;
            }
            KeySource::Legacy => {
                if let Some(KmsUri::Inline { key, salt }) = legacy_kms(input)?
                    && keys.fill(source, |_| Ok(Some(key)))? > 0
                {
                    keys.salt = Some(salt);
                }
            }
            KeySource::Bootstrap => {
                for record in input.pssh.iter().filter(|x| x.is_bootstrap()) {
                    let pairs = record.bootstrap_keys()?;
                    keys.fill(source, |kid| Ok(lookup_pair(&pairs, kid)))?;
                }
            }
            KeySource::KeyFile => {
                let Some(location) = key_file_location(input)? else {
                    return Ok(None);
                };

                match parse_key_uri(&location)? {
                    KeyLocation::Remote(url) => return Ok(Some(FetchRequest::get(url))),
                    KeyLocation::File(path) => {
                        let data = fs::read(&path).map_err(|e| {
                            DecryptError::TransientIo(format!("{} ({})", path.display(), e))
                        })?;
                        apply_key_file(&data, input, keys)?;
                    }
                    KeyLocation::Inline(data) => apply_key_file(&data, input, keys)?,
                }
            }
            KeySource::KeyUri => {
                if let Some(iv) = &input.props.hls_iv {
                    keys.iv = Some(parse_iv(iv)?);
                }

                let Some(uri) = &input.props.hls_key_uri else {
                    return Ok(None);
                };

                let key = match parse_key_uri(uri)? {
                    KeyLocation::Remote(url) => return Ok(Some(FetchRequest::get(url))),
                    KeyLocation::File(path) => key_from_bytes(&fs::read(&path).map_err(|e| {
                        DecryptError::TransientIo(format!("{} ({})", path.display(), e))
                    })?)?,
                    KeyLocation::Inline(data) => key_from_bytes(&data)?,
                };
                keys.fill(source, |_| Ok(Some(key)))?;
            }
            KeySource::ClearKey => {
                let url = input
                    .props
                    .clearkey_url
                    .as_ref()
                    .or(input.config.clearkey_url.as_ref());
                let kids = keys.open_kids();

                if let Some(url) = url
                    && !kids.is_empty()
                {
                    return Ok(Some(FetchRequest::post(
                        url.clone(),
                        clearkey::request_body(&kids)?,
                        clearkey::CONTENT_TYPE,
                    )));
                }
            }
        }

        Ok(None)
    }
}

fn legacy_kms(input: &ResolveInput) -> Result<Option<KmsUri>> {
    if !matches!(
        input.scheme,
        ProtectionScheme::Isma | ProtectionScheme::Oma
    ) {
        return Ok(None);
    }

    match &input.props.kms_uri {
        Some(uri) => parse_isma_kms(uri).map(Some),
        None => Ok(None),
    }
}

/// Stream reference first, then a key file named by an ISMACryp key management URI, then
/// the engine wide default. OMA rights issuer URLs are not key files.
fn key_file_location(input: &ResolveInput) -> Result<Option<String>> {
    if let Some(location) = &input.props.key_file {
        return Ok(Some(location.clone()));
    }

    if input.scheme == ProtectionScheme::Isma
        && let Some(KmsUri::KeyFile(location)) = legacy_kms(input)?
    {
        return Ok(Some(location));
    }

    Ok(input.config.key_file.clone())
}

fn apply_key_file(data: &[u8], input: &ResolveInput, keys: &mut KeySet) -> Result<()> {
    let file = KeyFile::parse(data)?;
    let props = input.props;

    let Some(track) = file.find(
        props.track_id,
        props.rep_id.as_deref(),
        props.period_id.as_deref(),
    ) else {
        log::warn!("no matching track in key file");
        return Ok(());
    };

    keys.fill(KeySource::KeyFile, |kid| track.key_for(kid))?;

    if keys.salt.is_none() {
        keys.salt = track.salt()?;
    }

    if keys.iv.is_none() {
        keys.iv = track.iv()?;
    }

    Ok(())
}

fn lookup_pair(pairs: &[([u8; 16], [u8; 16])], kid: Option<&[u8; 16]>) -> Option<[u8; 16]> {
    let kid = kid?;
    pairs.iter().find(|(x, _)| x == kid).map(|(_, key)| *key)
}

/// Stream IV: up to 32 hex characters, right aligned.
fn parse_iv(value: &str) -> Result<[u8; 16]> {
    let value = value.trim();
    let value = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let bytes = hex::decode(value)?;

    if bytes.len() > 16 {
        return Err(DecryptError::config(format!(
            "IV has {} bytes, at most 16 are allowed",
            bytes.len()
        )));
    }

    let mut iv = [0; 16];
    iv[16 - bytes.len()..].copy_from_slice(&bytes);
    Ok(iv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pssh::tests::bootstrap_record;

    fn input<'a>(
        config: &'a DecryptConfig,
        props: &'a StreamProperties,
        pssh: &'a [PsshRecord],
    ) -> ResolveInput<'a> {
        ResolveInput {
            config,
            props,
            scheme: ProtectionScheme::from_code(&props.scheme_type, props.scheme_version)
                .unwrap(),
            pssh,
        }
    }

    #[test]
    fn test_override_then_bootstrap() {
        let config = DecryptConfig::builder().key_bytes([1; 16], [0x11; 16]).build();
        let props = StreamProperties::new("cenc", ProtectionScheme::CENC_VERSION);
        let pssh = [bootstrap_record(&[([2; 16], [0x22; 16])], None)];
        let input = input(&config, &props, &pssh);

        let mut keys = KeySet::new(
            vec![Some([1; 16]), Some([2; 16]), Some([3; 16])],
            &config,
            &KeySet::default(),
        );
        let mut resolver = KeyResolver::new();

        assert_eq!(resolver.advance(&input, &mut keys).unwrap(), Progress::Finished);
        assert!(resolver.is_finished());

        assert_eq!(keys.slots[0].key, Some([0x11; 16]));
        assert_eq!(keys.slots[0].source, Some(KeySource::Override));
        assert_eq!(keys.slots[1].key, Some([0x22; 16]));
        assert_eq!(keys.slots[1].source, Some(KeySource::Bootstrap));
        assert!(!keys.slots[2].is_resolved());
        assert!(!keys.is_complete());
        assert!(keys.has_any_key());
    }

    #[test]
    fn test_forced_invalid_slot() {
        let config = DecryptConfig::builder()
            .key_bytes([1; 16], [0x11; 16])
            .invalidate_slot(1)
            .build();
        let props = StreamProperties::new("cenc", ProtectionScheme::CENC_VERSION);
        let input = input(&config, &props, &[]);

        let mut keys = KeySet::new(vec![Some([1; 16])], &config, &KeySet::default());
        KeyResolver::new().advance(&input, &mut keys).unwrap();

        assert!(keys.slots[0].forced_invalid);
        assert!(!keys.slots[0].is_resolved());
        assert!(keys.is_complete());
    }

    #[test]
    fn test_carry_over_keys() {
        let config = DecryptConfig::default();
        let mut previous = KeySet::new(vec![Some([1; 16])], &config, &KeySet::default());
        previous.slots[0].key = Some([0x11; 16]);
        previous.slots[0].source = Some(KeySource::ClearKey);

        let keys = KeySet::new(vec![Some([2; 16]), Some([1; 16])], &config, &previous);
        assert!(!keys.slots[0].is_resolved());
        assert_eq!(keys.slots[1].key, Some([0x11; 16]));
        assert_eq!(keys.slots[1].source, Some(KeySource::ClearKey));
    }

    #[test]
    fn test_isma_inline_kms() {
        let config = DecryptConfig::default();
        let mut props = StreamProperties::new("iAEC", 1);
        props.kms_uri = Some(format!("(key-hexa){}{}", "ab".repeat(16), "cd".repeat(8)));
        let input = input(&config, &props, &[]);

        let mut keys = KeySet::new(vec![None], &config, &KeySet::default());
        KeyResolver::new().advance(&input, &mut keys).unwrap();

        assert_eq!(keys.slots[0].key, Some([0xAB; 16]));
        assert_eq!(keys.slots[0].source, Some(KeySource::Legacy));
        assert_eq!(keys.salt, Some([0xCD; 8]));
    }

    #[test]
    fn test_remote_key_uri() {
        let config = DecryptConfig::default();
        let mut props = StreamProperties::new("saes", 1);
        props.hls_key_uri = Some("https://example.com/key.bin".to_owned());
        props.hls_iv = Some("0x01".to_owned());
        let input = input(&config, &props, &[]);

        let mut keys = KeySet::new(vec![None], &config, &KeySet::default());
        let mut resolver = KeyResolver::new();

        assert_eq!(
            resolver.advance(&input, &mut keys).unwrap(),
            Progress::Fetch(FetchRequest::get("https://example.com/key.bin"))
        );
        assert_eq!(resolver.waiting(), Some(KeySource::KeyUri));
        assert_eq!(resolver.advance(&input, &mut keys).unwrap(), Progress::Waiting);

        let error = resolver
            .complete(&input, &mut keys, Err("timed out".to_owned()))
            .unwrap_err();
        assert!(error.is_transient());

        // same source again
        assert!(matches!(
            resolver.advance(&input, &mut keys).unwrap(),
            Progress::Fetch(_)
        ));
        resolver.complete(&input, &mut keys, Ok(vec![0x42; 16])).unwrap();
        assert_eq!(resolver.advance(&input, &mut keys).unwrap(), Progress::Finished);

        assert_eq!(keys.slots[0].key, Some([0x42; 16]));
        assert_eq!(keys.iv.unwrap()[15], 1);
    }

    #[test]
    fn test_clearkey_request() {
        let config = DecryptConfig::builder()
            .clearkey_url("https://license.example/ck")
            .build();
        let props = StreamProperties::new("cbcs", ProtectionScheme::CENC_VERSION);
        let input = input(&config, &props, &[]);

        let mut keys = KeySet::new(vec![Some([0xFB; 16])], &config, &KeySet::default());
        let mut resolver = KeyResolver::new();

        let Progress::Fetch(request) = resolver.advance(&input, &mut keys).unwrap() else {
            panic!("expected a fetch");
        };
        assert_eq!(request.url, "https://license.example/ck");
        assert_eq!(request.content_type, Some("application/json"));

        let response = br#"{"keys":[{"kty":"oct","kid":"-_v7-_v7-_v7-_v7-_v7-w","k":"EREREREREREREREREREREQ"}]}"#;
        resolver.complete(&input, &mut keys, Ok(response.to_vec())).unwrap();
        assert_eq!(resolver.advance(&input, &mut keys).unwrap(), Progress::Finished);
        assert_eq!(keys.slots[0].key, Some([0x11; 16]));
    }

    #[test]
    fn test_parse_iv() {
        assert_eq!(parse_iv("0x01").unwrap()[15], 1);
        assert_eq!(parse_iv("000102030405060708090a0b0c0d0e0f").unwrap()[1], 1);
        assert!(parse_iv("00".repeat(17).as_str()).is_err());
    }
}
