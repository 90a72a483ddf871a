use crate::{
    config::DecryptConfig,
    decrypter::DecryptPolicy,
    error::{DecryptError, Result},
    props::{SamplePacket, StreamProperties},
    resolver::{FetchId, FetchRequest, KeyFetcher, KeySlot, default_fetcher},
    stream::{StreamCryptState, StreamState},
};
use std::collections::HashMap;

pub type StreamId = u32;

/// Result of handing a sample to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Processed {
    Sample(Vec<u8>),
    /// A key fetch is running. Deliver the sample again after [`DecryptEngine::poll_keys`].
    PendingKeys,
}

struct PendingFetch {
    stream: StreamId,
    fetch: FetchId,
}

/// Decryption engine for any number of streams.
///
/// Driven from a single thread: the caller configures streams, forwards play/stop events and
/// samples, and calls [`poll_keys`](Self::poll_keys) while [`has_pending_keys`](Self::has_pending_keys)
/// is true. No sample of any stream is decrypted while a key fetch is outstanding.
///
/// # Example
///
/// ```
/// use vsd_cenc::{DecryptConfig, DecryptEngine, Processed, SamplePacket, StreamProperties};
///
/// let config = DecryptConfig::builder().default_key([0x2b; 16]).build();
/// let mut engine = DecryptEngine::new(config);
///
/// let mut props = StreamProperties::new("adkm", 1);
/// props.track_id = Some(1);
/// engine.configure_stream(1, props)?;
/// engine.play(1)?;
///
/// // unencrypted Adobe access unit
/// let output = engine.process(1, &SamplePacket::new(&[0x00, 0xAA, 0xBB]))?;
/// assert_eq!(output, Processed::Sample(vec![0xAA, 0xBB]));
/// # Ok::<(), vsd_cenc::DecryptError>(())
/// ```
pub struct DecryptEngine {
    config: DecryptConfig,
    streams: HashMap<StreamId, StreamCryptState>,
    fetcher: Box<dyn KeyFetcher>,
    pending: Vec<PendingFetch>,
}

impl DecryptEngine {
    pub fn new(config: DecryptConfig) -> Self {
        Self::with_fetcher(config, default_fetcher())
    }

    pub fn with_fetcher(config: DecryptConfig, fetcher: Box<dyn KeyFetcher>) -> Self {
        Self {
            config,
            streams: HashMap::new(),
            fetcher,
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> &DecryptConfig {
        &self.config
    }

    /// Announce or update the protection metadata of a stream and start key resolution.
    ///
    /// Unchanged metadata is detected and leaves the stream as it is.
    pub fn configure_stream(&mut self, id: StreamId, props: StreamProperties) -> Result<StreamState> {
        let policy = self.config.policy;
        let stream = self
            .streams
            .entry(id)
            .or_insert_with(|| StreamCryptState::new(policy));

        match stream.configure(props, &self.config) {
            Ok(true) => (),
            Ok(false) => return Ok(stream.state()),
            Err(e) => {
                self.cancel_fetches(id);
                return Err(e);
            }
        }

        self.cancel_fetches(id);
        self.drive(id)?;
        self.state(id)
            .ok_or_else(|| DecryptError::config(format!("unknown stream {}", id)))
    }

    /// Start decryption. Keys still being resolved delay the transition.
    pub fn play(&mut self, id: StreamId) -> Result<()> {
        self.stream_mut(id)?.play()?;
        self.drive(id)
    }

    /// Tear down the cipher state of a stream and discard its running fetches.
    pub fn stop(&mut self, id: StreamId) -> Result<()> {
        self.stream_mut(id)?.stop();
        self.cancel_fetches(id);
        Ok(())
    }

    pub fn remove_stream(&mut self, id: StreamId) -> bool {
        self.cancel_fetches(id);
        self.streams.remove(&id).is_some()
    }

    pub fn state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.get(&id).map(|x| x.state())
    }

    pub fn stream(&self, id: StreamId) -> Option<&StreamCryptState> {
        self.streams.get(&id)
    }

    pub fn key_slots(&self, id: StreamId) -> Option<&[KeySlot]> {
        self.streams.get(&id).map(|x| x.keys().slots.as_slice())
    }

    pub fn has_pending_keys(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_key_count(&self) -> usize {
        self.pending.len()
    }

    /// Collect finished fetches and continue resolution of their streams.
    ///
    /// Returns the errors raised while doing so. A [`DecryptError::TransientIo`] leaves its
    /// stream in [`StreamState::Setup`] until [`retry_keys`](Self::retry_keys) or
    /// [`relax_policy`](Self::relax_policy) is called.
    pub fn poll_keys(&mut self) -> Vec<(StreamId, DecryptError)> {
        let mut errors = Vec::new();
        let mut finished = Vec::new();

        self.pending.retain(|x| match self.fetcher.poll(x.fetch) {
            Some(result) => {
                finished.push((x.stream, result));
                false
            }
            None => true,
        });

        for (id, result) in finished {
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };

            match stream.complete_fetch(&self.config, result) {
                Ok(Some(request)) => self.start_fetch(id, request),
                Ok(None) => (),
                Err(e) => errors.push((id, e)),
            }
        }

        errors
    }

    /// Issue the failed fetch of a stream again.
    pub fn retry_keys(&mut self, id: StreamId) -> Result<()> {
        if self.stream_mut(id)?.retry() {
            self.drive(id)?;
        }
        Ok(())
    }

    /// Switch a stream to another policy. Under anything but [`DecryptPolicy::Full`] a failed
    /// fetch is given up and resolution moves on.
    pub fn relax_policy(&mut self, id: StreamId, policy: DecryptPolicy) -> Result<()> {
        if self.stream_mut(id)?.relax_policy(policy) {
            self.drive(id)?;
        }
        Ok(())
    }

    /// Decrypt one sample.
    pub fn process(&mut self, id: StreamId, packet: &SamplePacket) -> Result<Processed> {
        if self.has_pending_keys() {
            return Ok(Processed::PendingKeys);
        }

        self.stream_mut(id)?.process(packet).map(Processed::Sample)
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut StreamCryptState> {
        self.streams
            .get_mut(&id)
            .ok_or_else(|| DecryptError::config(format!("unknown stream {}", id)))
    }

    fn drive(&mut self, id: StreamId) -> Result<()> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };

        if let Some(request) = stream.resolve(&self.config)? {
            self.start_fetch(id, request);
        }

        Ok(())
    }

    fn start_fetch(&mut self, id: StreamId, request: FetchRequest) {
        log::debug!("stream {} waits for {}", id, request.url);
        let fetch = self.fetcher.start(request);
        self.pending.push(PendingFetch { stream: id, fetch });
    }

    fn cancel_fetches(&mut self, id: StreamId) {
        let fetcher = &mut self.fetcher;

        self.pending.retain(|x| {
            if x.stream == id {
                fetcher.cancel(x.fetch);
                false
            } else {
                true
            }
        });
    }
}
