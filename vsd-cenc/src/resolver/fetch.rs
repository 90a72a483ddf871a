use std::collections::HashMap;

pub type FetchId = u64;

/// Outcome of a fetch, the error is a human readable reason.
pub type FetchResult = std::result::Result<Vec<u8>, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// Sent as a POST body when present, otherwise the request is a GET.
    pub body: Option<Vec<u8>>,
    pub content_type: Option<&'static str>,
}

impl FetchRequest {
    pub fn get<T: Into<String>>(url: T) -> Self {
        Self {
            url: url.into(),
            body: None,
            content_type: None,
        }
    }

    pub fn post<T: Into<String>>(url: T, body: Vec<u8>, content_type: &'static str) -> Self {
        Self {
            url: url.into(),
            body: Some(body),
            content_type: Some(content_type),
        }
    }
}

/// Asynchronous retrieval of key material.
///
/// The engine never blocks on a fetch: it starts one, keeps processing gated and polls
/// until a result is available. Implementations may use threads internally but are only
/// called from the thread driving the engine.
pub trait KeyFetcher {
    fn start(&mut self, request: FetchRequest) -> FetchId;
    /// `None` while the fetch is still running. A result is returned exactly once.
    fn poll(&mut self, id: FetchId) -> Option<FetchResult>;
    /// Discard a fetch. Its result is never reported.
    fn cancel(&mut self, id: FetchId);
}

/// Fetcher used when network access is compiled out or unwanted.
#[derive(Default)]
pub struct OfflineFetcher {
    next_id: FetchId,
    failed: HashMap<FetchId, String>,
}

impl KeyFetcher for OfflineFetcher {
    fn start(&mut self, request: FetchRequest) -> FetchId {
        self.next_id += 1;
        self.failed.insert(
            self.next_id,
            format!("cannot fetch {} (network access is disabled)", request.url),
        );
        self.next_id
    }

    fn poll(&mut self, id: FetchId) -> Option<FetchResult> {
        self.failed.remove(&id).map(Err)
    }

    fn cancel(&mut self, id: FetchId) {
        self.failed.remove(&id);
    }
}

#[cfg(feature = "http")]
pub use http::HttpFetcher;

#[cfg(feature = "http")]
mod http {
    use super::{FetchId, FetchRequest, FetchResult, KeyFetcher};
    use reqwest::{blocking::Client, header};
    use std::{
        collections::HashMap,
        sync::mpsc::{self, Receiver, TryRecvError},
        thread,
    };

    /// Runs every fetch on its own worker thread with a blocking [`Client`].
    pub struct HttpFetcher {
        client: Client,
        next_id: FetchId,
        running: HashMap<FetchId, Receiver<FetchResult>>,
    }

    impl HttpFetcher {
        pub fn new(client: Client) -> Self {
            Self {
                client,
                next_id: 0,
                running: HashMap::new(),
            }
        }
    }

    impl Default for HttpFetcher {
        fn default() -> Self {
            Self::new(Client::new())
        }
    }

    impl KeyFetcher for HttpFetcher {
        fn start(&mut self, request: FetchRequest) -> FetchId {
            self.next_id += 1;
            let (sender, receiver) = mpsc::channel();
            let client = self.client.clone();

            log::debug!("fetching key material from {}", request.url);
            thread::spawn(move || {
                let _ = sender.send(fetch(&client, request));
            });

            self.running.insert(self.next_id, receiver);
            self.next_id
        }

        fn poll(&mut self, id: FetchId) -> Option<FetchResult> {
            let result = match self.running.get(&id)?.try_recv() {
                Ok(x) => x,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => Err("fetch worker exited".to_owned()),
            };

            self.running.remove(&id);
            Some(result)
        }

        fn cancel(&mut self, id: FetchId) {
            // the worker finishes on its own, its result is dropped with the channel
            self.running.remove(&id);
        }
    }

    fn fetch(client: &Client, request: FetchRequest) -> FetchResult {
        let mut builder = match request.body {
            Some(body) => client.post(&request.url).body(body),
            None => client.get(&request.url),
        };

        if let Some(content_type) = request.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }

        let response = builder
            .send()
            .and_then(|x| x.error_for_status())
            .map_err(|e| format!("{} ({})", request.url, e))?;

        response
            .bytes()
            .map(|x| x.to_vec())
            .map_err(|e| format!("{} ({})", request.url, e))
    }
}

/// Default fetcher for the enabled features.
pub fn default_fetcher() -> Box<dyn KeyFetcher> {
    #[cfg(feature = "http")]
    {
        Box::new(HttpFetcher::default())
    }

    #[cfg(not(feature = "http"))]
    {
        Box::new(OfflineFetcher::default())
    }
}
