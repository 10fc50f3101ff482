//! URL retrieval with single-flight caching.
//!
//! The Rivet `/retrieve` endpoint asks the server to download a URL and
//! pool the result. Popular URLs get hammered by many clients at once, so
//! fetches are single-flight: one download per URL at a time, with
//! concurrent and closely-following callers sharing the finished result
//! for ten minutes. A fetch that would land on this server's own public
//! blob URLs is short-circuited without downloading anything.

use crate::guard::FetchGuard;
use futures::StreamExt;
use serde::Serialize;
use silo_core::ContentHash;
use silo_metadata::{BackupRepo, FileSizeRepo, MetadataStore, NameMapRepo};
use silo_proxy::{canonicalize_to_spool, Spool};
use silo_storage::{BlobBackend, ByteStream, PutOptions, StorageError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// How long a finished retrieval answers later callers.
const CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Maximum redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// User agent sent on outbound fetches.
const USER_AGENT: &str = "Silo Rivet (+https://silo-pool.example/rivet)";

/// What a retrieval actually did, surfaced to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RivetResult {
    /// Downloaded and newly stored. Worst case.
    Added,
    /// Downloaded, but the hash was already pooled; bytes discarded.
    Present,
    /// Short-circuited via a self-referential URL; nothing downloaded.
    Found,
    /// Answered entirely by another caller's recent fetch. Best case.
    Cached,
}

/// Informational classification of how much work a retrieval performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Temperature {
    Freezing,
    Cold,
    Warm,
    Hot,
    Scalding,
}

/// A finished retrieval.
#[derive(Clone, Copy, Debug)]
pub struct Retrieval {
    pub hash: ContentHash,
    pub result: RivetResult,
    pub temperature: Temperature,
}

/// Retrieval failures. Cloneable so one failed fetch can answer every
/// caller that was waiting on it.
#[derive(Clone, Debug, Error)]
pub enum FetchError {
    #[error("Illegal host: {0}")]
    IllegalHost(String),

    #[error("unsuccessful response code to {phase}: {code}")]
    UpstreamStatus { phase: &'static str, code: u16 },

    #[error("upstream refused connection")]
    UpstreamConnect,

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("too many redirects")]
    TooManyRedirects,

    #[error("{0}")]
    Internal(String),
}

impl FetchError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout
        } else if err.is_connect() {
            Self::UpstreamConnect
        } else {
            Self::Internal(format!("outbound request failed: {err}"))
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

/// The outcome published to everyone waiting on a URL's fetch.
type Published = Option<Result<Retrieval, FetchError>>;

enum Slot {
    Ready { retrieval: Retrieval, at: Instant },
    Pending(watch::Receiver<Published>),
}

/// Single-flight retriever with a TTL'd URL cache.
pub struct Retriever {
    client: reqwest::Client,
    guard: FetchGuard,
    backend: Arc<dyn BlobBackend>,
    metadata: Arc<dyn MetadataStore>,
    /// Host[:port] form of the public URL, for short-circuit detection.
    public_host: String,
    cache: Mutex<HashMap<String, Slot>>,
}

impl Retriever {
    pub fn new(
        backend: Arc<dyn BlobBackend>,
        metadata: Arc<dyn MetadataStore>,
        public_url: &str,
        allow_private_networks: bool,
        connect_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            // Redirects are followed manually so every hop passes the guard.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client construction cannot fail with static config");

        let public_host = public_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();

        Self {
            client,
            guard: FetchGuard::new(allow_private_networks),
            backend,
            metadata,
            public_host,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Retrieve a URL, deduplicating against concurrent and recent
    /// fetches of the same URL.
    pub async fn retrieve(self: &Arc<Self>, url: &str) -> Result<Retrieval, FetchError> {
        loop {
            enum Action {
                Hit(Retrieval),
                Wait(watch::Receiver<Published>),
                Load(watch::Sender<Published>, watch::Receiver<Published>),
            }

            let action = {
                let mut cache = self.cache.lock().expect("url cache poisoned");
                match cache.get(url) {
                    Some(Slot::Ready { retrieval, at }) if at.elapsed() < CACHE_TTL => {
                        Action::Hit(*retrieval)
                    }
                    Some(Slot::Pending(rx)) => Action::Wait(rx.clone()),
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        cache.insert(url.to_string(), Slot::Pending(rx.clone()));
                        Action::Load(tx, rx)
                    }
                }
            };

            match action {
                Action::Hit(retrieval) => {
                    return Ok(Retrieval {
                        hash: retrieval.hash,
                        result: RivetResult::Cached,
                        temperature: Temperature::Scalding,
                    });
                }
                Action::Wait(mut rx) => {
                    let _ = rx.changed().await;
                    let published = rx.borrow().clone();
                    match published {
                        Some(Ok(retrieval)) => {
                            return Ok(Retrieval {
                                hash: retrieval.hash,
                                result: RivetResult::Cached,
                                temperature: Temperature::Scalding,
                            });
                        }
                        Some(Err(e)) => return Err(e),
                        // The loading task died without publishing. Evict
                        // its dead registration before racing for the slot
                        // again.
                        None => {
                            let mut cache = self.cache.lock().expect("url cache poisoned");
                            if let Some(Slot::Pending(pending)) = cache.get(url) {
                                if pending.same_channel(&rx) {
                                    cache.remove(url);
                                }
                            }
                            continue;
                        }
                    }
                }
                Action::Load(tx, mut rx) => {
                    // The fetch runs detached: a caller that disconnects
                    // must not stop it, since its result still populates
                    // the cache for the next caller.
                    let this = Arc::clone(self);
                    let url = url.to_string();
                    tokio::spawn(async move {
                        let result = this.load(&url).await;
                        {
                            let mut cache = this.cache.lock().expect("url cache poisoned");
                            match &result {
                                Ok(retrieval) => {
                                    cache.insert(
                                        url.clone(),
                                        Slot::Ready {
                                            retrieval: *retrieval,
                                            at: Instant::now(),
                                        },
                                    );
                                }
                                Err(_) => {
                                    cache.remove(&url);
                                }
                            }
                        }
                        let _ = tx.send(Some(result));
                    });

                    let _ = rx.changed().await;
                    let published = rx.borrow().clone();
                    match published {
                        // The initiating caller reports the fresh outcome,
                        // not CACHED.
                        Some(result) => return result,
                        None => continue,
                    }
                }
            }
        }
    }

    /// Perform the actual download and store. Runs at most once per URL
    /// at a time.
    async fn load(&self, url_str: &str) -> Result<Retrieval, FetchError> {
        let url = reqwest::Url::parse(url_str)
            .map_err(|e| FetchError::IllegalHost(format!("unparseable URL: {e}")))?;
        self.guard.check_url(&url).await?;

        if let Some(hash) = self.short_circuit(&url).await? {
            return Ok(Retrieval {
                hash,
                result: RivetResult::Found,
                temperature: Temperature::Hot,
            });
        }

        // Probe with HEAD first, following redirects manually so each hop
        // is re-validated and checked for a self-referential target.
        let mut current = url;
        let mut hops = 0;
        let final_url = loop {
            let response = self
                .client
                .head(current.clone())
                .send()
                .await
                .map_err(FetchError::from_reqwest)?;

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or(FetchError::UpstreamStatus {
                        phase: "HEAD",
                        code: response.status().as_u16(),
                    })?;
                let next = current
                    .join(location)
                    .map_err(|e| FetchError::IllegalHost(format!("bad redirect target: {e}")))?;
                self.guard.check_url(&next).await?;
                if let Some(hash) = self.short_circuit(&next).await? {
                    return Ok(Retrieval {
                        hash,
                        result: RivetResult::Found,
                        temperature: Temperature::Warm,
                    });
                }
                hops += 1;
                if hops > MAX_REDIRECTS {
                    return Err(FetchError::TooManyRedirects);
                }
                current = next;
                continue;
            }

            if !response.status().is_success() {
                return Err(FetchError::UpstreamStatus {
                    phase: "HEAD",
                    code: response.status().as_u16(),
                });
            }
            break current;
        };

        let response = self
            .client
            .get(final_url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(FetchError::UpstreamStatus {
                phase: "GET",
                code: response.status().as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        // Spool the download while canonicalizing and hashing it.
        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| StorageError::Io(std::io::Error::other(e)))),
        );
        let raw = Spool::from_stream(body)
            .await
            .map_err(FetchError::internal)?;
        let (canonical, hash, size) = canonicalize_to_spool(raw)
            .await
            .map_err(FetchError::internal)?;

        if self
            .metadata
            .hash_mapped(&hash)
            .await
            .map_err(FetchError::internal)?
        {
            // Already pooled; the downloaded bytes are discarded.
            tracing::debug!(url = url_str, hash = %hash, "retrieved content already pooled");
            return Ok(Retrieval {
                hash,
                result: RivetResult::Present,
                temperature: Temperature::Cold,
            });
        }

        self.store_spool(&hash, canonical, content_type.as_deref())
            .await
            .map_err(FetchError::internal)?;
        self.metadata
            .put_pending_backup(&hash)
            .await
            .map_err(FetchError::internal)?;
        self.metadata
            .put_file_size(&hash, size)
            .await
            .map_err(FetchError::internal)?;

        tracing::info!(url = url_str, hash = %hash, size, "retrieved content added to pool");
        Ok(Retrieval {
            hash,
            result: RivetResult::Added,
            temperature: Temperature::Freezing,
        })
    }

    /// Detect a URL pointing at this server's own public hash-addressed
    /// path whose hash is already known; no download is needed then.
    async fn short_circuit(&self, url: &reqwest::Url) -> Result<Option<ContentHash>, FetchError> {
        let Some(host) = url.host_str() else {
            return Ok(None);
        };
        let default_port = if url.scheme() == "https" { 443 } else { 80 };
        let full_host = match url.port() {
            Some(port) if port != default_port => format!("{host}:{port}"),
            _ => host.to_string(),
        };
        if full_host != self.public_host {
            return Ok(None);
        }

        let Some(segments) = url.path_segments() else {
            return Ok(None);
        };
        let segments: Vec<&str> = segments.collect();
        if segments.len() != 4 || segments[0] != "blobs" {
            return Ok(None);
        }
        let prelude = format!("{}{}", segments[1], segments[2]);
        let hash_str = segments[3];
        if !hash_str.starts_with(&prelude)
            || !hash_str.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Ok(None);
        }
        let Ok(hash) = ContentHash::from_hex(hash_str) else {
            return Ok(None);
        };
        if self
            .metadata
            .hash_mapped(&hash)
            .await
            .map_err(FetchError::internal)?
        {
            Ok(Some(hash))
        } else {
            Ok(None)
        }
    }

    /// Upload a canonical spool to the blob path for `hash`.
    async fn store_spool(
        &self,
        hash: &ContentHash,
        spool: Spool,
        content_type: Option<&str>,
    ) -> Result<(), silo_proxy::ProxyError> {
        let path = hash.blob_path();
        let opts = PutOptions::public(content_type);
        let mut stream = spool.into_stream()?;
        let mut upload = self.backend.put_stream(&path, &opts).await?;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    if let Err(e) = upload.write(chunk).await {
                        let _ = upload.abort().await;
                        return Err(e.into());
                    }
                }
                Err(e) => {
                    let _ = upload.abort().await;
                    return Err(e.into());
                }
            }
        }
        upload.finish().await?;
        Ok(())
    }

    /// Store a pre-hashed raw payload (the Rivet upload path).
    pub async fn store_raw(
        &self,
        hash: &ContentHash,
        data: Spool,
        content_type: Option<&str>,
    ) -> Result<(), silo_proxy::ProxyError> {
        let size = data.len();
        self.store_spool(hash, data, content_type).await?;
        self.metadata.put_pending_backup(hash).await?;
        self.metadata.put_file_size(hash, size).await?;
        Ok(())
    }

    /// Drop any cached entry for a URL. Test hook.
    pub fn evict(&self, url: &str) {
        self.cache.lock().expect("url cache poisoned").remove(url);
    }
}
