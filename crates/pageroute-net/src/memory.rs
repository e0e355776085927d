//! Static site served from memory.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::StatusCode;
use tracing::{debug, trace};
use url::Url;

use crate::{FetchRequest, FetchResponse, Fetcher, NetError};

#[derive(Debug, Clone)]
struct StaticFile {
    content_type: String,
    body: Bytes,
}

/// A [`Fetcher`] that serves a fixed set of files under one base URL.
///
/// Directory URLs resolve to their `index.html`. Unknown paths answer 404.
/// Every fetched URL is recorded so callers can assert on network traffic.
#[derive(Debug)]
pub struct MemoryFetcher {
    base: Url,
    files: RwLock<HashMap<String, StaticFile>>,
    offline: AtomicBool,
    latency: Option<Duration>,
    requests: Mutex<Vec<Url>>,
}

impl MemoryFetcher {
    /// Create an empty site rooted at `base`.
    pub fn new(base: Url) -> Self {
        Self {
            base,
            files: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
            latency: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Load every file below `dir`, keyed by its path relative to `dir`.
    pub fn from_dir(base: Url, dir: impl AsRef<Path>) -> Result<Self, NetError> {
        let fetcher = Self::new(base);
        let root = dir.as_ref();
        let mut pending = vec![root.to_path_buf()];

        while let Some(current) = pending.pop() {
            for entry in std::fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(root)
                    .map_err(|e| NetError::InvalidUrl(e.to_string()))?;
                let key: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                fetcher.insert(&key.join("/"), std::fs::read(&path)?)?;
            }
        }

        debug!(base = %fetcher.base, files = fetcher.len(), "Loaded static site");
        Ok(fetcher)
    }

    /// Simulate per-request network latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Add or replace a file. `path` is resolved against the base URL.
    pub fn insert(&self, path: &str, body: impl Into<Bytes>) -> Result<(), NetError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| NetError::InvalidUrl(format!("{}: {}", path, e)))?;
        let content_type = mime_guess::from_path(url.path())
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                cache_key(&url),
                StaticFile {
                    content_type,
                    body: body.into(),
                },
            );
        Ok(())
    }

    /// Remove a file.
    pub fn remove(&self, path: &str) -> bool {
        let Ok(url) = self.base.join(path) else {
            return false;
        };
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cache_key(&url))
            .is_some()
    }

    /// Toggle simulated network loss.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of files held.
    pub fn len(&self) -> usize {
        self.files.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every URL fetched so far, in order.
    pub fn requests(&self) -> Vec<Url> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many times `url` was fetched.
    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }

    fn lookup(&self, url: &Url) -> Option<StaticFile> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = files.get(&cache_key(url)) {
            return Some(file.clone());
        }
        if url.path().ends_with('/') {
            let index = url.join("index.html").ok()?;
            return files.get(&cache_key(&index)).cloned();
        }
        None
    }
}

fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

impl Fetcher for MemoryFetcher {
    fn fetch<'a>(
        &'a self,
        request: &'a FetchRequest,
    ) -> BoxFuture<'a, Result<FetchResponse, NetError>> {
        Box::pin(async move {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request.url.clone());

            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }

            if self.offline.load(Ordering::SeqCst) {
                return Err(NetError::Offline(request.url.to_string()));
            }

            match self.lookup(&request.url) {
                Some(file) => {
                    trace!(url = %request.url, "Static hit");
                    Ok(FetchResponse::with_status(request.url.clone(), StatusCode::OK, file.body)
                        .header("content-type", &file.content_type))
                }
                None => {
                    trace!(url = %request.url, "Static miss");
                    Ok(FetchResponse::not_found(request.url.clone()))
                }
            }
        })
    }
}
