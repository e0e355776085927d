//! Cache API: named namespaces of URL-keyed responses.
//!
//! [`CacheStorage`] is the plain data structure; [`Caches`] and
//! [`CacheHandle`] are the shared async handles the worker uses. When the
//! storage is bound to a directory every namespace is mirrored to one JSON
//! file, rewritten after each mutation. The rewrite goes through `tokio::fs`
//! while the write guard is held, so files land in mutation order.

use hashbrown::HashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use pageroute_net::{FetchRequest, FetchResponse, Fetcher};

/// Cache errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Failed to persist cache '{name}': {message}")]
    Persist { name: String, message: String },

    #[error("Corrupt cache data: {0}")]
    Corrupt(String),

    #[error("Failed to fetch '{url}': {message}")]
    Fetch { url: String, message: String },
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Cache Entry ====================

/// A stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response.
    pub fn from_response(response: &FetchResponse) -> Self {
        Self {
            url: response.url.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// A synthesized 200 entry holding `body`.
    pub fn blob(url: &str, content_type: &str, body: Vec<u8>) -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        Self {
            url: url.to_string(),
            status: 200,
            status_text: "OK".to_string(),
            headers,
            body,
            cached_at: now_millis(),
        }
    }

    /// Rebuild the response, flagged as served from cache.
    pub fn to_response(&self) -> Result<FetchResponse, CacheError> {
        let url = Url::parse(&self.url)
            .map_err(|e| CacheError::Corrupt(format!("entry url '{}': {}", self.url, e)))?;
        Ok(FetchResponse {
            url,
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: self.body.clone().into(),
            from_cache: true,
        })
    }
}

// ==================== Cache ====================

/// One cache namespace.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: IndexMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: IndexMap::new(),
        }
    }

    /// Match a key.
    pub fn match_request(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, returning the one it replaced.
    pub fn put(&mut self, key: &str, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(key.to_string(), entry)
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.shift_remove(key)
    }

    /// All keys, in insertion order.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn restore(&mut self, key: &str, previous: Option<CacheEntry>) {
        match previous {
            Some(entry) => {
                self.entries.insert(key.to_string(), entry);
            }
            None => {
                self.entries.shift_remove(key);
            }
        }
    }
}

// ==================== Cache Storage ====================

/// All cache namespaces of a site.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    dir: Option<PathBuf>,
}

impl CacheStorage {
    /// Create in-memory cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage mirrored to `dir`, loading whatever it already holds.
    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| CacheError::Persist {
            name: dir.display().to_string(),
            message: e.to_string(),
        })?;

        let mut caches = HashMap::new();
        let listing = std::fs::read_dir(&dir).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        for entry in listing {
            let path = entry.map_err(|e| CacheError::Corrupt(e.to_string()))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read(&path).map_err(|e| CacheError::Corrupt(e.to_string()))?;
            match serde_json::from_slice::<Cache>(&data) {
                Ok(cache) => {
                    debug!(cache = %cache.name, entries = cache.len(), "Loaded cache from disk");
                    caches.insert(cache.name.clone(), cache);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache file"),
            }
        }

        Ok(Self {
            caches,
            dir: Some(dir),
        })
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache and its file.
    pub async fn delete(&mut self, name: &str) -> Result<bool, CacheError> {
        let Some(cache) = self.caches.remove(name) else {
            return Ok(false);
        };
        let Some(path) = self.file_for(name) else {
            return Ok(true);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => {
                self.caches.insert(name.to_string(), cache);
                Err(CacheError::Persist {
                    name: name.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Get all cache names, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.caches.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Match across all caches.
    pub fn match_request(&self, key: &str) -> Option<&CacheEntry> {
        self.caches
            .values()
            .find_map(|cache| cache.match_request(key))
    }

    /// Serialize a namespace for writing. `None` for in-memory storage.
    pub fn snapshot(&self, name: &str) -> Result<Option<(PathBuf, Vec<u8>)>, CacheError> {
        let (Some(path), Some(cache)) = (self.file_for(name), self.caches.get(name)) else {
            return Ok(None);
        };
        let data = serde_json::to_vec(cache).map_err(|e| CacheError::Persist {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        Ok(Some((path, data)))
    }

    /// Write a namespace to disk. No-op for in-memory storage.
    pub async fn persist(&self, name: &str) -> Result<(), CacheError> {
        match self.snapshot(name)? {
            Some((path, data)) => write_file(name, &path, data).await,
            None => Ok(()),
        }
    }

    fn file_for(&self, name: &str) -> Option<PathBuf> {
        let file: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.as_ref().map(|dir| dir.join(format!("{}.json", file)))
    }
}

/// Replace `path` through a temp file so readers never see half a namespace.
async fn write_file(name: &str, path: &Path, data: Vec<u8>) -> Result<(), CacheError> {
    let persist_err = |e: std::io::Error| CacheError::Persist {
        name: name.to_string(),
        message: e.to_string(),
    };
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await.map_err(persist_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(persist_err)
}

// ==================== Shared handles ====================

/// Shared cache storage (the `caches` global), cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Caches {
    storage: Arc<RwLock<CacheStorage>>,
}

impl Caches {
    /// In-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing storage.
    pub fn from_storage(storage: CacheStorage) -> Self {
        Self {
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    /// Storage mirrored to `dir`.
    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        Ok(Self::from_storage(CacheStorage::with_dir(dir)?))
    }

    /// Open (and create if needed) a namespace.
    pub async fn open(&self, name: &str) -> Result<CacheHandle, CacheError> {
        let mut storage = self.storage.write().await;
        if !storage.has(name) {
            storage.open(name);
            if let Err(e) = storage.persist(name).await {
                storage.caches.remove(name);
                return Err(e);
            }
            debug!(cache = %name, "Created cache");
        }
        Ok(CacheHandle {
            storage: Arc::clone(&self.storage),
            name: name.to_string(),
        })
    }

    pub async fn has(&self, name: &str) -> bool {
        self.storage.read().await.has(name)
    }

    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        self.storage.write().await.delete(name).await
    }

    pub async fn keys(&self) -> Vec<String> {
        self.storage
            .read()
            .await
            .keys()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Delete every namespace except `keep`, returning the deleted names.
    pub async fn retain_only(&self, keep: &str) -> Vec<String> {
        let mut storage = self.storage.write().await;
        let stale: Vec<String> = storage
            .keys()
            .into_iter()
            .filter(|name| *name != keep)
            .map(String::from)
            .collect();

        let mut deleted = Vec::with_capacity(stale.len());
        for name in stale {
            match storage.delete(&name).await {
                Ok(_) => {
                    info!(cache = %name, "Deleted stale cache");
                    deleted.push(name);
                }
                Err(e) => warn!(cache = %name, error = %e, "Failed to delete stale cache"),
            }
        }
        deleted
    }

    /// Match across all namespaces.
    pub async fn match_request(&self, key: &str) -> Option<CacheEntry> {
        self.storage.read().await.match_request(key).cloned()
    }
}

/// Handle on one namespace.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    storage: Arc<RwLock<CacheStorage>>,
    name: String,
}

impl CacheHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store an entry. On a persistence failure the previous entry is restored.
    pub async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        let mut storage = self.storage.write().await;
        let previous = storage.open(&self.name).put(key, entry);
        if let Err(e) = storage.persist(&self.name).await {
            storage.open(&self.name).restore(key, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Store a response under `key`.
    pub async fn put_response(&self, key: &str, response: &FetchResponse) -> Result<(), CacheError> {
        self.put(key, CacheEntry::from_response(response)).await
    }

    pub async fn match_request(&self, key: &str) -> Option<CacheEntry> {
        self.storage
            .read()
            .await
            .get(&self.name)
            .and_then(|cache| cache.match_request(key))
            .cloned()
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut storage = self.storage.write().await;
        let previous = storage.open(&self.name).delete(key);
        let removed = previous.is_some();
        if removed {
            if let Err(e) = storage.persist(&self.name).await {
                storage.open(&self.name).restore(key, previous);
                return Err(e);
            }
        }
        Ok(removed)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.storage
            .read()
            .await
            .get(&self.name)
            .map(|cache| cache.keys().into_iter().map(String::from).collect())
            .unwrap_or_default()
    }

    /// Fetch every URL and store them all, or none.
    ///
    /// Entries already in the namespace are untouched when any fetch fails.
    pub async fn add_all(&self, urls: &[Url], fetcher: &dyn Fetcher) -> Result<usize, CacheError> {
        let mut fetched = Vec::with_capacity(urls.len());
        for url in urls {
            let request = FetchRequest::get(url.clone());
            let response = fetcher.fetch(&request).await.map_err(|e| CacheError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            if !response.is_ok() {
                return Err(CacheError::Fetch {
                    url: url.to_string(),
                    message: format!("status {}", response.status),
                });
            }
            fetched.push((url.to_string(), CacheEntry::from_response(&response)));
        }

        let mut storage = self.storage.write().await;
        let cache = storage.open(&self.name);
        let previous: Vec<(String, Option<CacheEntry>)> = fetched
            .into_iter()
            .map(|(key, entry)| {
                let old = cache.put(&key, entry);
                (key, old)
            })
            .collect();

        if let Err(e) = storage.persist(&self.name).await {
            let cache = storage.open(&self.name);
            for (key, old) in previous.into_iter().rev() {
                cache.restore(&key, old);
            }
            return Err(e);
        }

        debug!(cache = %self.name, added = previous.len(), "Stored batch of responses");
        Ok(previous.len())
    }
}
