//! # PageRoute Net
//!
//! Request and response types shared by the page controller and the
//! background worker, plus the network backends the worker falls back to.
//!
//! ## Design Goals
//!
//! 1. **fetch()-shaped types**: requests carry mode, destination and referrer
//!    so the worker can classify them
//! 2. **Pluggable network**: the worker only sees the [`Fetcher`] trait
//! 3. **Real and in-memory backends**: [`HttpFetcher`] over reqwest,
//!    [`MemoryFetcher`] for static sites held in memory

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod memory;

pub use memory::MemoryFetcher;

/// Header set on synthesized responses that block a document navigation.
pub const PREVENTED_HEADER: &str = "x-pageroute-prevented";

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unavailable: {0}")]
    Offline(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as seen by a fetch handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation.
    Navigate,
    /// Same-origin subresource fetch.
    #[default]
    SameOrigin,
    /// Cross-origin fetch with CORS.
    Cors,
    /// Opaque cross-origin fetch.
    NoCors,
}

/// What the response will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestDestination {
    /// A full HTML document.
    Document,
    /// Script-initiated fetch (fragments, JSON).
    #[default]
    Empty,
    Image,
    Font,
    Script,
    Style,
    Other,
}

/// A request flowing from a page to the worker (or straight to the network).
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
    pub destination: RequestDestination,
    pub referrer: Option<Url>,
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    /// Create a script-initiated GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            mode: RequestMode::SameOrigin,
            destination: RequestDestination::Empty,
            referrer: None,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Create a browser-level document navigation.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            destination: RequestDestination::Document,
            ..Self::get(url)
        }
    }

    /// Set referrer.
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Set destination.
    pub fn destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this loads a full document rather than a fragment.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate || self.destination == RequestDestination::Document
    }
}

/// A response, either from the network, the cache, or synthesized by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub url: Url,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub from_cache: bool,
}

impl FetchResponse {
    /// Create a response with an explicit status.
    pub fn with_status(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HashMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// Create a 200 response.
    pub fn ok(url: Url, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self::with_status(url, StatusCode::OK, body).header("content-type", content_type)
    }

    /// Create a JSON 200 response.
    pub fn json<T: serde::Serialize>(url: Url, value: &T) -> Result<Self, NetError> {
        let body = serde_json::to_vec(value).map_err(|e| NetError::RequestFailed(e.to_string()))?;
        Ok(Self::ok(url, "application/json", body))
    }

    /// Create an empty 204 response.
    pub fn no_content(url: Url) -> Self {
        Self::with_status(url, StatusCode::NO_CONTENT, Bytes::new())
    }

    /// Create the empty response that replaces a blocked document navigation.
    pub fn navigation_prevented(url: Url) -> Self {
        let mut response = Self::no_content(url).header(PREVENTED_HEADER, "1");
        response.status_text = "Navigation Prevented".to_string();
        response
    }

    /// Create a 404 response.
    pub fn not_found(url: Url) -> Self {
        Self::with_status(url, StatusCode::NOT_FOUND, Bytes::new())
    }

    /// Create a network error response.
    pub fn network_error(url: Url) -> Self {
        Self {
            url,
            status: 0,
            status_text: "Network Error".to_string(),
            headers: HashMap::new(),
            body: Bytes::new(),
            from_cache: false,
        }
    }

    /// Add a header (names are stored lowercase).
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Check if the status is 2xx.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if this is a blocked navigation.
    pub fn is_prevented(&self) -> bool {
        self.headers.contains_key(PREVENTED_HEADER)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Network access as seen by the worker.
pub trait Fetcher: Send + Sync {
    /// Fetch a request. Non-2xx statuses are responses, not errors.
    fn fetch<'a>(&'a self, request: &'a FetchRequest)
        -> BoxFuture<'a, Result<FetchResponse, NetError>>;
}

/// HTTP loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("PageRoute/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] backed by a real HTTP client.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!("HttpFetcher initialized");

        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        request: &'a FetchRequest,
    ) -> BoxFuture<'a, Result<FetchResponse, NetError>> {
        Box::pin(async move {
            debug!(url = %request.url, method = %request.method, "Fetching resource");

            let mut req_builder = self
                .client
                .request(request.method.clone(), request.url.clone());

            if let Some(ref referrer) = request.referrer {
                req_builder = req_builder.header("Referer", referrer.as_str());
            }

            if let Some(timeout) = request.timeout {
                req_builder = req_builder.timeout(timeout);
            }

            let response = req_builder.send().await?;

            let status = response.status();
            let url = response.url().clone();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            let body = response.bytes().await?;

            trace!(url = %url, status = %status, body_len = body.len(), "Response received");

            Ok(FetchResponse {
                url,
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
                headers,
                body,
                from_cache: false,
            })
        })
    }
}
