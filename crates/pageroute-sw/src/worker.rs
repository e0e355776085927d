//! The worker runtime.
//!
//! Each active worker is one task draining an inbox of [`WorkerEvent`]s. The
//! task owns the [`RouteRegistry`] outright, so commits are serialized by
//! construction. Events that are already queued when the task wakes are
//! handled as one window: all `STORE_MAP`s in a window produce a single
//! commit and a single `MAP_READY` broadcast, and `CHECK_MAP`s and fetches in
//! the window are answered after that commit.

use hashbrown::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use url::Url;

use pageroute_common::{retry_with_backoff, RetryConfig, SiteConfig};
use pageroute_net::{FetchRequest, FetchResponse, Fetcher, NetError};

use crate::api::ApiContext;
use crate::batch::PendingBatch;
use crate::cache::CacheHandle;
use crate::clients::{ClientId, Clients};
use crate::intercept::{Interception, RequestInterceptor};
use crate::message::{ClientMessage, WorkerMessage};
use crate::registry::{RouteEntry, RouteRegistry, ROUTE_MAP_KEY};
use crate::{strategy, ServiceWorkerError, ServiceWorkerId};

// ==================== Config ====================

/// Worker-side settings for one site.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Site base; path ends with `/`.
    pub base_url: Url,
    /// Reserved API root; path ends with `/`.
    pub api_base: Url,
    /// How long a cold worker waits for routes before sending `REQUEST_ROUTES`.
    pub route_request_grace: Duration,
    pub cacheable_extensions: Vec<String>,
    /// Paths (relative to the base) stored during install.
    pub precache: Vec<String>,
    /// Backoff for background content warm-up.
    pub warm_retry: RetryConfig,
}

impl WorkerConfig {
    /// Defaults for `base_url`.
    pub fn new(base_url: Url) -> Result<Self, ServiceWorkerError> {
        Self::from_site(&SiteConfig::for_base(base_url.as_str()))
    }

    pub fn from_site(site: &SiteConfig) -> Result<Self, ServiceWorkerError> {
        site.validate()
            .map_err(|e| ServiceWorkerError::Config(e.to_string()))?;
        let base_url = site
            .base()
            .map_err(|e| ServiceWorkerError::Config(e.to_string()))?;
        let mut api_base = base_url.join(&site.api_prefix).map_err(|e| {
            ServiceWorkerError::Config(format!("invalid api_prefix '{}': {}", site.api_prefix, e))
        })?;
        if !api_base.path().ends_with('/') {
            let path = format!("{}/", api_base.path());
            api_base.set_path(&path);
        }

        Ok(Self {
            base_url,
            api_base,
            route_request_grace: site.route_request_grace(),
            cacheable_extensions: site.cacheable_extensions.clone(),
            precache: vec![String::new(), "index.html".to_string()],
            warm_retry: RetryConfig::default(),
        })
    }

    pub fn with_route_request_grace(mut self, grace: Duration) -> Self {
        self.route_request_grace = grace;
        self
    }

    pub fn with_warm_retry(mut self, retry: RetryConfig) -> Self {
        self.warm_retry = retry;
        self
    }

    /// Cache namespace owned by worker `version`.
    pub fn cache_name(version: u32) -> String {
        format!("pageroute-cache-v{}", version)
    }

    /// Cache key of the persisted route map.
    pub fn route_map_key(&self) -> String {
        format!("{}{}", self.base_url, ROUTE_MAP_KEY)
    }

    pub fn precache_urls(&self) -> Vec<Url> {
        self.precache
            .iter()
            .filter_map(|path| match self.base_url.join(path) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping invalid precache path");
                    None
                }
            })
            .collect()
    }

    /// Resolve an `ADD_ROUTE` pair into a registry entry.
    pub fn route_entry(&self, href: &str, path: &str) -> Result<RouteEntry, ServiceWorkerError> {
        let route = self
            .base_url
            .join(href)
            .map_err(|e| ServiceWorkerError::StateError(format!("bad route '{}': {}", href, e)))?;
        if route.origin() != self.base_url.origin() || !route.path().starts_with(self.base_url.path()) {
            return Err(ServiceWorkerError::SecurityError(format!(
                "route '{}' is outside {}",
                href, self.base_url
            )));
        }
        let content = self
            .base_url
            .join(path)
            .map_err(|e| ServiceWorkerError::StateError(format!("bad content '{}': {}", path, e)))?;
        Ok(RouteEntry::new(route.path(), content.as_str()))
    }
}

impl TryFrom<&SiteConfig> for WorkerConfig {
    type Error = ServiceWorkerError;

    fn try_from(site: &SiteConfig) -> Result<Self, Self::Error> {
        Self::from_site(site)
    }
}

// ==================== Events ====================

/// Everything a worker task receives.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Message {
        client: ClientId,
        message: ClientMessage,
    },
    Fetch {
        client: Option<ClientId>,
        request: FetchRequest,
        /// `None` means "not intercepted, go to the network".
        reply: oneshot::Sender<Option<FetchResponse>>,
    },
    ClientGone {
        client: ClientId,
    },
}

// ==================== Runtime ====================

pub(crate) struct WorkerRuntime {
    id: ServiceWorkerId,
    version: u32,
    config: Arc<WorkerConfig>,
    cache: CacheHandle,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<RwLock<Clients>>,
    interceptor: RequestInterceptor,
    registry: RouteRegistry,
    pending: PendingBatch,
    grace_deadline: Option<Instant>,
    routes_requested: bool,
}

impl WorkerRuntime {
    pub(crate) fn new(
        id: ServiceWorkerId,
        version: u32,
        config: Arc<WorkerConfig>,
        cache: CacheHandle,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<RwLock<Clients>>,
    ) -> Self {
        Self {
            id,
            version,
            interceptor: RequestInterceptor::new(&config),
            registry: RouteRegistry::new(config.route_map_key()),
            config,
            cache,
            fetcher,
            clients,
            pending: PendingBatch::new(),
            grace_deadline: None,
            routes_requested: false,
        }
    }

    /// Start the task. The worker stops when the returned sender is dropped.
    pub(crate) fn spawn(self) -> mpsc::UnboundedSender<WorkerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx));
        tx
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<WorkerEvent>) {
        let hydrated = self.registry.hydrate(&self.cache).await;
        if self.registry.is_empty() {
            self.grace_deadline = Some(Instant::now() + self.config.route_request_grace);
        }
        info!(worker = %self.id, version = self.version, routes = hydrated, "Worker running");

        loop {
            let first = tokio::select! {
                biased;
                event = inbox.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = wait_until(self.grace_deadline) => {
                    self.request_routes().await;
                    continue;
                }
            };

            let mut window = vec![first];
            while let Ok(event) = inbox.try_recv() {
                window.push(event);
            }
            self.process_window(window).await;
        }

        debug!(worker = %self.id, "Worker stopped");
    }

    async fn process_window(&mut self, window: Vec<WorkerEvent>) {
        let mut flushes: Vec<(ClientId, bool)> = Vec::new();
        let mut batch: Vec<(ClientId, RouteEntry)> = Vec::new();
        let mut checks: Vec<ClientId> = Vec::new();
        let mut fetches = Vec::new();

        for event in window {
            match event {
                WorkerEvent::Message { client, message } => match message {
                    ClientMessage::AddRoute { href, path } => {
                        match self.config.route_entry(&href, &path) {
                            Ok(entry) => self.pending.push(client, entry),
                            Err(e) => warn!(%client, error = %e, "Ignoring route"),
                        }
                    }
                    ClientMessage::StoreMap { requested } => {
                        batch.extend(self.pending.take(client).into_iter().map(|e| (client, e)));
                        flushes.push((client, requested));
                    }
                    ClientMessage::CheckMap => checks.push(client),
                },
                WorkerEvent::Fetch {
                    client,
                    request,
                    reply,
                } => fetches.push((client, request, reply)),
                WorkerEvent::ClientGone { client } => {
                    let lost = self.pending.discard(client);
                    if lost > 0 {
                        debug!(%client, lost, "Discarded unflushed routes");
                    }
                }
            }
        }

        let committed = !flushes.is_empty();
        if committed {
            self.commit(flushes, batch).await;
        } else {
            for client in checks {
                self.answer_check(client).await;
            }
        }

        for (client, request, reply) in fetches {
            self.handle_fetch(client, request, reply).await;
        }
    }

    async fn commit(&mut self, flushes: Vec<(ClientId, bool)>, batch: Vec<(ClientId, RouteEntry)>) {
        let requested = flushes.iter().filter(|(_, requested)| *requested).count();
        let mut declared_by: HashMap<String, ClientId> = HashMap::new();
        let entries: Vec<RouteEntry> = batch
            .into_iter()
            .map(|(client, entry)| {
                declared_by.entry(entry.route_path.clone()).or_insert(client);
                entry
            })
            .collect();

        let outcome = self.registry.apply_batch(entries, &self.cache).await;
        self.grace_deadline = None;
        info!(
            worker = %self.id,
            flushes = flushes.len(),
            requested,
            added = outcome.added.len(),
            routes = self.registry.len(),
            persisted = outcome.persisted,
            "Committed route batch"
        );

        let delivered = self.clients.write().await.broadcast(WorkerMessage::MapReady {
            route_map: self.registry.route_map(),
        });
        debug!(delivered, "Broadcast MAP_READY");

        if !outcome.added.is_empty() {
            self.warm_content(outcome.added, declared_by);
        }
    }

    async fn answer_check(&self, client: ClientId) {
        let message = if self.registry.has_committed() {
            WorkerMessage::MapReady {
                route_map: self.registry.route_map(),
            }
        } else {
            WorkerMessage::MapNotReady
        };
        debug!(%client, kind = message.kind(), "Answering CHECK_MAP");
        if let Err(e) = self.clients.read().await.post(client, message) {
            debug!(%client, error = %e, "Could not answer CHECK_MAP");
        }
    }

    async fn request_routes(&mut self) {
        self.grace_deadline = None;
        if self.routes_requested || !self.registry.is_empty() {
            return;
        }
        self.routes_requested = true;
        let delivered = self.clients.write().await.broadcast(WorkerMessage::RequestRoutes);
        info!(worker = %self.id, delivered, "No routes after cold start, requesting them from pages");
    }

    /// Fetch and cache newly registered content in the background, telling
    /// the declaring page as each fragment lands.
    fn warm_content(&self, added: Vec<RouteEntry>, declared_by: HashMap<String, ClientId>) {
        let cache = self.cache.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let clients = Arc::clone(&self.clients);
        let retry = self.config.warm_retry.clone();

        tokio::spawn(async move {
            let fetcher: &dyn Fetcher = fetcher.as_ref();
            for entry in added {
                let Ok(url) = Url::parse(&entry.content_location) else {
                    continue;
                };
                if cache.match_request(url.as_str()).await.is_none() {
                    let request = FetchRequest::get(url.clone());
                    let request = &request;
                    let fetched = retry_with_backoff(&retry, url.as_str(), move || fetch_ok(fetcher, request)).await;
                    let stored = match fetched {
                        Ok(response) => cache.put_response(url.as_str(), &response).await,
                        Err(e) => {
                            warn!(url = %url, error = %e, "Content warm-up failed");
                            continue;
                        }
                    };
                    if let Err(e) = stored {
                        warn!(url = %url, error = %e, "Failed to store warmed content");
                        continue;
                    }
                }

                if let Some(client) = declared_by.get(&entry.route_path) {
                    let message = WorkerMessage::ContentReady {
                        href: entry.route_path.clone(),
                        path: entry.content_location.clone(),
                    };
                    if let Err(e) = clients.read().await.post(*client, message) {
                        debug!(%client, error = %e, "Could not send CONTENT_READY");
                    }
                }
            }
        });
    }

    async fn handle_fetch(
        &self,
        client: Option<ClientId>,
        request: FetchRequest,
        reply: oneshot::Sender<Option<FetchResponse>>,
    ) {
        let ctx = ApiContext {
            registry: &self.registry,
            worker_id: self.id,
            version: self.version,
            cache_name: self.cache.name(),
        };
        let interception = self.interceptor.classify(&request, &ctx);
        debug!(url = %request.url, action = interception.name(), "Intercepted fetch");

        match interception {
            Interception::PassThrough => {
                let _ = reply.send(None);
            }
            Interception::Api(response) => {
                let _ = reply.send(Some(response));
            }
            Interception::Navigate { href } => {
                match client {
                    Some(client) => {
                        if let Err(e) = self
                            .clients
                            .read()
                            .await
                            .post(client, WorkerMessage::NavigateTo { href })
                        {
                            warn!(%client, error = %e, "Could not send NAVIGATE_TO");
                        }
                    }
                    None => warn!(url = %request.url, "Navigation from unknown client"),
                }
                let _ = reply.send(Some(FetchResponse::no_content(request.url)));
            }
            Interception::PreventNavigation => {
                info!(url = %request.url, "Prevented navigation to unregistered path");
                let _ = reply.send(Some(FetchResponse::navigation_prevented(request.url)));
            }
            Interception::RouteContent {
                route_path,
                content_location,
            } => {
                debug!(route = %route_path, "Serving route content");
                let cache = self.cache.clone();
                let fetcher = Arc::clone(&self.fetcher);
                tokio::spawn(async move {
                    let response = strategy::serve_route(cache, fetcher, request, content_location).await;
                    let _ = reply.send(Some(response));
                });
            }
            Interception::Asset { store, .. } => {
                let cache = self.cache.clone();
                let fetcher = Arc::clone(&self.fetcher);
                tokio::spawn(async move {
                    let response = strategy::serve_asset(cache, fetcher, request, store).await;
                    let _ = reply.send(Some(response));
                });
            }
        }
    }
}

async fn fetch_ok(fetcher: &dyn Fetcher, request: &FetchRequest) -> Result<FetchResponse, NetError> {
    let response = fetcher.fetch(request).await?;
    if response.is_ok() {
        Ok(response)
    } else {
        Err(NetError::RequestFailed(format!(
            "{} answered {}",
            request.url, response.status
        )))
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://site.test/app/").unwrap()
    }

    #[test]
    fn test_config_from_site() {
        let mut site = SiteConfig::for_base("https://site.test/app");
        site.api_prefix = "_api".to_string();
        let config = WorkerConfig::try_from(&site).unwrap();
        assert_eq!(config.base_url, base());
        assert_eq!(config.api_base.as_str(), "https://site.test/app/_api/");
        assert_eq!(config.route_map_key(), "https://site.test/app/route-map-v3");
        assert_eq!(WorkerConfig::cache_name(6), "pageroute-cache-v6");
        assert_eq!(
            config.precache_urls(),
            vec![base(), base().join("index.html").unwrap()]
        );
    }

    #[test]
    fn test_route_entry_resolution() {
        let config = WorkerConfig::new(base()).unwrap();
        let entry = config.route_entry("about", "frag/about.html").unwrap();
        assert_eq!(entry.route_path, "/app/about");
        assert_eq!(entry.content_location, "https://site.test/app/frag/about.html");

        let absolute = config.route_entry("/app/posts/*", "/app/frag/post.html").unwrap();
        assert_eq!(absolute.route_path, "/app/posts/*");

        assert!(matches!(
            config.route_entry("/elsewhere", "frag/x.html"),
            Err(ServiceWorkerError::SecurityError(_))
        ));
    }
}
