//! Registration and lifecycle: the `navigator.serviceWorker` side.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use pageroute_net::{FetchRequest, FetchResponse, Fetcher};

use crate::cache::Caches;
use crate::clients::{Client, ClientId, Clients};
use crate::message::{ClientMessage, ServiceWorkerEvent};
use crate::worker::{WorkerConfig, WorkerEvent, WorkerRuntime};
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

// ==================== Service Worker ====================

/// Script identity. A different `version` is a different worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerScript {
    pub url: Url,
    pub version: u32,
}

impl WorkerScript {
    pub fn new(url: Url, version: u32) -> Self {
        Self { url, version }
    }
}

/// A service worker instance.
#[derive(Debug)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    pub script: WorkerScript,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,

    inbox: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script: WorkerScript) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script,
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            inbox: None,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
        if state == ServiceWorkerState::Redundant {
            self.inbox = None;
        }
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Whether the worker task is alive.
    pub fn is_running(&self) -> bool {
        self.inbox.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn cache_name(&self) -> String {
        WorkerConfig::cache_name(self.script.version)
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Start installing a new worker.
    pub fn update(&mut self, script: WorkerScript) -> &mut ServiceWorker {
        self.last_update_check = Some(Instant::now());
        let worker = self.installing.insert(ServiceWorker::new(script));
        worker.set_state(ServiceWorkerState::Installing);
        worker
    }

    /// Transition installing to waiting.
    pub fn install_complete(&mut self) {
        if let Some(mut worker) = self.installing.take() {
            worker.set_state(ServiceWorkerState::Installed);
            self.waiting = Some(worker);
        }
    }

    /// Activate the waiting worker, returning the one it replaced (now redundant).
    pub fn activate(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        let replaced = self.active.take().map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });

        worker.set_state(ServiceWorkerState::Activated);
        self.active = Some(worker);
        replaced
    }
}

/// Result of [`ServiceWorkerContainer::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new worker was installed and activated.
    Installed {
        worker_id: ServiceWorkerId,
        /// Whether an older version was replaced.
        replaced: bool,
    },
    /// The same version was already active.
    Located { worker_id: ServiceWorkerId },
}

impl RegisterOutcome {
    pub fn worker_id(&self) -> ServiceWorkerId {
        match self {
            RegisterOutcome::Installed { worker_id, .. } | RegisterOutcome::Located { worker_id } => {
                *worker_id
            }
        }
    }
}

// ==================== Service Worker Container ====================

struct ContainerInner {
    config: Arc<WorkerConfig>,
    caches: Caches,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<RwLock<Clients>>,
    registration: RwLock<Option<ServiceWorkerRegistration>>,
}

/// Service worker container for one site, shared by all of its pages.
#[derive(Clone)]
pub struct ServiceWorkerContainer {
    inner: Arc<ContainerInner>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(config: WorkerConfig, caches: Caches, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                config: Arc::new(config),
                caches,
                fetcher,
                clients: Arc::new(RwLock::new(Clients::new())),
                registration: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn caches(&self) -> &Caches {
        &self.inner.caches
    }

    /// Open a page at `url`. The page is controlled immediately if a worker is active.
    pub async fn attach(&self, url: Url) -> (ClientPort, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut client = Client::new(url.clone(), tx);
        client.controller = self.controller().await.map(|(id, _)| id);
        let id = client.id;
        self.inner.clients.write().await.add(client);
        debug!(client = %id, %url, "Client attached");

        (
            ClientPort {
                id,
                url,
                container: self.clone(),
            },
            rx,
        )
    }

    /// Register a worker script.
    ///
    /// Installing precaches the site shell; activation drops every other
    /// cache namespace, starts the worker and claims all attached pages.
    pub async fn register(&self, script: WorkerScript) -> Result<RegisterOutcome, ServiceWorkerError> {
        let scope = self.inner.config.base_url.clone();
        if script.url.origin() != scope.origin() || !script.url.path().starts_with(scope.path()) {
            return Err(ServiceWorkerError::SecurityError(format!(
                "script {} is outside scope {}",
                script.url, scope
            )));
        }

        let mut guard = self.inner.registration.write().await;
        let registration = guard.get_or_insert_with(|| ServiceWorkerRegistration::new(scope));

        if let Some(active) = registration.get_active() {
            if active.script.version == script.version {
                debug!(worker = %active.id, version = script.version, "Worker already active");
                return Ok(RegisterOutcome::Located { worker_id: active.id });
            }
        }

        let version = script.version;
        let worker_id = registration.update(script).id;
        info!(worker = %worker_id, version, "Installing service worker");

        let cache_name = WorkerConfig::cache_name(version);
        let cache = self.inner.caches.open(&cache_name).await?;
        let shell = self.inner.config.precache_urls();
        match cache.add_all(&shell, self.inner.fetcher.as_ref()).await {
            Ok(stored) => debug!(cache = %cache_name, stored, "Precached site shell"),
            Err(e) => warn!(cache = %cache_name, error = %e, "Precache failed, continuing"),
        }
        registration.install_complete();

        let deleted = self.inner.caches.retain_only(&cache_name).await;
        let replaced = registration.activate();
        if let Some(old) = &replaced {
            info!(old = %old.id, new = %worker_id, removed_caches = deleted.len(), "Replaced service worker");
        }

        let runtime = WorkerRuntime::new(
            worker_id,
            version,
            Arc::clone(&self.inner.config),
            cache,
            Arc::clone(&self.inner.fetcher),
            Arc::clone(&self.inner.clients),
        );
        if let Some(active) = registration.active.as_mut() {
            active.inbox = Some(runtime.spawn());
        }
        let had_active = replaced.is_some();
        drop(replaced);
        drop(guard);

        let mut clients = self.inner.clients.write().await;
        clients.notify_all(ServiceWorkerEvent::StateChange {
            worker_id,
            state: ServiceWorkerState::Activated,
        });
        for (client, previous) in clients.claim(worker_id) {
            let event = ServiceWorkerEvent::ControllerChange {
                worker_id,
                version,
                reload_required: previous.is_some(),
            };
            if let Some(Err(e)) = clients.get(client).map(|c| c.notify(event)) {
                debug!(%client, error = %e, "Could not notify client of new controller");
            }
        }
        drop(clients);
        info!(worker = %worker_id, version, "Service worker activated");

        Ok(RegisterOutcome::Installed {
            worker_id,
            replaced: had_active,
        })
    }

    /// The active worker, if any.
    pub async fn controller(&self) -> Option<(ServiceWorkerId, u32)> {
        self.inner
            .registration
            .read()
            .await
            .as_ref()
            .and_then(|r| r.get_active())
            .map(|w| (w.id, w.script.version))
    }

    /// Stop the active worker's task. It restarts on the next event.
    pub async fn terminate(&self) -> bool {
        let mut guard = self.inner.registration.write().await;
        match guard.as_mut().and_then(|r| r.active.as_mut()) {
            Some(active) if active.inbox.is_some() => {
                active.inbox = None;
                info!(worker = %active.id, "Terminated idle worker");
                true
            }
            _ => false,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    async fn dispatch(&self, event: WorkerEvent) -> Result<(), ServiceWorkerError> {
        let mut guard = self.inner.registration.write().await;
        let active = guard
            .as_mut()
            .and_then(|r| r.active.as_mut())
            .ok_or_else(|| ServiceWorkerError::StateError("no active service worker".to_string()))?;

        if !active.is_running() {
            let cache = self.inner.caches.open(&active.cache_name()).await?;
            let runtime = WorkerRuntime::new(
                active.id,
                active.script.version,
                Arc::clone(&self.inner.config),
                cache,
                Arc::clone(&self.inner.fetcher),
                Arc::clone(&self.inner.clients),
            );
            active.inbox = Some(runtime.spawn());
            info!(worker = %active.id, "Restarted worker");
        }

        active
            .inbox
            .as_ref()
            .ok_or_else(|| ServiceWorkerError::StateError("worker has no inbox".to_string()))?
            .send(event)
            .map_err(|_| ServiceWorkerError::StateError("worker stopped".to_string()))
    }

    async fn fetch(
        &self,
        client: Option<ClientId>,
        request: FetchRequest,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        if self.controller().await.is_none() {
            return self.network(&request).await;
        }

        let (reply, response) = oneshot::channel();
        self.dispatch(WorkerEvent::Fetch {
            client,
            request: request.clone(),
            reply,
        })
        .await?;

        match response.await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => self.network(&request).await,
            Err(_) => {
                warn!(url = %request.url, "Worker stopped before answering, using network");
                self.network(&request).await
            }
        }
    }

    async fn network(&self, request: &FetchRequest) -> Result<FetchResponse, ServiceWorkerError> {
        self.inner
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))
    }

    async fn detach(&self, client: ClientId) {
        if self.inner.clients.write().await.remove(client).is_some() {
            debug!(%client, "Client detached");
        }
        let running = self
            .inner
            .registration
            .read()
            .await
            .as_ref()
            .and_then(|r| r.get_active())
            .is_some_and(|w| w.is_running());
        if running {
            let _ = self.dispatch(WorkerEvent::ClientGone { client }).await;
        }
    }
}

// ==================== Client Port ====================

/// A page's handle on the container.
#[derive(Clone)]
pub struct ClientPort {
    id: ClientId,
    url: Url,
    container: ServiceWorkerContainer,
}

impl std::fmt::Debug for ClientPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPort")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish()
    }
}

impl ClientPort {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// URL the page was opened at.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn container(&self) -> &ServiceWorkerContainer {
        &self.container
    }

    /// Post message to the active worker.
    pub async fn post_message(&self, message: ClientMessage) -> Result<(), ServiceWorkerError> {
        debug!(client = %self.id, ?message, "Posting message to worker");
        self.container
            .dispatch(WorkerEvent::Message {
                client: self.id,
                message,
            })
            .await
    }

    /// Fetch through the worker (or the network when uncontrolled).
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ServiceWorkerError> {
        self.container.fetch(Some(self.id), request).await
    }

    pub async fn register(&self, script: WorkerScript) -> Result<RegisterOutcome, ServiceWorkerError> {
        self.container.register(script).await
    }

    pub async fn controller(&self) -> Option<(ServiceWorkerId, u32)> {
        self.container.controller().await
    }

    /// Close the page.
    pub async fn detach(self) {
        self.container.detach(self.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WorkerMessage;
    use crate::registry::RouteMap;
    use pageroute_net::MemoryFetcher;
    use std::time::Duration;

    fn base() -> Url {
        Url::parse("https://site.test/").unwrap()
    }

    fn site() -> Arc<MemoryFetcher> {
        let fetcher = MemoryFetcher::new(base());
        fetcher.insert("index.html", "<main></main>").unwrap();
        fetcher.insert("frag/home.html", "<h2>Home</h2>").unwrap();
        fetcher.insert("frag/about.html", "<h2>About</h2>").unwrap();
        fetcher.insert("frag/contact.html", "<h2>Contact</h2>").unwrap();
        Arc::new(fetcher)
    }

    fn container(fetcher: Arc<MemoryFetcher>) -> ServiceWorkerContainer {
        let config = WorkerConfig::new(base())
            .unwrap()
            .with_route_request_grace(Duration::from_secs(60));
        ServiceWorkerContainer::new(config, Caches::new(), fetcher)
    }

    fn script(version: u32) -> WorkerScript {
        WorkerScript::new(base().join("sw.js").unwrap(), version)
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> WorkerMessage {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for worker")
                .expect("channel closed");
            if let ServiceWorkerEvent::Message(message) = event {
                return message;
            }
        }
    }

    async fn declare(port: &ClientPort, routes: &[(&str, &str)]) {
        for (href, path) in routes {
            port.post_message(ClientMessage::AddRoute {
                href: href.to_string(),
                path: path.to_string(),
            })
            .await
            .unwrap();
        }
        port.post_message(ClientMessage::StoreMap { requested: false })
            .await
            .unwrap();
    }

    fn map_of(message: WorkerMessage) -> RouteMap {
        match message {
            WorkerMessage::MapReady { route_map } => route_map,
            other => panic!("expected MAP_READY, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_precaches_and_claims() {
        let fetcher = site();
        let container = container(fetcher.clone());
        let (_port, mut rx) = container.attach(base()).await;

        let outcome = container.register(script(6)).await.unwrap();
        assert!(matches!(outcome, RegisterOutcome::Installed { replaced: false, .. }));

        let mut saw_controller = false;
        while let Ok(event) = rx.try_recv() {
            if let ServiceWorkerEvent::ControllerChange { reload_required, version, .. } = event {
                assert!(!reload_required);
                assert_eq!(version, 6);
                saw_controller = true;
            }
        }
        assert!(saw_controller);

        let cache = container.caches().open("pageroute-cache-v6").await.unwrap();
        assert!(cache.match_request("https://site.test/").await.is_some());
        assert!(cache.match_request("https://site.test/index.html").await.is_some());

        let again = container.register(script(6)).await.unwrap();
        assert_eq!(again, RegisterOutcome::Located { worker_id: outcome.worker_id() });
    }

    #[tokio::test]
    async fn test_script_outside_scope_is_rejected() {
        let container = container(site());
        let foreign = WorkerScript::new(Url::parse("https://other.test/sw.js").unwrap(), 1);
        assert!(matches!(
            container.register(foreign).await,
            Err(ServiceWorkerError::SecurityError(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_commits_once() {
        let container = container(site());
        container.register(script(6)).await.unwrap();
        let (port, mut rx) = container.attach(base()).await;

        declare(
            &port,
            &[
                ("/", "frag/home.html"),
                ("/about", "frag/about.html"),
                ("/contact", "frag/contact.html"),
            ],
        )
        .await;

        let map = map_of(next_message(&mut rx).await);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("/about"), Some("https://site.test/frag/about.html"));

        // Nothing else but content notifications follows.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = rx.try_recv() {
            if let ServiceWorkerEvent::Message(message) = event {
                assert!(matches!(message, WorkerMessage::ContentReady { .. }), "{:?}", message);
            }
        }
    }

    #[tokio::test]
    async fn test_check_map_before_and_after_commit() {
        let container = container(site());
        container.register(script(6)).await.unwrap();
        let (port, mut rx) = container.attach(base()).await;

        port.post_message(ClientMessage::CheckMap).await.unwrap();
        assert_eq!(next_message(&mut rx).await, WorkerMessage::MapNotReady);

        declare(&port, &[("/about", "frag/about.html")]).await;
        map_of(next_message(&mut rx).await);

        port.post_message(ClientMessage::CheckMap).await.unwrap();
        loop {
            match next_message(&mut rx).await {
                WorkerMessage::ContentReady { .. } => continue,
                message => {
                    assert_eq!(map_of(message).len(), 1);
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_navigation_interception() {
        let container = container(site());
        container.register(script(6)).await.unwrap();
        let (port, mut rx) = container.attach(base()).await;
        declare(&port, &[("/about", "frag/about.html")]).await;
        map_of(next_message(&mut rx).await);

        let response = port
            .fetch(FetchRequest::navigate(base().join("about").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status, 204);
        assert!(!response.is_prevented());
        loop {
            match next_message(&mut rx).await {
                WorkerMessage::ContentReady { .. } => continue,
                message => {
                    assert_eq!(message, WorkerMessage::NavigateTo { href: "/about".into() });
                    break;
                }
            }
        }

        let prevented = port
            .fetch(FetchRequest::navigate(base().join("missing").unwrap()))
            .await
            .unwrap();
        assert!(prevented.is_prevented());
        assert_eq!(prevented.status_text, "Navigation Prevented");
    }

    #[tokio::test]
    async fn test_content_ready_after_warm_up() {
        let fetcher = site();
        let container = container(fetcher.clone());
        container.register(script(6)).await.unwrap();
        let (port, mut rx) = container.attach(base()).await;
        declare(&port, &[("/contact", "frag/contact.html")]).await;
        map_of(next_message(&mut rx).await);

        assert_eq!(
            next_message(&mut rx).await,
            WorkerMessage::ContentReady {
                href: "/contact".into(),
                path: "https://site.test/frag/contact.html".into(),
            }
        );

        fetcher.set_offline(true);
        let response = port
            .fetch(FetchRequest::get(base().join("contact").unwrap()).referrer(base()))
            .await
            .unwrap();
        assert!(response.from_cache);
        assert_eq!(response.text().unwrap(), "<h2>Contact</h2>");
    }

    #[tokio::test]
    async fn test_terminated_worker_rehydrates() {
        let container = container(site());
        container.register(script(6)).await.unwrap();
        let (port, mut rx) = container.attach(base()).await;
        declare(&port, &[("/about", "frag/about.html")]).await;
        let before = map_of(next_message(&mut rx).await);

        assert!(container.terminate().await);
        port.post_message(ClientMessage::CheckMap).await.unwrap();
        loop {
            match next_message(&mut rx).await {
                WorkerMessage::ContentReady { .. } => continue,
                message => {
                    assert_eq!(map_of(message), before);
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_upgrade_requires_reload_and_drops_old_cache() {
        let container = container(site());
        container.register(script(5)).await.unwrap();
        let (_port, mut rx) = container.attach(base()).await;

        let outcome = container.register(script(6)).await.unwrap();
        assert!(matches!(outcome, RegisterOutcome::Installed { replaced: true, .. }));
        let mut reload = false;
        while let Ok(event) = rx.try_recv() {
            if let ServiceWorkerEvent::ControllerChange { reload_required, .. } = event {
                reload = reload_required;
            }
        }
        assert!(reload);
        assert_eq!(container.caches().keys().await, vec!["pageroute-cache-v6"]);
    }

    #[tokio::test]
    async fn test_uncontrolled_fetch_goes_to_network() {
        let fetcher = site();
        let container = container(fetcher.clone());
        let (port, _rx) = container.attach(base()).await;

        let response = port
            .fetch(FetchRequest::get(base().join("frag/home.html").unwrap()))
            .await
            .unwrap();
        assert_eq!(response.text().unwrap(), "<h2>Home</h2>");
        assert!(matches!(
            port.post_message(ClientMessage::CheckMap).await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_requests_routes_once() {
        let container = ServiceWorkerContainer::new(
            WorkerConfig::new(base()).unwrap(),
            Caches::new(),
            site(),
        );
        let (_port, mut rx) = container.attach(base()).await;
        container.register(script(6)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut requests = 0;
        while let Ok(event) = rx.try_recv() {
            if event == ServiceWorkerEvent::Message(WorkerMessage::RequestRoutes) {
                requests += 1;
            }
        }
        assert_eq!(requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_before_grace_cancel_request() {
        let container = ServiceWorkerContainer::new(
            WorkerConfig::new(base()).unwrap(),
            Caches::new(),
            site(),
        );
        let (port, mut rx) = container.attach(base()).await;
        container.register(script(6)).await.unwrap();
        declare(&port, &[("/about", "frag/about.html")]).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event, ServiceWorkerEvent::Message(WorkerMessage::RequestRoutes));
        }
    }
}
