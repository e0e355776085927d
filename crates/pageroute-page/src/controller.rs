//! The page controller: one per open page.
//!
//! Owns the page's side of the sync protocol and the single navigation
//! queue every route change goes through. Each queued navigation waits for
//! the previous transition, the configured delay and route map readiness
//! before fetching its fragment through the worker.

use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use pageroute_common::{with_timeout, SiteConfig};
use pageroute_net::{FetchRequest, FetchResponse};
use pageroute_sw::{
    ClientMessage, ClientPort, RegisterOutcome, RouteMap, ServiceWorkerContainer,
    ServiceWorkerError, ServiceWorkerEvent, WorkerMessage, WorkerScript,
};

use crate::history::{NavigationType, SessionHistory};
use crate::queue::NavigationQueue;
use crate::readiness::{Readiness, Rearmed};
use crate::render::{ContentSink, NoTransition, TransitionDriver};

/// Page controller errors.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Worker(#[from] ServiceWorkerError),

    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Timed out waiting for the route map")]
    ReadinessTimeout,

    #[error("Navigation queue closed")]
    QueueClosed,
}

/// Page-side settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Site base; path ends with `/`.
    pub base_url: Url,
    /// Delay inserted before every navigation.
    pub navigation_delay: Duration,
    /// Give up on a navigation if the route map is not ready in time.
    pub readiness_timeout: Option<Duration>,
}

impl ControllerConfig {
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            navigation_delay: Duration::ZERO,
            readiness_timeout: None,
        }
    }

    pub fn from_site(site: &SiteConfig) -> Result<Self, ControllerError> {
        let base_url = site
            .base()
            .map_err(|e| ControllerError::Config(e.to_string()))?;
        Ok(Self {
            base_url,
            navigation_delay: site.navigation_delay(),
            readiness_timeout: site.readiness_timeout(),
        })
    }

    pub fn with_navigation_delay(mut self, delay: Duration) -> Self {
        self.navigation_delay = delay;
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = Some(timeout);
        self
    }
}

impl TryFrom<&SiteConfig> for ControllerConfig {
    type Error = ControllerError;

    fn try_from(site: &SiteConfig) -> Result<Self, Self::Error> {
        Self::from_site(site)
    }
}

/// Page side of the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Unregistered,
    Registering,
    WaitingForMap,
    MapReady,
}

/// How [`PageController::load`] was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// The worker took the navigation and will answer with `NAVIGATE_TO`.
    Intercepted,
    /// Unknown route; the page fell back to the root.
    Prevented,
    /// Not the site's business; the document came from the network.
    External(FetchResponse),
}

#[derive(Debug, Clone)]
enum Navigation {
    To(Url),
    Reload(Url),
    Traverse(i32),
}

impl Navigation {
    fn kind(&self) -> NavigationType {
        match self {
            Navigation::To(_) => NavigationType::Navigate,
            Navigation::Reload(_) => NavigationType::Reload,
            Navigation::Traverse(_) => NavigationType::Traverse,
        }
    }

    fn label(&self) -> String {
        match self {
            Navigation::To(url) | Navigation::Reload(url) => url.path().to_string(),
            Navigation::Traverse(delta) => format!("history({})", delta),
        }
    }
}

#[derive(Default)]
struct ControllerState {
    sync: SyncState,
    readiness: Readiness,
    declared: IndexMap<String, String>,
    initial_sent: bool,
    late: Vec<(String, String)>,
    late_flush_scheduled: bool,
    route_map: RouteMap,
    // Route paths this epoch's batch must see in a MAP_READY before it counts.
    expected: Vec<String>,
    history: SessionHistory,
    current: Option<Url>,
    content_ready: Vec<String>,
    transition: Option<JoinHandle<()>>,
}

struct Inner {
    config: ControllerConfig,
    port: ClientPort,
    sink: Arc<dyn ContentSink>,
    transitions: Arc<dyn TransitionDriver>,
    queue: NavigationQueue,
    state: Mutex<ControllerState>,
}

/// Controller for one page.
#[derive(Clone)]
pub struct PageController {
    inner: Arc<Inner>,
}

impl PageController {
    /// Attach a new page at `location` and build its controller.
    pub async fn open(
        container: &ServiceWorkerContainer,
        config: ControllerConfig,
        location: Url,
        sink: Arc<dyn ContentSink>,
    ) -> Self {
        let (port, events) = container.attach(location).await;
        Self::new(config, port, events, sink)
    }

    pub fn new(
        config: ControllerConfig,
        port: ClientPort,
        events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
        sink: Arc<dyn ContentSink>,
    ) -> Self {
        Self::with_transitions(config, port, events, sink, Arc::new(NoTransition))
    }

    pub fn with_transitions(
        config: ControllerConfig,
        port: ClientPort,
        events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
        sink: Arc<dyn ContentSink>,
        transitions: Arc<dyn TransitionDriver>,
    ) -> Self {
        let controller = Self {
            inner: Arc::new(Inner {
                config,
                port,
                sink,
                transitions,
                queue: NavigationQueue::new(),
                state: Mutex::new(ControllerState::default()),
            }),
        };
        controller.spawn_event_pump(events);
        controller
    }

    fn spawn_event_pump(&self, mut events: mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let controller = PageController { inner };
                if let Err(e) = controller.handle_event(event).await {
                    warn!(client = %controller.inner.port.id(), error = %e, "Failed to handle worker event");
                }
            }
            debug!("Worker event stream closed");
        });
    }

    // ==================== Route declaration ====================

    /// Declare a route. Re-declaring an `href` is a no-op.
    ///
    /// Routes declared after the initial batch went out are flushed together
    /// as a follow-up batch.
    pub async fn declare_route(&self, href: impl Into<String>, path: impl Into<String>) {
        let (href, path) = (href.into(), path.into());
        let mut state = self.inner.state.lock().await;
        if state.declared.contains_key(&href) {
            debug!(%href, "Route already declared");
            return;
        }
        state.declared.insert(href.clone(), path.clone());

        if state.initial_sent {
            state.late.push((href, path));
            if !state.late_flush_scheduled {
                state.late_flush_scheduled = true;
                let controller = self.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    if let Err(e) = controller.flush_late().await {
                        warn!(error = %e, "Failed to send late routes");
                    }
                });
            }
        }
    }

    pub async fn declare_routes<I, H, P>(&self, routes: I)
    where
        I: IntoIterator<Item = (H, P)>,
        H: Into<String>,
        P: Into<String>,
    {
        for (href, path) in routes {
            self.declare_route(href, path).await;
        }
    }

    async fn flush_late(&self) -> Result<(), ControllerError> {
        let routes = {
            let mut state = self.inner.state.lock().await;
            state.late_flush_scheduled = false;
            std::mem::take(&mut state.late)
        };
        if routes.is_empty() {
            return Ok(());
        }
        self.send_batch(routes, true).await
    }

    async fn send_batch(&self, routes: Vec<(String, String)>, requested: bool) -> Result<(), ControllerError> {
        let count = routes.len();
        for (href, path) in routes {
            self.inner
                .port
                .post_message(ClientMessage::AddRoute { href, path })
                .await?;
        }
        self.inner
            .port
            .post_message(ClientMessage::StoreMap { requested })
            .await?;
        debug!(client = %self.inner.port.id(), routes = count, requested, "Sent route batch");
        Ok(())
    }

    // ==================== Worker lifecycle ====================

    /// Register (or locate) the worker and start syncing routes.
    pub async fn start(&self, script: WorkerScript) -> Result<RegisterOutcome, ControllerError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.sync == SyncState::Unregistered {
                state.sync = SyncState::Registering;
            }
        }

        let outcome = self.inner.port.register(script).await?;
        // A fresh install announces itself with a controller change; an
        // already-active worker does not.
        if let RegisterOutcome::Located { .. } = outcome {
            self.handoff().await?;
        }
        Ok(outcome)
    }

    /// Send the initial batch once per epoch, then ask for the map.
    async fn handoff(&self) -> Result<(), ControllerError> {
        let routes = {
            let mut state = self.inner.state.lock().await;
            if state.initial_sent {
                return Ok(());
            }
            state.initial_sent = true;
            state.late.clear();
            let base = &self.inner.config.base_url;
            state.expected = state
                .declared
                .keys()
                .filter_map(|href| base.join(href).ok())
                .filter(|url| under(base, url))
                .map(|url| url.path().to_string())
                .collect();
            if state.sync != SyncState::MapReady {
                state.sync = SyncState::WaitingForMap;
            }
            state
                .declared
                .iter()
                .map(|(h, p)| (h.clone(), p.clone()))
                .collect::<Vec<_>>()
        };
        self.send_batch(routes, false).await?;
        self.inner.port.post_message(ClientMessage::CheckMap).await?;
        Ok(())
    }

    async fn resubmit(&self) -> Result<(), ControllerError> {
        let routes = {
            let mut state = self.inner.state.lock().await;
            state.initial_sent = true;
            state.late.clear();
            state
                .declared
                .iter()
                .map(|(h, p)| (h.clone(), p.clone()))
                .collect::<Vec<_>>()
        };
        self.send_batch(routes, true).await
    }

    /// A newer worker replaced ours: start a new epoch and redo the handshake.
    async fn reload(&self) -> Result<(), ControllerError> {
        let current = {
            let mut state = self.inner.state.lock().await;
            state.readiness.rearm();
            state.sync = SyncState::Registering;
            state.initial_sent = false;
            state.route_map = RouteMap::default();
            info!(client = %self.inner.port.id(), epoch = state.readiness.epoch(), "Reloading for new worker");
            state.current.clone()
        };

        self.handoff().await?;
        if let Some(current) = current {
            let _ = self.enqueue(Navigation::Reload(current));
        }
        Ok(())
    }

    async fn handle_event(&self, event: ServiceWorkerEvent) -> Result<(), ControllerError> {
        match event {
            ServiceWorkerEvent::Message(message) => self.handle_message(message).await,
            ServiceWorkerEvent::ControllerChange {
                worker_id,
                version,
                reload_required,
            } => {
                info!(
                    client = %self.inner.port.id(),
                    worker = %worker_id,
                    version,
                    reload_required,
                    "Controller changed"
                );
                if reload_required {
                    self.reload().await
                } else {
                    self.handoff().await
                }
            }
            ServiceWorkerEvent::StateChange { worker_id, state } => {
                debug!(worker = %worker_id, ?state, "Worker state changed");
                Ok(())
            }
        }
    }

    async fn handle_message(&self, message: WorkerMessage) -> Result<(), ControllerError> {
        debug!(client = %self.inner.port.id(), kind = message.kind(), "Message from worker");
        match message {
            WorkerMessage::MapReady { route_map } => {
                let mut state = self.inner.state.lock().await;
                state.route_map = route_map;
                // Broadcasts from other tabs' batches only refresh the map.
                let ours = state.sync == SyncState::WaitingForMap
                    && state.expected.iter().all(|p| state.route_map.contains(p));
                if !ours {
                    debug!(
                        client = %self.inner.port.id(),
                        sync = ?state.sync,
                        routes = state.route_map.len(),
                        "Route map refreshed"
                    );
                    return Ok(());
                }
                state.sync = SyncState::MapReady;
                if state.readiness.resolve() {
                    info!(
                        client = %self.inner.port.id(),
                        routes = state.route_map.len(),
                        epoch = state.readiness.epoch(),
                        "Route map ready"
                    );
                }
            }
            WorkerMessage::MapNotReady => {
                debug!(client = %self.inner.port.id(), "Route map not ready yet");
            }
            WorkerMessage::RequestRoutes => {
                info!(client = %self.inner.port.id(), "Worker asked for routes");
                self.resubmit().await?;
            }
            WorkerMessage::NavigateTo { href } => {
                let target = self.resolve(&href)?;
                let _ = self.enqueue(Navigation::To(target));
            }
            WorkerMessage::ContentReady { href, path } => {
                debug!(%href, %path, "Route content cached");
                self.inner.state.lock().await.content_ready.push(href);
            }
        }
        Ok(())
    }

    // ==================== Navigation ====================

    fn resolve(&self, target: &str) -> Result<Url, ControllerError> {
        self.inner
            .config
            .base_url
            .join(target)
            .map_err(|e| ControllerError::InvalidUrl {
                url: target.to_string(),
                message: e.to_string(),
            })
    }

    fn enqueue(&self, navigation: Navigation) -> oneshot::Receiver<()> {
        let controller = self.clone();
        let label = navigation.label();
        let task: BoxFuture<'static, ()> = Box::pin(async move {
            controller.run_navigation(navigation).await;
        });
        self.inner.queue.push(label, task)
    }

    async fn submit(&self, navigation: Navigation) -> Result<(), ControllerError> {
        self.enqueue(navigation)
            .await
            .map_err(|_| ControllerError::QueueClosed)
    }

    /// Navigate to a path or URL (relative to the base) and wait for it to render.
    pub async fn navigate_to(&self, target: &str) -> Result<(), ControllerError> {
        let url = self.resolve(target)?;
        self.submit(Navigation::To(url)).await
    }

    /// Follow an in-page link.
    pub async fn click(&self, href: &str) -> Result<(), ControllerError> {
        self.navigate_to(href).await
    }

    pub async fn back(&self) -> Result<(), ControllerError> {
        self.submit(Navigation::Traverse(-1)).await
    }

    pub async fn forward(&self) -> Result<(), ControllerError> {
        self.submit(Navigation::Traverse(1)).await
    }

    /// Render the page the browser loaded.
    ///
    /// A page opened at the base with an in-site referrer is a deep link the
    /// worker bounced; render the referrer's route instead.
    pub async fn serve_page(&self, location: &Url, referrer: Option<&Url>) -> Result<(), ControllerError> {
        let base = &self.inner.config.base_url;
        let target = match referrer {
            Some(referrer) if location.path() == base.path() && under(base, referrer) => {
                let mut target = referrer.clone();
                target.set_query(None);
                target.set_fragment(None);
                target
            }
            _ => location.clone(),
        };
        debug!(location = %location, target = %target, "Serving page");
        self.submit(Navigation::To(target)).await
    }

    /// Issue a browser-level navigation through the worker.
    pub async fn load(&self, target: &str) -> Result<LoadOutcome, ControllerError> {
        let url = self.resolve(target)?;
        let referrer = self
            .current_url()
            .await
            .unwrap_or_else(|| self.inner.port.url().clone());
        let response = self
            .inner
            .port
            .fetch(FetchRequest::navigate(url.clone()).referrer(referrer))
            .await?;

        if response.is_prevented() {
            info!(url = %url, "Navigation prevented, falling back to root");
            self.submit(Navigation::To(self.inner.config.base_url.clone()))
                .await?;
            return Ok(LoadOutcome::Prevented);
        }
        if response.status == 204 && under(&self.inner.config.base_url, &url) {
            return Ok(LoadOutcome::Intercepted);
        }
        Ok(LoadOutcome::External(response))
    }

    /// Wait for every navigation queued so far.
    pub async fn idle(&self) {
        self.inner.queue.idle().await;
    }

    async fn run_navigation(&self, navigation: Navigation) {
        let label = navigation.label();
        if let Err(e) = self.try_navigation(navigation).await {
            warn!(client = %self.inner.port.id(), target = %label, error = %e, "Navigation abandoned");
        }
    }

    async fn try_navigation(&self, navigation: Navigation) -> Result<(), ControllerError> {
        let previous = self.inner.state.lock().await.transition.take();
        if let Some(transition) = previous {
            let _ = transition.await;
        }

        let delay = self.inner.config.navigation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.wait_ready().await?;

        let kind = navigation.kind();
        let (target, entry, from) = {
            let mut state = self.inner.state.lock().await;
            let from = state.current.clone();
            match navigation {
                Navigation::To(url) => {
                    if from.as_ref() == Some(&url) {
                        debug!(route = %url.path(), "Already showing route");
                        return Ok(());
                    }
                    let id = state.history.push(url.clone());
                    (url, Some(id), from)
                }
                Navigation::Reload(url) => {
                    let id = state.history.current_entry().map(|e| e.id);
                    (url, id, from)
                }
                Navigation::Traverse(delta) => match state.history.go(delta) {
                    Some(entry) => (entry.url.clone(), Some(entry.id), from),
                    None => {
                        debug!(delta, "No history entry to traverse to");
                        return Ok(());
                    }
                },
            }
        };

        let referrer = from
            .clone()
            .unwrap_or_else(|| self.inner.port.url().clone());
        let request = FetchRequest::get(target.clone()).referrer(referrer);

        match self.inner.port.fetch(request).await {
            Ok(response) if response.is_ok() && !response.is_prevented() => {
                self.inner.sink.swap(&target, &response);
                self.inner.sink.route_changed(target.path());
                let transition = tokio::spawn(self.inner.transitions.begin(from.as_ref(), &target));

                let mut state = self.inner.state.lock().await;
                state.current = Some(target.clone());
                state.transition = Some(transition);
                info!(
                    client = %self.inner.port.id(),
                    route = %target.path(),
                    ?kind,
                    from_cache = response.from_cache,
                    "Rendered route"
                );
            }
            Ok(response) => {
                let reason = format!("status {}", response.status);
                self.navigation_failed(&target, &response.url, entry, &reason)
                    .await;
            }
            Err(e) => {
                self.navigation_failed(&target, &target, entry, &e.to_string())
                    .await;
            }
        }
        Ok(())
    }

    async fn navigation_failed(&self, target: &Url, failed: &Url, entry: Option<u64>, reason: &str) {
        let base = &self.inner.config.base_url;
        if !under(base, failed) {
            warn!(url = %failed, reason, "Failed to load content from outside the site");
            return;
        }

        if let Some(id) = entry {
            self.inner.state.lock().await.history.mark_invalid(id);
        }

        if target.path() == base.path() {
            warn!(url = %failed, reason, "Root route failed to load");
            return;
        }

        warn!(route = %target.path(), url = %failed, reason, "Content failed to load, returning to root");
        let _ = self.enqueue(Navigation::To(base.clone()));
    }

    async fn wait_ready(&self) -> Result<(), ControllerError> {
        match self.inner.config.readiness_timeout {
            Some(timeout) => with_timeout(timeout, || self.wait_ready_forever())
                .await
                .map_err(|_| ControllerError::ReadinessTimeout),
            None => {
                self.wait_ready_forever().await;
                Ok(())
            }
        }
    }

    async fn wait_ready_forever(&self) {
        loop {
            let mut token = self.inner.state.lock().await.readiness.token();
            match token.wait().await {
                Ok(()) => return,
                Err(Rearmed) => debug!(epoch = token.epoch(), "Readiness re-armed, waiting again"),
            }
        }
    }

    // ==================== Accessors ====================

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn port(&self) -> &ClientPort {
        &self.inner.port
    }

    pub async fn sync_state(&self) -> SyncState {
        self.inner.state.lock().await.sync
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.state.lock().await.readiness.is_ready()
    }

    /// Latest route map received from the worker.
    pub async fn route_map(&self) -> RouteMap {
        self.inner.state.lock().await.route_map.clone()
    }

    pub async fn current_url(&self) -> Option<Url> {
        self.inner.state.lock().await.current.clone()
    }

    pub async fn history_len(&self) -> usize {
        self.inner.state.lock().await.history.length()
    }

    /// Whether the history entry at `index` was marked unloadable.
    pub async fn history_entry_invalid(&self, index: usize) -> Option<bool> {
        self.inner
            .state
            .lock()
            .await
            .history
            .entries()
            .get(index)
            .map(|e| e.invalid)
    }

    /// Routes whose content the worker reported as cached.
    pub async fn content_ready(&self) -> Vec<String> {
        self.inner.state.lock().await.content_ready.clone()
    }

    pub async fn declared_routes(&self) -> Vec<(String, String)> {
        self.inner
            .state
            .lock()
            .await
            .declared
            .iter()
            .map(|(h, p)| (h.clone(), p.clone()))
            .collect()
    }

    /// Close the page.
    pub async fn close(self) {
        self.inner.port.clone().detach().await;
    }
}

fn under(base: &Url, url: &Url) -> bool {
    url.origin() == base.origin() && url.path().starts_with(base.path())
}
