//! End-to-end route sync between pages and the worker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pageroute_net::{FetchRequest, MemoryFetcher};
use pageroute_page::{ControllerConfig, LoadOutcome, PageController, RecordingSink, SyncState};
use pageroute_sw::{Caches, RegisterOutcome, RouteMap, ServiceWorkerContainer, WorkerConfig, WorkerScript};
use url::Url;

fn base() -> Url {
    Url::parse("https://site.test/").unwrap()
}

fn url(path: &str) -> Url {
    base().join(path).unwrap()
}

fn site() -> Arc<MemoryFetcher> {
    let fetcher = MemoryFetcher::new(base());
    fetcher.insert("index.html", "<main></main>").unwrap();
    fetcher.insert("frag/home.html", "<h2>Home</h2>").unwrap();
    fetcher.insert("frag/about.html", "<h2>About</h2>").unwrap();
    fetcher.insert("frag/contact.html", "<h2>Contact</h2>").unwrap();
    Arc::new(fetcher)
}

fn worker_config(grace: Duration) -> WorkerConfig {
    WorkerConfig::new(base()).unwrap().with_route_request_grace(grace)
}

fn container_with(caches: Caches) -> ServiceWorkerContainer {
    ServiceWorkerContainer::new(worker_config(Duration::from_secs(60)), caches, site())
}

fn container() -> ServiceWorkerContainer {
    container_with(Caches::new())
}

fn script(version: u32) -> WorkerScript {
    WorkerScript::new(url("sw.js"), version)
}

async fn open(container: &ServiceWorkerContainer, location: Url) -> (PageController, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let page = PageController::open(container, ControllerConfig::new(base()), location, sink.clone()).await;
    (page, sink)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

async fn ready_page(container: &ServiceWorkerContainer, routes: &[(&str, &str)]) -> (PageController, Arc<RecordingSink>) {
    let (page, sink) = open(container, base()).await;
    for (href, path) in routes {
        page.declare_route(*href, *path).await;
    }
    page.start(script(6)).await.unwrap();
    let expected = routes.len();
    eventually("route map", || {
        let page = page.clone();
        async move { page.is_ready().await && page.route_map().await.len() >= expected }
    })
    .await;
    (page, sink)
}

async fn wait_for_warm_up(page: &PageController, routes: usize) {
    eventually("content warm-up", || {
        let page = page.clone();
        async move { page.content_ready().await.len() >= routes }
    })
    .await;
}

async fn health(page: &PageController) -> serde_json::Value {
    let response = page.port().fetch(FetchRequest::get(url("api/health"))).await.unwrap();
    response.json_body().unwrap()
}

const ROUTES: &[(&str, &str)] = &[("/", "frag/home.html"), ("/about", "frag/about.html")];

#[tokio::test]
async fn test_known_route_navigation_renders_fragment() {
    let container = container();
    let (page, sink) = ready_page(&container, ROUTES).await;

    assert_eq!(page.load("/about").await.unwrap(), LoadOutcome::Intercepted);
    eventually("about render", || {
        let sink = sink.clone();
        async move { sink.current_route().as_deref() == Some("/about") }
    })
    .await;

    let rendered = sink.last().unwrap();
    assert_eq!(rendered.body, "<h2>About</h2>");
    assert_eq!(rendered.content_url, url("frag/about.html"));
    assert_eq!(page.current_url().await, Some(url("about")));
}

#[tokio::test]
async fn test_unknown_route_is_prevented() {
    let container = container();
    let (page, sink) = ready_page(&container, ROUTES).await;

    assert_eq!(page.load("/missing").await.unwrap(), LoadOutcome::Prevented);
    page.idle().await;

    let renders = sink.renders();
    assert!(!renders.is_empty());
    assert!(renders.iter().all(|r| r.route == "/"));
    assert_eq!(sink.last().unwrap().body, "<h2>Home</h2>");
}

#[tokio::test]
async fn test_two_tabs_share_union_of_routes() {
    let container = container();
    let (first, _) = ready_page(&container, ROUTES).await;

    let (second, second_sink) = open(&container, base()).await;
    second.declare_route("/contact", "frag/contact.html").await;
    // A conflicting declaration loses to the one already registered.
    second.declare_route("/about", "frag/contact.html").await;
    assert!(matches!(second.start(script(6)).await.unwrap(), RegisterOutcome::Located { .. }));

    for page in [&first, &second] {
        eventually("union map", || {
            let page = page.clone();
            async move { page.route_map().await.len() == 3 }
        })
        .await;
    }

    let map = first.route_map().await;
    assert_eq!(map.get("/contact"), Some(url("frag/contact.html").as_str()));
    assert_eq!(map.get("/about"), Some(url("frag/about.html").as_str()));

    second.navigate_to("/about").await.unwrap();
    assert_eq!(second_sink.last().unwrap().body, "<h2>About</h2>");
}

#[tokio::test]
async fn test_other_tabs_map_does_not_ready_unstarted_tab() {
    let container = container();
    let (first, _) = ready_page(&container, ROUTES).await;

    let (second, second_sink) = open(&container, base()).await;
    second.declare_route("/contact", "frag/contact.html").await;
    let early = {
        let second = second.clone();
        tokio::spawn(async move { second.navigate_to("/contact").await })
    };

    // A late route on the first tab makes the worker broadcast MAP_READY.
    first.declare_route("/team", "frag/about.html").await;
    eventually("broadcast on second tab", || {
        let second = second.clone();
        async move { second.route_map().await.contains("/team") }
    })
    .await;

    assert_eq!(second.sync_state().await, SyncState::Unregistered);
    assert!(!second.is_ready().await);
    assert!(!early.is_finished());
    assert!(second_sink.renders().is_empty());

    assert!(matches!(second.start(script(6)).await.unwrap(), RegisterOutcome::Located { .. }));
    early.await.unwrap().unwrap();
    assert!(second.route_map().await.contains("/contact"));
    assert_eq!(second_sink.last().unwrap().body, "<h2>Contact</h2>");
    assert_eq!(second.history_entry_invalid(0).await, Some(false));
}

#[tokio::test]
async fn test_navigation_waits_for_route_map() {
    let container = container();
    let (page, sink) = open(&container, base()).await;
    page.declare_routes(ROUTES.iter().copied()).await;

    let early = {
        let page = page.clone();
        tokio::spawn(async move { page.navigate_to("/about").await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(sink.renders().is_empty());
    assert!(!early.is_finished());

    page.start(script(6)).await.unwrap();
    early.await.unwrap().unwrap();
    assert_eq!(sink.last().unwrap().route, "/about");

    // Once ready, navigations go straight through.
    page.navigate_to("/").await.unwrap();
    assert_eq!(sink.last().unwrap().body, "<h2>Home</h2>");
}

#[tokio::test]
async fn test_late_routes_are_flushed() {
    let container = container();
    let (page, sink) = ready_page(&container, ROUTES).await;

    page.declare_route("/contact", "frag/contact.html").await;
    eventually("late route", || {
        let page = page.clone();
        async move { page.route_map().await.contains("/contact") }
    })
    .await;

    page.navigate_to("/contact").await.unwrap();
    assert_eq!(sink.last().unwrap().body, "<h2>Contact</h2>");
}

#[tokio::test]
async fn test_route_map_snapshot_is_persisted() {
    let container = container();
    let (_page, _) = ready_page(&container, ROUTES).await;

    let key = container.config().route_map_key();
    let entry = container.caches().match_request(&key).await.unwrap();
    let snapshot = RouteMap::from_json(&entry.body).unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.get("/about"), Some(url("frag/about.html").as_str()));
}

#[tokio::test]
async fn test_snapshot_survives_browser_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let container = container_with(Caches::with_dir(dir.path()).unwrap());
        let (page, _) = ready_page(&container, ROUTES).await;
        wait_for_warm_up(&page, 2).await;
        page.close().await;
        container.terminate().await;
    }

    let container = container_with(Caches::with_dir(dir.path()).unwrap());
    let (page, sink) = open(&container, base()).await;
    page.start(script(6)).await.unwrap();
    eventually("hydrated map", || {
        let page = page.clone();
        async move { page.route_map().await.len() == 2 }
    })
    .await;

    page.navigate_to("/about").await.unwrap();
    assert_eq!(sink.last().unwrap().body, "<h2>About</h2>");
}

#[tokio::test]
async fn test_terminated_worker_rehydrates() {
    let container = container();
    let (page, sink) = ready_page(&container, ROUTES).await;

    assert!(container.terminate().await);
    page.navigate_to("/about").await.unwrap();
    assert_eq!(sink.last().unwrap().body, "<h2>About</h2>");

    let health = health(&page).await;
    assert_eq!(health["routes"], 2);
    assert_eq!(health["mapCommitted"], true);
}

#[tokio::test]
async fn test_upgrade_reloads_page() {
    let container = container();
    let (page, sink) = ready_page(&container, ROUTES).await;
    page.navigate_to("/about").await.unwrap();
    assert_eq!(sink.renders().len(), 1);
    wait_for_warm_up(&page, 2).await;

    let outcome = container.register(script(7)).await.unwrap();
    assert!(matches!(outcome, RegisterOutcome::Installed { replaced: true, .. }));

    eventually("re-render", || {
        let sink = sink.clone();
        async move { sink.renders().len() == 2 }
    })
    .await;
    assert_eq!(sink.last().unwrap().route, "/about");
    assert_eq!(container.caches().keys().await, vec!["pageroute-cache-v7".to_string()]);
    assert_eq!(container.controller().await.map(|(_, version)| version), Some(7));
    assert_eq!(page.route_map().await.len(), 2);
}

#[tokio::test]
async fn test_failed_content_falls_back_to_root() {
    let container = container();
    let (page, sink) = ready_page(
        &container,
        &[("/", "frag/home.html"), ("/broken", "frag/broken.html")],
    )
    .await;

    page.navigate_to("/broken").await.unwrap();
    page.idle().await;

    assert_eq!(sink.last().unwrap().route, "/");
    assert_eq!(page.current_url().await, Some(base()));
    assert_eq!(page.history_len().await, 2);
    assert_eq!(page.history_entry_invalid(0).await, Some(true));
    assert_eq!(page.history_entry_invalid(1).await, Some(false));
}

#[tokio::test]
async fn test_back_and_forward() {
    let container = container();
    let (page, sink) = ready_page(&container, ROUTES).await;

    page.navigate_to("/").await.unwrap();
    page.navigate_to("/about").await.unwrap();
    page.back().await.unwrap();
    assert_eq!(sink.last().unwrap().route, "/");
    page.forward().await.unwrap();
    assert_eq!(sink.last().unwrap().route, "/about");
    assert_eq!(page.history_len().await, 2);
}

#[tokio::test]
async fn test_serve_page_restores_referrer_route() {
    let container = container();
    let (page, sink) = ready_page(&container, ROUTES).await;

    page.serve_page(&base(), Some(&url("about"))).await.unwrap();
    assert_eq!(sink.last().unwrap().route, "/about");
}

#[tokio::test]
async fn test_content_ready_reported() {
    let container = container();
    let (page, _) = ready_page(&container, ROUTES).await;

    wait_for_warm_up(&page, 2).await;
    let mut ready = page.content_ready().await;
    ready.sort();
    assert_eq!(ready, vec!["/".to_string(), "/about".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_requests_routes() {
    let container = ServiceWorkerContainer::new(
        worker_config(Duration::from_millis(1500)),
        Caches::new(),
        site(),
    );
    let (page, _) = ready_page(&container, ROUTES).await;

    // Lose the snapshot, then restart the worker with nothing to hydrate.
    let cache = container.caches().open("pageroute-cache-v6").await.unwrap();
    assert!(cache.delete(&container.config().route_map_key()).await.unwrap());
    assert!(container.terminate().await);
    assert_eq!(health(&page).await["routes"], 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    eventually("resubmitted routes", || {
        let page = page.clone();
        async move { health(&page).await["routes"] == 2 }
    })
    .await;
}
