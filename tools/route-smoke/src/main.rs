//! Route sync smoke test.
//!
//! Serves a static site directory from memory, opens one or more tabs that
//! declare the same routes, then walks every tab through the requested
//! navigations and prints a JSON report.
//!
//! ## Usage
//!
//! ```bash
//! # One tab, two navigations
//! route-smoke --site ./site --routes routes.json --navigate /about --navigate /missing
//!
//! # Two tabs sharing one worker, JSON logs
//! route-smoke --site ./site --routes routes.json --tabs 2 --log-format json --navigate /about
//! ```
//!
//! `routes.json` is an array of `{ "href": "/about", "path": "frag/about.html" }`.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use pageroute_common::{init_logging, LogConfig, LogFormat, PageRouteError, SiteConfig};
use pageroute_net::MemoryFetcher;
use pageroute_page::{ControllerConfig, ControllerError, LoadOutcome, PageController, RecordingSink};
use pageroute_sw::{Caches, RouteMap, ServiceWorkerContainer, WorkerConfig, WorkerScript};

#[derive(Parser)]
#[command(name = "route-smoke")]
#[command(about = "Route sync smoke test against an in-memory site")]
struct Cli {
    /// Directory with the site's static files
    #[arg(long)]
    site: PathBuf,

    /// JSON file with route declarations
    #[arg(long)]
    routes: PathBuf,

    /// Site config JSON (base URL, cache version, timings)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base URL used when no config file is given
    #[arg(long, default_value = "https://localhost/")]
    base: String,

    /// Path to navigate to; repeat for several
    #[arg(long = "navigate")]
    navigate: Vec<String>,

    /// Number of tabs to open
    #[arg(long, default_value = "1")]
    tabs: usize,

    /// Persist caches in this directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RouteDeclaration {
    href: String,
    path: String,
}

#[derive(Debug, Serialize)]
struct NavigationReport {
    tab: usize,
    target: String,
    outcome: &'static str,
    route: Option<String>,
    content: Option<String>,
    from_cache: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    navigations: Vec<NavigationReport>,
    route_map: RouteMap,
}

fn load_routes(path: &Path) -> Result<Vec<RouteDeclaration>, PageRouteError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PageRouteError::config_with_source(format!("failed to read {}", path.display()), e)
    })?;
    serde_json::from_str(&content).map_err(|e| {
        PageRouteError::config_with_source(format!("invalid routes file {}", path.display()), e)
    })
}

async fn wait_ready(tabs: &[(PageController, Arc<RecordingSink>)], timeout: Duration) -> bool {
    let all_ready = async {
        for (page, _) in tabs {
            while !page.is_ready().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    };
    tokio::time::timeout(timeout, all_ready).await.is_ok()
}

async fn navigate(
    tab: usize,
    page: &PageController,
    sink: &RecordingSink,
    target: &str,
) -> Result<NavigationReport, ControllerError> {
    let before = sink.renders().len();
    let outcome = match page.load(target).await? {
        LoadOutcome::Intercepted => {
            // NAVIGATE_TO may land before or after this; the second is a no-op.
            page.navigate_to(target).await?;
            page.idle().await;
            "intercepted"
        }
        LoadOutcome::Prevented => "prevented",
        LoadOutcome::External(response) => {
            return Ok(NavigationReport {
                tab,
                target: target.to_string(),
                outcome: "external",
                route: None,
                content: Some(response.url.to_string()),
                from_cache: response.from_cache,
            });
        }
    };

    let rendered = sink.renders().into_iter().skip(before).last();
    Ok(NavigationReport {
        tab,
        target: target.to_string(),
        outcome,
        route: rendered.as_ref().map(|r| r.route.clone()),
        content: rendered.as_ref().map(|r| r.content_url.to_string()),
        from_cache: rendered.map(|r| r.from_cache).unwrap_or(false),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log.with_format(cli.log_format));

    let site = match &cli.config {
        Some(path) => SiteConfig::from_json_file(path)?,
        None => SiteConfig::for_base(cli.base.clone()),
    };
    site.validate()?;
    let routes = load_routes(&cli.routes)?;

    let base = site.base()?;
    let fetcher = Arc::new(MemoryFetcher::from_dir(base.clone(), &cli.site)?);
    let caches = match &cli.cache_dir {
        Some(dir) => Caches::with_dir(dir)?,
        None => Caches::new(),
    };
    let container = ServiceWorkerContainer::new(WorkerConfig::try_from(&site)?, caches, fetcher);
    let script = WorkerScript::new(base.join("sw.js")?, site.cache_version);
    let controller_config = ControllerConfig::try_from(&site)?;

    let mut tabs = Vec::new();
    for _ in 0..cli.tabs.max(1) {
        let sink = Arc::new(RecordingSink::new());
        let page = PageController::open(&container, controller_config.clone(), base.clone(), sink.clone()).await;
        page.declare_routes(routes.iter().map(|r| (r.href.clone(), r.path.clone())))
            .await;
        page.start(script.clone()).await?;
        tabs.push((page, sink));
    }
    info!(tabs = tabs.len(), routes = routes.len(), "Tabs started");

    let timeout = site.readiness_timeout().unwrap_or(Duration::from_secs(5));
    if !wait_ready(&tabs, timeout).await {
        warn!(?timeout, "Route map not ready on every tab");
    }

    let mut navigations = Vec::new();
    for target in &cli.navigate {
        for (index, (page, sink)) in tabs.iter().enumerate() {
            navigations.push(navigate(index + 1, page, sink, target).await?);
        }
    }

    let route_map = match tabs.first() {
        Some((page, _)) => page.route_map().await,
        None => RouteMap::default(),
    };
    for (page, _) in tabs {
        page.close().await;
    }

    let report = Report {
        navigations,
        route_map,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
