//! Fetch interception: deciding what the worker does with each request.
//!
//! Rules are tried in order and the first match wins:
//!
//! 1. requests from outside the site (judged by referrer, else by URL) pass through
//! 2. the reserved API prefix is answered by the worker
//! 3. document navigations become `NAVIGATE_TO` or are prevented
//! 4. registered route content is served cache-first
//! 5. anything else is served cache-first, and stored when it is a static asset

use hashbrown::HashSet;
use tracing::trace;
use url::Url;

use pageroute_net::{FetchRequest, FetchResponse};

use crate::api::{self, ApiContext};
use crate::worker::WorkerConfig;

/// Action to take for an intercepted request.
#[derive(Debug, Clone, PartialEq)]
pub enum Interception {
    /// Not the worker's business; the request goes to the network untouched.
    PassThrough,
    /// Synthesized API response.
    Api(FetchResponse),
    /// Document navigation to a registered route.
    Navigate { href: String },
    /// Document navigation to an unknown path.
    PreventNavigation,
    /// Fragment fetch for a registered route.
    RouteContent {
        route_path: String,
        content_location: Url,
    },
    /// Any other same-site request.
    Asset { url: Url, store: bool },
}

impl Interception {
    pub fn name(&self) -> &'static str {
        match self {
            Interception::PassThrough => "pass-through",
            Interception::Api(_) => "api",
            Interception::Navigate { .. } => "navigate",
            Interception::PreventNavigation => "prevent-navigation",
            Interception::RouteContent { .. } => "route-content",
            Interception::Asset { .. } => "asset",
        }
    }
}

/// Request classifier for one site.
#[derive(Debug, Clone)]
pub struct RequestInterceptor {
    base: Url,
    api_base: Url,
    cacheable_extensions: HashSet<String>,
}

impl RequestInterceptor {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            base: config.base_url.clone(),
            api_base: config.api_base.clone(),
            cacheable_extensions: config
                .cacheable_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Same origin and under the base path.
    pub fn in_scope(&self, url: &Url) -> bool {
        under(&self.base, url)
    }

    /// Whether `url` ends in one of the static asset extensions.
    pub fn is_cacheable(&self, url: &Url) -> bool {
        url.path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|name| name.rsplit_once('.'))
            .is_some_and(|(_, ext)| self.cacheable_extensions.contains(&ext.to_ascii_lowercase()))
    }

    /// Classify a request against the current registry.
    pub fn classify(&self, request: &FetchRequest, ctx: &ApiContext<'_>) -> Interception {
        let url = &request.url;
        let origin = request.referrer.as_ref().unwrap_or(url);
        if !self.in_scope(origin) || url.origin() != self.base.origin() {
            trace!(%url, "Out of scope");
            return Interception::PassThrough;
        }

        if under(&self.api_base, url) {
            let endpoint = &url.path()[self.api_base.path().len()..];
            return Interception::Api(api::respond(endpoint, url, ctx));
        }

        let resolved = ctx.registry.resolve(url.path());

        if request.is_navigation() {
            return match resolved {
                Some(_) => Interception::Navigate {
                    href: url.path().to_string(),
                },
                None => Interception::PreventNavigation,
            };
        }

        if let Some(route) = resolved {
            if let Ok(content_location) = Url::parse(route.content_location) {
                return Interception::RouteContent {
                    route_path: route.route_path.to_string(),
                    content_location,
                };
            }
        }

        Interception::Asset {
            url: url.clone(),
            store: self.is_cacheable(url),
        }
    }
}

fn under(base: &Url, url: &Url) -> bool {
    url.origin() == base.origin() && url.path().starts_with(base.path())
}
