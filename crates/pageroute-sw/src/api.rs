//! Synthesized endpoints under the reserved API prefix.

use serde_json::json;
use tracing::warn;
use url::Url;

use pageroute_net::FetchResponse;

use crate::registry::RouteRegistry;
use crate::ServiceWorkerId;

/// What an endpoint handler can see.
#[derive(Debug, Clone, Copy)]
pub struct ApiContext<'a> {
    pub registry: &'a RouteRegistry,
    pub worker_id: ServiceWorkerId,
    pub version: u32,
    pub cache_name: &'a str,
}

type Handler = fn(&ApiContext<'_>) -> serde_json::Value;

const HANDLERS: &[(&str, Handler)] = &[
    ("routes", routes as Handler),
    ("version", version as Handler),
    ("health", health as Handler),
];

/// Answer `endpoint` (the path below the API prefix). Unknown endpoints get 204.
pub fn respond(endpoint: &str, url: &Url, ctx: &ApiContext<'_>) -> FetchResponse {
    let endpoint = endpoint.trim_end_matches('/');
    let Some((_, handler)) = HANDLERS.iter().find(|(name, _)| *name == endpoint) else {
        return FetchResponse::no_content(url.clone());
    };

    match FetchResponse::json(url.clone(), &handler(ctx)) {
        Ok(response) => response,
        Err(e) => {
            warn!(endpoint, error = %e, "Failed to encode API response");
            FetchResponse::no_content(url.clone())
        }
    }
}

fn routes(ctx: &ApiContext<'_>) -> serde_json::Value {
    json!(ctx.registry.route_map())
}

fn version(ctx: &ApiContext<'_>) -> serde_json::Value {
    json!({
        "version": ctx.version,
        "cache": ctx.cache_name,
        "worker": ctx.worker_id.to_string(),
    })
}

fn health(ctx: &ApiContext<'_>) -> serde_json::Value {
    json!({
        "status": "ok",
        "routes": ctx.registry.len(),
        "mapCommitted": ctx.registry.has_committed(),
    })
}
