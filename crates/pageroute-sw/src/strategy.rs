//! Cache-first serving with network fallback.

use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use pageroute_net::{FetchRequest, FetchResponse, Fetcher};

use crate::cache::CacheHandle;

async fn cached(cache: &CacheHandle, key: &str) -> Option<FetchResponse> {
    let entry = cache.match_request(key).await?;
    match entry.to_response() {
        Ok(response) => Some(response),
        Err(e) => {
            warn!(key, error = %e, "Unusable cache entry, refetching");
            None
        }
    }
}

async fn network(
    cache: &CacheHandle,
    fetcher: &dyn Fetcher,
    request: &FetchRequest,
    store: bool,
) -> FetchResponse {
    match fetcher.fetch(request).await {
        Ok(response) => {
            if store && response.is_ok() {
                if let Err(e) = cache.put_response(request.url.as_str(), &response).await {
                    warn!(url = %request.url, error = %e, "Failed to cache response");
                }
            }
            response
        }
        Err(e) => {
            warn!(url = %request.url, error = %e, "Network fetch failed");
            FetchResponse::network_error(request.url.clone())
        }
    }
}

/// Serve a route's content fragment. Successful network responses are cached.
pub(crate) async fn serve_route(
    cache: CacheHandle,
    fetcher: Arc<dyn Fetcher>,
    request: FetchRequest,
    content_location: Url,
) -> FetchResponse {
    if let Some(response) = cached(&cache, content_location.as_str()).await {
        debug!(url = %content_location, "Route content cache hit");
        return response;
    }
    debug!(url = %content_location, "Route content cache miss");

    let mut content = FetchRequest::get(content_location).destination(request.destination);
    content.referrer = request.referrer;
    content.timeout = request.timeout;
    network(&cache, fetcher.as_ref(), &content, true).await
}

/// Serve any other same-site request; only static assets are stored.
pub(crate) async fn serve_asset(
    cache: CacheHandle,
    fetcher: Arc<dyn Fetcher>,
    request: FetchRequest,
    store: bool,
) -> FetchResponse {
    if let Some(response) = cached(&cache, request.url.as_str()).await {
        debug!(url = %request.url, "Asset cache hit");
        return response;
    }
    network(&cache, fetcher.as_ref(), &request, store).await
}
