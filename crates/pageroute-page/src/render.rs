//! Where fragments go once loaded.

use futures::future::BoxFuture;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use url::Url;

use pageroute_net::FetchResponse;

/// Receives content swaps.
pub trait ContentSink: Send + Sync {
    /// Replace the page content with `content`, rendered for `route`.
    fn swap(&self, route: &Url, content: &FetchResponse);

    /// Update the current-route indicator.
    fn route_changed(&self, _route: &str) {}
}

/// Visual transition between two routes.
pub trait TransitionDriver: Send + Sync {
    /// Start a transition. The next navigation waits for the returned future.
    fn begin(&self, from: Option<&Url>, to: &Url) -> BoxFuture<'static, ()>;
}

/// Instant transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransition;

impl TransitionDriver for NoTransition {
    fn begin(&self, _from: Option<&Url>, _to: &Url) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// A transition that takes a fixed time.
#[derive(Debug, Clone, Copy)]
pub struct TimedTransition(pub Duration);

impl TransitionDriver for TimedTransition {
    fn begin(&self, _from: Option<&Url>, _to: &Url) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(self.0))
    }
}

/// One recorded swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Route path shown.
    pub route: String,
    /// Where the fragment came from.
    pub content_url: Url,
    pub body: String,
    pub from_cache: bool,
}

/// A sink that keeps every swap in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    renders: Mutex<Vec<Rendered>>,
    current_route: Mutex<Option<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn renders(&self) -> Vec<Rendered> {
        self.renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<Rendered> {
        self.renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn current_route(&self) -> Option<String> {
        self.current_route
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ContentSink for RecordingSink {
    fn swap(&self, route: &Url, content: &FetchResponse) {
        let rendered = Rendered {
            route: route.path().to_string(),
            content_url: content.url.clone(),
            body: String::from_utf8_lossy(&content.body).into_owned(),
            from_cache: content.from_cache,
        };
        self.renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rendered);
    }

    fn route_changed(&self, route: &str) {
        *self
            .current_route
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(route.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        let route = Url::parse("https://site.test/about").unwrap();
        let content = FetchResponse::ok(
            Url::parse("https://site.test/frag/about.html").unwrap(),
            "text/html",
            "<h2>About</h2>",
        );

        sink.swap(&route, &content);
        sink.route_changed("/about");

        let last = sink.last().unwrap();
        assert_eq!(last.route, "/about");
        assert_eq!(last.body, "<h2>About</h2>");
        assert_eq!(sink.current_route().as_deref(), Some("/about"));
    }
}
