//! Route registry: the worker's `route path -> content location` table.
//!
//! Entries are append-only and never overwritten; the first declaration of a
//! route wins. Route paths may contain `*` segments, each matching exactly one
//! path segment. Resolution always prefers an exact entry over any pattern.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheError, CacheHandle};

/// Cache key (relative to the site base) holding the persisted route map.
pub const ROUTE_MAP_KEY: &str = "route-map-v3";

/// Wildcard path segment.
pub const WILDCARD: &str = "*";

/// One declared route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Absolute path under the base, e.g. `/about`.
    pub route_path: String,
    /// Absolute URL of the fragment rendered for this route.
    pub content_location: String,
}

impl RouteEntry {
    pub fn new(route_path: impl Into<String>, content_location: impl Into<String>) -> Self {
        Self {
            route_path: route_path.into(),
            content_location: content_location.into(),
        }
    }

    pub fn is_pattern(&self) -> bool {
        self.route_path.split('/').any(|s| s == WILDCARD)
    }
}

/// Serializable snapshot of the registry: ordered `[route, content]` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteMap(Vec<(String, String)>);

impl RouteMap {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    /// Look up a route path, exact entries first, then patterns.
    pub fn get(&self, route_path: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(route, _)| route == route_path)
            .or_else(|| {
                self.0.iter().find(|(route, _)| {
                    RoutePattern::parse(route).is_some_and(|p| p.matches(route_path))
                })
            })
            .map(|(_, content)| content.as_str())
    }

    pub fn contains(&self, route_path: &str) -> bool {
        self.0.iter().any(|(route, _)| route == route_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(r, c)| (r.as_str(), c.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.0
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
}

/// A route path containing one or more `*` segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Parse a route path. Returns `None` for paths without wildcards.
    pub fn parse(route_path: &str) -> Option<Self> {
        let segments: Vec<Segment> = route_path
            .split('/')
            .map(|s| {
                if s == WILDCARD {
                    Segment::Any
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();

        segments
            .iter()
            .any(|s| *s == Segment::Any)
            .then_some(Self { segments })
    }

    /// Check a concrete path. Segment counts must agree.
    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').collect();
        parts.len() == self.segments.len()
            && self.segments.iter().zip(parts).all(|(segment, part)| match segment {
                Segment::Any => !part.is_empty(),
                Segment::Literal(literal) => literal == part,
            })
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRoute<'a> {
    /// The declared route (the pattern, for wildcard matches).
    pub route_path: &'a str,
    pub content_location: &'a str,
    pub wildcard: bool,
}

/// Outcome of [`RouteRegistry::apply_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Entries that were new to the registry.
    pub added: Vec<RouteEntry>,
    /// Whether the snapshot reached the cache.
    pub persisted: bool,
}

/// The worker's route table.
#[derive(Debug)]
pub struct RouteRegistry {
    snapshot_key: String,
    routes: IndexMap<String, String>,
    patterns: Vec<(RoutePattern, String)>,
    committed: bool,
}

impl RouteRegistry {
    /// Create an empty registry persisting under `snapshot_key`.
    pub fn new(snapshot_key: impl Into<String>) -> Self {
        Self {
            snapshot_key: snapshot_key.into(),
            routes: IndexMap::new(),
            patterns: Vec::new(),
            committed: false,
        }
    }

    pub fn snapshot_key(&self) -> &str {
        &self.snapshot_key
    }

    /// Load the persisted snapshot. A missing or unreadable snapshot leaves
    /// the registry empty. Returns the number of routes loaded.
    pub async fn hydrate(&mut self, cache: &CacheHandle) -> usize {
        let Some(entry) = cache.match_request(&self.snapshot_key).await else {
            debug!(key = %self.snapshot_key, "No persisted route map");
            return 0;
        };

        match RouteMap::from_json(&entry.body) {
            Ok(map) => {
                let loaded = self.merge(
                    map.into_pairs()
                        .into_iter()
                        .map(|(route, content)| RouteEntry::new(route, content)),
                );
                if !self.routes.is_empty() {
                    self.committed = true;
                }
                info!(routes = loaded.len(), "Hydrated route map from cache");
                loaded.len()
            }
            Err(e) => {
                warn!(key = %self.snapshot_key, error = %e, "Ignoring corrupt route map snapshot");
                0
            }
        }
    }

    /// Insert entries whose route is not yet known. Returns the new ones.
    pub fn merge(&mut self, entries: impl IntoIterator<Item = RouteEntry>) -> Vec<RouteEntry> {
        let mut added = Vec::new();
        for entry in entries {
            if self.routes.contains_key(&entry.route_path) {
                continue;
            }
            if let Some(pattern) = RoutePattern::parse(&entry.route_path) {
                self.patterns.push((pattern, entry.route_path.clone()));
            }
            self.routes
                .insert(entry.route_path.clone(), entry.content_location.clone());
            added.push(entry);
        }
        added
    }

    /// Merge a batch and persist the whole table.
    ///
    /// A persistence failure is logged; the merged entries stay in memory.
    pub async fn apply_batch(&mut self, entries: Vec<RouteEntry>, cache: &CacheHandle) -> BatchOutcome {
        let added = self.merge(entries);
        self.committed = true;

        let persisted = match self.persist(cache).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, routes = self.routes.len(), "Failed to persist route map");
                false
            }
        };

        BatchOutcome { added, persisted }
    }

    async fn persist(&self, cache: &CacheHandle) -> Result<(), CacheError> {
        let body = self
            .route_map()
            .to_json()
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        cache
            .put(
                &self.snapshot_key,
                CacheEntry::blob(&self.snapshot_key, "application/json", body),
            )
            .await
    }

    /// Resolve a concrete path.
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute<'_>> {
        if let Some((route_path, content_location)) = self.routes.get_key_value(path) {
            return Some(ResolvedRoute {
                route_path,
                content_location,
                wildcard: false,
            });
        }

        self.patterns
            .iter()
            .find(|(pattern, _)| pattern.matches(path))
            .and_then(|(_, route)| self.routes.get_key_value(route))
            .map(|(route_path, content_location)| ResolvedRoute {
                route_path,
                content_location,
                wildcard: true,
            })
    }

    pub fn contains(&self, route_path: &str) -> bool {
        self.routes.contains_key(route_path)
    }

    /// Whether a batch has ever been applied (or a snapshot hydrated).
    pub fn has_committed(&self) -> bool {
        self.committed
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = RouteEntry> + '_ {
        self.routes
            .iter()
            .map(|(route, content)| RouteEntry::new(route.clone(), content.clone()))
    }

    /// Snapshot in insertion order.
    pub fn route_map(&self) -> RouteMap {
        RouteMap::new(
            self.routes
                .iter()
                .map(|(r, c)| (r.clone(), c.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Caches;

    const KEY: &str = "https://site.test/route-map-v3";

    fn entry(route: &str, content: &str) -> RouteEntry {
        RouteEntry::new(route, format!("https://site.test/{}", content))
    }

    #[test]
    fn test_merge_first_declaration_wins() {
        let mut registry = RouteRegistry::new(KEY);
        let added = registry.merge(vec![entry("/about", "frag/about.html")]);
        assert_eq!(added.len(), 1);

        let added = registry.merge(vec![
            entry("/about", "frag/other.html"),
            entry("/contact", "frag/contact.html"),
        ]);
        assert_eq!(added, vec![entry("/contact", "frag/contact.html")]);
        assert_eq!(
            registry.resolve("/about").unwrap().content_location,
            "https://site.test/frag/about.html"
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut registry = RouteRegistry::new(KEY);
        let batch = vec![entry("/a", "a.html"), entry("/b", "b.html")];
        registry.merge(batch.clone());
        let before = registry.route_map();
        assert!(registry.merge(batch).is_empty());
        assert_eq!(registry.route_map(), before);
    }

    #[test]
    fn test_exact_route_beats_pattern() {
        let mut registry = RouteRegistry::new(KEY);
        registry.merge(vec![
            entry("/blog/*", "frag/post.html"),
            entry("/blog/intro", "frag/intro.html"),
        ]);

        let exact = registry.resolve("/blog/intro").unwrap();
        assert!(!exact.wildcard);
        assert_eq!(exact.content_location, "https://site.test/frag/intro.html");

        let pattern = registry.resolve("/blog/other").unwrap();
        assert!(pattern.wildcard);
        assert_eq!(pattern.route_path, "/blog/*");
    }

    #[test]
    fn test_wildcard_matches_exactly_one_segment() {
        let pattern = RoutePattern::parse("/scope/*/name").unwrap();
        assert!(pattern.matches("/scope/x/name"));
        assert!(!pattern.matches("/scope/x/y/name"));
        assert!(!pattern.matches("/scope//name"));
        assert!(!pattern.matches("/scope/x/other"));
        assert!(RoutePattern::parse("/scope/name").is_none());
    }

    #[test]
    fn test_route_map_get_and_json() {
        let map = RouteMap::new(vec![
            ("/a".into(), "https://site.test/a.html".into()),
            ("/b/*".into(), "https://site.test/b.html".into()),
        ]);
        assert_eq!(map.get("/a"), Some("https://site.test/a.html"));
        assert_eq!(map.get("/b/c"), Some("https://site.test/b.html"));
        assert_eq!(map.get("/c"), None);

        let json = String::from_utf8(map.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"[["/a","https://site.test/a.html"],["/b/*","https://site.test/b.html"]]"#
        );
    }

    #[tokio::test]
    async fn test_apply_batch_then_hydrate() {
        let cache = Caches::new().open("pageroute-cache-v6").await.unwrap();
        let mut registry = RouteRegistry::new(KEY);
        let outcome = registry
            .apply_batch(
                vec![entry("/", "frag/home.html"), entry("/about", "frag/about.html")],
                &cache,
            )
            .await;
        assert_eq!(outcome.added.len(), 2);
        assert!(outcome.persisted);

        let mut fresh = RouteRegistry::new(KEY);
        assert_eq!(fresh.hydrate(&cache).await, 2);
        assert!(fresh.has_committed());
        assert_eq!(fresh.route_map(), registry.route_map());
    }

    #[tokio::test]
    async fn test_empty_batch_still_commits() {
        let cache = Caches::new().open("v1").await.unwrap();
        let mut registry = RouteRegistry::new(KEY);
        assert!(!registry.has_committed());
        let outcome = registry.apply_batch(Vec::new(), &cache).await;
        assert!(outcome.added.is_empty());
        assert!(registry.has_committed());
    }

    #[tokio::test]
    async fn test_hydrate_ignores_missing_and_corrupt_snapshots() {
        let cache = Caches::new().open("v1").await.unwrap();
        let mut registry = RouteRegistry::new(KEY);
        assert_eq!(registry.hydrate(&cache).await, 0);

        cache
            .put(KEY, CacheEntry::blob(KEY, "application/json", b"{not json".to_vec()))
            .await
            .unwrap();
        assert_eq!(registry.hydrate(&cache).await, 0);
        assert!(registry.is_empty());
        assert!(!registry.has_committed());
    }
}
