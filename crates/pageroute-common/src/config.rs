//! Site configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::{PageRouteError, Result};

/// Configuration shared by the worker and every page controller of a site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SiteConfig {
    /// Absolute base URL of the site; every route lives under it
    pub base_url: String,

    /// Reserved path prefix (relative to the base) for synthesized endpoints
    pub api_prefix: String,

    /// Worker code version; selects the live cache namespace
    pub cache_version: u32,

    /// Grace period after a cold start before asking pages for routes
    pub route_request_grace_ms: u64,

    /// Extensions of generic assets that may be stored opportunistically
    pub cacheable_extensions: Vec<String>,

    /// Delay inserted before every queued navigation
    pub navigation_delay_ms: u64,

    /// Upper bound on how long a navigation waits for the route map
    pub readiness_timeout_ms: Option<u64>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/".to_string(),
            api_prefix: "api/".to_string(),
            cache_version: 6,
            route_request_grace_ms: 1500,
            cacheable_extensions: [
                "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "woff", "woff2", "ttf", "otf",
            ]
            .iter()
            .map(|ext| ext.to_string())
            .collect(),
            navigation_delay_ms: 0,
            readiness_timeout_ms: None,
        }
    }
}

impl SiteConfig {
    /// Create a config for the given base URL with default settings.
    pub fn for_base(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PageRouteError::config_with_source("invalid site config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Check that the base URL parses and names a directory.
    pub fn validate(&self) -> Result<()> {
        self.base()?;
        if self.api_prefix.starts_with('/') {
            return Err(PageRouteError::config(format!(
                "api_prefix must be relative to the base path, got '{}'",
                self.api_prefix
            )));
        }
        Ok(())
    }

    /// Parsed base URL. The path always ends with `/`.
    pub fn base(&self) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| PageRouteError::config_with_source(format!("invalid base_url '{}'", self.base_url), e))?;
        if url.cannot_be_a_base() {
            return Err(PageRouteError::config(format!(
                "base_url '{}' cannot be a base",
                self.base_url
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    pub fn route_request_grace(&self) -> Duration {
        Duration::from_millis(self.route_request_grace_ms)
    }

    pub fn navigation_delay(&self) -> Duration {
        Duration::from_millis(self.navigation_delay_ms)
    }

    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SiteConfig::default();
        assert_eq!(config.base().unwrap().as_str(), "http://localhost/");
        assert_eq!(config.route_request_grace(), Duration::from_millis(1500));
        assert!(config.cacheable_extensions.iter().any(|e| e == "woff2"));
        assert!(config.readiness_timeout().is_none());
    }

    #[test]
    fn test_base_gets_trailing_slash() {
        let config = SiteConfig::for_base("https://user.github.io/project?x=1");
        assert_eq!(
            config.base().unwrap().as_str(),
            "https://user.github.io/project/"
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            SiteConfig::from_json_str(r#"{"base_url":"https://example.com/app/","cache_version":9}"#)
                .unwrap();
        assert_eq!(config.cache_version, 9);
        assert_eq!(config.api_prefix, "api/");
    }

    #[test]
    fn test_rejects_bad_base() {
        assert!(SiteConfig::from_json_str(r#"{"base_url":"not a url"}"#).is_err());
        assert!(SiteConfig::from_json_str(r#"{"base_url":"mailto:me@example.com"}"#).is_err());
        assert!(SiteConfig::from_json_str(r#"{"api_prefix":"/api/"}"#).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"navigation_delay_ms": 250}}"#).unwrap();
        let config = SiteConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.navigation_delay(), Duration::from_millis(250));
    }
}
