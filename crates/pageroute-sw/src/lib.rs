//! # PageRoute Service Worker
//!
//! The background half of PageRoute: a request-intercepting worker that owns
//! the route registry of a static site and the cache it serves from.
//!
//! ## Features
//!
//! - **Registration**: install, activate, upgrade and termination of the worker
//! - **Cache API**: versioned namespaces of URL-keyed responses
//! - **Route registry**: batched, persisted `path -> content` mapping
//! - **Sync protocol**: `ADD_ROUTE` / `STORE_MAP` / `CHECK_MAP` handshake
//! - **Fetch interception**: navigations become `NAVIGATE_TO` messages
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (one per site, shared by every tab)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       └── scope
//!     │
//!     ├── Clients ◄──── ServiceWorkerEvent ────  WorkerRuntime task
//!     │                                             ├── RouteRegistry
//!     └── ClientPort ──── WorkerEvent ─────────►    ├── PendingBatch
//!                                                   └── RequestInterceptor
//! Caches
//!     └── CacheHandle (pageroute-cache-v{N})
//!             └── URL → CacheEntry, plus the route map snapshot
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub mod api;
pub mod batch;
pub mod cache;
pub mod clients;
pub mod container;
pub mod intercept;
pub mod message;
pub mod registry;
mod strategy;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheError, CacheHandle, CacheStorage, Caches};
pub use clients::{Client, ClientId, Clients};
pub use container::{
    ClientPort, RegisterOutcome, ServiceWorker, ServiceWorkerContainer, ServiceWorkerRegistration,
    WorkerScript,
};
pub use intercept::{Interception, RequestInterceptor};
pub use message::{ClientMessage, ServiceWorkerEvent, WorkerMessage};
pub use registry::{RouteEntry, RouteMap, RoutePattern, RouteRegistry, ROUTE_MAP_KEY};
pub use worker::WorkerConfig;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state, script fetched.
    #[default]
    Parsed,
    /// Installing (precache running).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (stale caches being removed).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced by a newer worker).
    Redundant,
}
