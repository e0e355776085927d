//! Messages exchanged between pages and the worker.
//!
//! The wire form is JSON tagged by `type`, e.g.
//! `{"type":"ADD_ROUTE","href":"/about","path":"frag/about.html"}`.

use serde::{Deserialize, Serialize};

use crate::registry::RouteMap;
use crate::{ServiceWorkerId, ServiceWorkerState};

/// Page -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Declare one route. Buffered until the sender's next `STORE_MAP`.
    AddRoute { href: String, path: String },
    /// Commit the sender's buffered routes.
    StoreMap {
        /// Set when answering `REQUEST_ROUTES`.
        #[serde(default)]
        requested: bool,
    },
    /// Ask whether a route map has been committed.
    CheckMap,
}

/// Worker -> page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    MapReady {
        #[serde(rename = "routeMap")]
        route_map: RouteMap,
    },
    MapNotReady,
    /// The worker started with no routes; pages should resubmit theirs.
    RequestRoutes,
    /// A document navigation to a registered route was intercepted.
    NavigateTo { href: String },
    /// A route's content is now cached.
    ContentReady { href: String, path: String },
}

impl WorkerMessage {
    /// The `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::MapReady { .. } => "MAP_READY",
            WorkerMessage::MapNotReady => "MAP_NOT_READY",
            WorkerMessage::RequestRoutes => "REQUEST_ROUTES",
            WorkerMessage::NavigateTo { .. } => "NAVIGATE_TO",
            WorkerMessage::ContentReady { .. } => "CONTENT_READY",
        }
    }
}

/// Everything delivered to a page.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// A new worker took control of the page.
    ControllerChange {
        worker_id: ServiceWorkerId,
        version: u32,
        /// Set when an older worker was replaced.
        reload_required: bool,
    },
    StateChange {
        worker_id: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    Message(WorkerMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let add: ClientMessage =
            serde_json::from_str(r#"{"type":"ADD_ROUTE","href":"/about","path":"frag/about.html"}"#)
                .unwrap();
        assert_eq!(
            add,
            ClientMessage::AddRoute {
                href: "/about".into(),
                path: "frag/about.html".into()
            }
        );

        let store: ClientMessage = serde_json::from_str(r#"{"type":"STORE_MAP"}"#).unwrap();
        assert_eq!(store, ClientMessage::StoreMap { requested: false });

        let check = serde_json::to_string(&ClientMessage::CheckMap).unwrap();
        assert_eq!(check, r#"{"type":"CHECK_MAP"}"#);
    }

    #[test]
    fn test_map_ready_carries_route_map() {
        let message = WorkerMessage::MapReady {
            route_map: RouteMap::new(vec![("/a".into(), "https://site.test/a.html".into())]),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(
            json,
            r#"{"type":"MAP_READY","routeMap":[["/a","https://site.test/a.html"]]}"#
        );
        assert_eq!(message.kind(), "MAP_READY");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"DROP_MAP"}"#).is_err());
    }
}
