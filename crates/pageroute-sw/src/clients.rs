//! Clients API: the pages attached to the worker.

use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::message::{ServiceWorkerEvent, WorkerMessage};
use crate::{ServiceWorkerError, ServiceWorkerId};

/// Unique identifier for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A page attached to the worker.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,

    /// URL the page was opened at.
    pub url: Url,

    /// Worker currently controlling this page.
    pub controller: Option<ServiceWorkerId>,

    sender: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl Client {
    pub fn new(url: Url, sender: mpsc::UnboundedSender<ServiceWorkerEvent>) -> Self {
        Self {
            id: ClientId::new(),
            url,
            controller: None,
            sender,
        }
    }

    /// Post message to client.
    pub fn post_message(&self, message: WorkerMessage) -> Result<(), ServiceWorkerError> {
        trace!(client = %self.id, kind = message.kind(), "Posting message to client");
        self.notify(ServiceWorkerEvent::Message(message))
    }

    /// Deliver any event to the client.
    pub fn notify(&self, event: ServiceWorkerEvent) -> Result<(), ServiceWorkerError> {
        self.sender
            .send(event)
            .map_err(|_| ServiceWorkerError::StateError(format!("{} is gone", self.id)))
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: IndexMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id, client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.shift_remove(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Post to one client.
    pub fn post(&self, id: ClientId, message: WorkerMessage) -> Result<(), ServiceWorkerError> {
        self.get(id)
            .ok_or_else(|| ServiceWorkerError::StateError(format!("unknown {}", id)))?
            .post_message(message)
    }

    /// Post to every client. Clients whose page is gone are dropped.
    /// Returns the number of deliveries.
    pub fn broadcast(&mut self, message: WorkerMessage) -> usize {
        self.notify_all(ServiceWorkerEvent::Message(message))
    }

    /// Deliver an event to every client, dropping the closed ones.
    pub fn notify_all(&mut self, event: ServiceWorkerEvent) -> usize {
        let mut delivered = 0;
        self.clients.retain(|id, client| match client.notify(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                debug!(client = %id, "Dropping closed client");
                false
            }
        });
        delivered
    }

    /// Take control of every attached page.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<(ClientId, Option<ServiceWorkerId>)> {
        self.clients
            .values_mut()
            .map(|client| (client.id, client.controller.replace(worker)))
            .collect()
    }
}
