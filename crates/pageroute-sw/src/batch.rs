//! Per-client buffers of declared routes awaiting `STORE_MAP`.

use indexmap::IndexMap;

use crate::clients::ClientId;
use crate::registry::RouteEntry;

#[derive(Debug, Default)]
pub struct PendingBatch {
    routes: IndexMap<ClientId, Vec<RouteEntry>>,
}

impl PendingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, client: ClientId, entry: RouteEntry) {
        self.routes.entry(client).or_default().push(entry);
    }

    /// Take everything `client` declared since its last flush.
    pub fn take(&mut self, client: ClientId) -> Vec<RouteEntry> {
        self.routes.shift_remove(&client).unwrap_or_default()
    }

    /// Drop a departed client's buffer. Returns how many entries were lost.
    pub fn discard(&mut self, client: ClientId) -> usize {
        self.take(client).len()
    }

    /// Total buffered entries across clients.
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
