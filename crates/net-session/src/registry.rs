//! ClientRegistry — the server's connected-client table.
//!
//! Entries are created when a pending link is accepted and assigned to the
//! poll group, and removed when the link ends, is kicked, or the server shuts
//! down. Only the pump thread mutates the table; application threads read
//! copies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use net_protocol::ClientId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: ClientId,
    /// Transport description of the link, or the name set by `rename_client`.
    pub connection_desc: String,
    pub connected_at: DateTime<Utc>,
}

impl ClientInfo {
    pub fn new(id: ClientId, connection_desc: impl Into<String>) -> Self {
        Self {
            id,
            connection_desc: connection_desc.into(),
            connected_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<BTreeMap<ClientId, ClientInfo>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.read().contains_key(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<ClientInfo> {
        self.clients.read().get(&id).cloned()
    }

    /// Copy of every entry, ordered by id. May be stale as soon as it returns.
    pub fn snapshot(&self) -> Vec<ClientInfo> {
        self.clients.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.read().keys().copied().collect()
    }

    /// Add a new entry. An id that is already present is left untouched.
    pub(crate) fn insert(&self, info: ClientInfo) -> bool {
        let mut clients = self.clients.write();
        if clients.contains_key(&info.id) {
            return false;
        }
        clients.insert(info.id, info);
        true
    }

    pub(crate) fn remove(&self, id: ClientId) -> Option<ClientInfo> {
        self.clients.write().remove(&id)
    }

    pub(crate) fn rename(&self, id: ClientId, name: &str) -> bool {
        match self.clients.write().get_mut(&id) {
            Some(info) => {
                info.connection_desc = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Remove every entry, returning them in id order.
    pub(crate) fn drain(&self) -> Vec<ClientInfo> {
        std::mem::take(&mut *self.clients.write()).into_values().collect()
    }
}
