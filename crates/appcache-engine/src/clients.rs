//! In-memory registry of live clients (controlled browsing contexts).

use hashbrown::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

/// A live client: one browsing context served by the worker.
#[derive(Debug, Clone)]
pub struct Client {
    /// Opaque, platform-assigned identifier.
    pub id: String,
    /// The client's current document URL.
    pub url: Url,
}

impl Client {
    /// Create a client.
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self { id: id.into(), url }
    }
}

/// Registry of live clients; stands in for the platform's client
/// enumeration. The GC sweeper treats absence from [`match_all`] as "no
/// longer live".
///
/// [`match_all`]: ClientRegistry::match_all
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Client>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a client by id.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Every live client.
    pub fn match_all(&self) -> Vec<Client> {
        self.clients.values().cloned().collect()
    }

    /// Add (or replace) a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client, e.g. when its tab closes.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Number of live clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is live.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// The registry handle shared between the worker agent and the embedder.
pub type SharedClients = Arc<RwLock<ClientRegistry>>;

/// Create a shareable, initially empty registry.
pub fn shared_clients() -> SharedClients {
    Arc::new(RwLock::new(ClientRegistry::new()))
}
