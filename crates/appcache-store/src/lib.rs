//! # AppCache Store
//!
//! Persistent state for the AppCache compatibility shim.
//!
//! ## Features
//!
//! - **Record database**: one versioned database with three object stores,
//!   each read or write an atomic single-store operation
//! - **Typed accessors**: manifest histories, client bindings, client-id pins
//! - **Response caches**: one named cache per manifest-version hash
//!
//! ## Architecture
//!
//! ```text
//! Database ("appcache", v1)
//!     ├── manifest_url_to_contents   manifest URL → ManifestHistory
//!     ├── path_to_manifest           client URL   → ClientBinding
//!     └── client_id_to_hash          client id    → hash
//!
//! CacheStorage
//!     └── ResponseCache (named by version hash)
//!             └── URL → CachedResponse
//! ```
//!
//! Record stores keep their keys in a `BTreeMap`, so enumeration is always
//! lexicographic by key. The rule engine's cross-manifest tie-break is
//! defined in terms of this order.

use appcache_manifest::ManifestHistory;
use hashbrown::HashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

// ==================== Identifiers ====================

/// Fixed database name shared by the page and worker agents.
pub const DB_NAME: &str = "appcache";

/// Schema version; increases monotonically if the store layout evolves.
pub const DB_VERSION: u64 = 1;

/// Object store: manifest URL → [`ManifestHistory`].
pub const MANIFEST_URL_TO_CONTENTS: &str = "manifest_url_to_contents";

/// Object store: client URL → [`ClientBinding`].
pub const PATH_TO_MANIFEST: &str = "path_to_manifest";

/// Object store: opaque client id → version hash.
pub const CLIENT_ID_TO_HASH: &str = "client_id_to_hash";

// ==================== Errors ====================

/// Errors that can occur in store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object store not found: {0}")]
    StoreNotFound(String),

    #[error("Serialization failed in store {store}: {source}")]
    Serialization {
        store: String,
        #[source]
        source: serde_json::Error,
    },
}

// ==================== Records ====================

/// The manifest version a client page committed to when it last loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientBinding {
    /// The manifest URL named by the page's manifest attribute.
    pub url: Url,
    /// The version hash current at the time of the load.
    pub hash: String,
}

// ==================== Record database ====================

#[derive(Debug, Default)]
struct ObjectStore {
    records: BTreeMap<String, JsonValue>,
}

#[derive(Debug)]
struct DatabaseInner {
    version: u64,
    stores: BTreeMap<String, ObjectStore>,
}

/// Handle to the shared record database.
///
/// Cheap to clone; every agent receives its own handle instead of reaching
/// for a process-global singleton. Opening is idempotent and performs the
/// schema upgrade (object-store creation) on first use.
#[derive(Clone)]
pub struct Database {
    inner: Arc<RwLock<DatabaseInner>>,
}

impl Database {
    /// Open the database, creating the three object stores.
    pub fn open() -> Self {
        let mut stores = BTreeMap::new();
        for name in [MANIFEST_URL_TO_CONTENTS, PATH_TO_MANIFEST, CLIENT_ID_TO_HASH] {
            stores.insert(name.to_string(), ObjectStore::default());
        }
        debug!(name = DB_NAME, version = DB_VERSION, "Database opened");
        Self {
            inner: Arc::new(RwLock::new(DatabaseInner {
                version: DB_VERSION,
                stores,
            })),
        }
    }

    /// Current schema version.
    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    async fn get_value<T: DeserializeOwned>(
        &self,
        store: &str,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let inner = self.inner.read().await;
        let object_store = inner
            .stores
            .get(store)
            .ok_or_else(|| StoreError::StoreNotFound(store.to_string()))?;
        object_store
            .records
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|source| {
                    StoreError::Serialization {
                        store: store.to_string(),
                        source,
                    }
                })
            })
            .transpose()
    }

    async fn put_value<T: Serialize>(
        &self,
        store: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_value(value).map_err(|source| StoreError::Serialization {
            store: store.to_string(),
            source,
        })?;
        let mut inner = self.inner.write().await;
        let object_store = inner
            .stores
            .get_mut(store)
            .ok_or_else(|| StoreError::StoreNotFound(store.to_string()))?;
        object_store.records.insert(key.to_string(), encoded);
        Ok(())
    }

    async fn delete_value(&self, store: &str, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let object_store = inner
            .stores
            .get_mut(store)
            .ok_or_else(|| StoreError::StoreNotFound(store.to_string()))?;
        Ok(object_store.records.remove(key).is_some())
    }

    async fn store_keys(&self, store: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let object_store = inner
            .stores
            .get(store)
            .ok_or_else(|| StoreError::StoreNotFound(store.to_string()))?;
        Ok(object_store.records.keys().cloned().collect())
    }

    // ---- manifest_url_to_contents ----

    /// Version history recorded for `manifest_url`.
    pub async fn manifest_history(
        &self,
        manifest_url: &Url,
    ) -> Result<Option<ManifestHistory>, StoreError> {
        self.get_value(MANIFEST_URL_TO_CONTENTS, manifest_url.as_str())
            .await
    }

    /// Persist the version history for `manifest_url` in one write.
    pub async fn put_manifest_history(
        &self,
        manifest_url: &Url,
        history: &ManifestHistory,
    ) -> Result<(), StoreError> {
        self.put_value(MANIFEST_URL_TO_CONTENTS, manifest_url.as_str(), history)
            .await
    }

    /// Every recorded history, in lexicographic manifest-URL order.
    pub async fn all_manifest_histories(
        &self,
    ) -> Result<Vec<(String, ManifestHistory)>, StoreError> {
        let inner = self.inner.read().await;
        let object_store = inner
            .stores
            .get(MANIFEST_URL_TO_CONTENTS)
            .ok_or_else(|| StoreError::StoreNotFound(MANIFEST_URL_TO_CONTENTS.to_string()))?;
        object_store
            .records
            .iter()
            .map(|(key, value)| {
                serde_json::from_value(value.clone())
                    .map(|history| (key.clone(), history))
                    .map_err(|source| StoreError::Serialization {
                        store: MANIFEST_URL_TO_CONTENTS.to_string(),
                        source,
                    })
            })
            .collect()
    }

    // ---- path_to_manifest ----

    /// The binding recorded for a client URL, if any.
    pub async fn client_binding(
        &self,
        client_url: &Url,
    ) -> Result<Option<ClientBinding>, StoreError> {
        self.get_value(PATH_TO_MANIFEST, client_url.as_str()).await
    }

    /// Record which manifest version a client URL committed to.
    pub async fn put_client_binding(
        &self,
        client_url: &Url,
        binding: &ClientBinding,
    ) -> Result<(), StoreError> {
        self.put_value(PATH_TO_MANIFEST, client_url.as_str(), binding)
            .await
    }

    // ---- client_id_to_hash ----

    /// The version hash pinned by an opaque client id, if any.
    pub async fn client_id_hash(&self, client_id: &str) -> Result<Option<String>, StoreError> {
        self.get_value(CLIENT_ID_TO_HASH, client_id).await
    }

    /// Pin a version hash to a client id.
    pub async fn put_client_id_hash(
        &self,
        client_id: &str,
        hash: &str,
    ) -> Result<(), StoreError> {
        self.put_value(CLIENT_ID_TO_HASH, client_id, &hash).await
    }

    /// Drop a client-id pin. Returns whether it existed.
    pub async fn delete_client_id(&self, client_id: &str) -> Result<bool, StoreError> {
        self.delete_value(CLIENT_ID_TO_HASH, client_id).await
    }

    /// All pinned client ids, in lexicographic order.
    pub async fn client_ids(&self) -> Result<Vec<String>, StoreError> {
        self.store_keys(CLIENT_ID_TO_HASH).await
    }
}

// ==================== Response caches ====================

/// A stored response, keyed by request URL inside a named cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// The request URL this response is keyed on.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response headers (name → value).
    pub headers: HashMap<String, String>,
    /// Response body bytes.
    pub body: Vec<u8>,
    /// Milliseconds since epoch when this entry was stored.
    pub cached_at: u64,
}

/// A single named cache of URL → response.
#[derive(Debug, Default)]
struct ResponseCache {
    entries: BTreeMap<String, CachedResponse>,
}

/// All named response caches, shared between the installer and the worker.
///
/// Cache names are manifest-version hashes; deleting a cache retires the
/// whole version's pre-cached responses at once.
#[derive(Clone, Default)]
pub struct CacheStorage {
    caches: Arc<RwLock<BTreeMap<String, ResponseCache>>>,
}

impl CacheStorage {
    /// Create empty cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a named cache, creating it if absent.
    pub async fn open(&self, name: &str) {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_default();
    }

    /// Whether a named cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a named cache and all of its entries.
    pub async fn delete(&self, name: &str) -> bool {
        let deleted = self.caches.write().await.remove(name).is_some();
        if deleted {
            debug!(cache = name, "Response cache deleted");
        }
        deleted
    }

    /// All cache names, in lexicographic order.
    pub async fn names(&self) -> Vec<String> {
        self.caches.read().await.keys().cloned().collect()
    }

    /// Store a response under `url` in the named cache, creating the cache
    /// if absent and replacing any previous entry for the same URL.
    pub async fn put(&self, name: &str, url: &str, response: CachedResponse) {
        let mut caches = self.caches.write().await;
        let cache = caches.entry(name.to_string()).or_default();
        cache.entries.insert(url.to_string(), response);
    }

    /// Look up the stored response for `url` in the named cache.
    pub async fn match_in(&self, name: &str, url: &str) -> Option<CachedResponse> {
        self.caches
            .read()
            .await
            .get(name)?
            .entries
            .get(url)
            .cloned()
    }

    /// Remove a single entry. Returns whether it existed.
    pub async fn delete_entry(&self, name: &str, url: &str) -> bool {
        match self.caches.write().await.get_mut(name) {
            Some(cache) => cache.entries.remove(url).is_some(),
            None => false,
        }
    }

    /// URLs stored in the named cache.
    pub async fn entry_urls(&self, name: &str) -> Vec<String> {
        match self.caches.read().await.get(name) {
            Some(cache) => cache.entries.keys().cloned().collect(),
            None => Vec::new(),
        }
    }
}

/// Milliseconds since the Unix epoch, for `CachedResponse::cached_at`.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ==================== Tests ====================
