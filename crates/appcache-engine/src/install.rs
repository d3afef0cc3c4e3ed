//! Page-side installation: new manifest versions and client associations.

use crate::event::Request;
use crate::net::Fetch;
use crate::AppCacheError;
use appcache_manifest::{manifest_digest, ManifestVersion};
use appcache_store::{CacheStorage, ClientBinding, Database};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Installs new manifest versions: parses the text, pre-caches its resources
/// into a fresh per-version cache, and appends the version to history.
pub struct Installer {
    db: Database,
    caches: CacheStorage,
    network: Arc<dyn Fetch>,
}

impl Installer {
    /// Create an installer over the shared stores and network.
    pub fn new(db: Database, caches: CacheStorage, network: Arc<dyn Fetch>) -> Self {
        Self {
            db,
            caches,
            network,
        }
    }

    /// Ensure the stores and the per-version cache reflect `text` as the
    /// current version of `manifest_url`. Installing the already-current
    /// text is a no-op. Returns the version hash either way.
    ///
    /// Individual pre-cache failures never abort the rest; a partially
    /// populated cache falls through to live fetch at request time.
    pub async fn install(
        &self,
        manifest_url: &Url,
        text: &str,
    ) -> Result<String, AppCacheError> {
        let hash = manifest_digest(text);
        let mut history = self
            .db
            .manifest_history(manifest_url)
            .await?
            .unwrap_or_default();

        // The hash is authoritative: even if a stored text compares equal,
        // agreement is judged on the digest alone.
        if history.current().is_some_and(|current| current.hash == hash) {
            debug!(manifest = %manifest_url, hash, "Manifest unchanged");
            return Ok(hash);
        }

        let version = ManifestVersion::from_text(manifest_url, text);
        self.populate_cache(&version).await;

        if history.push(version) {
            self.db.put_manifest_history(manifest_url, &history).await?;
            info!(
                manifest = %manifest_url,
                hash,
                versions = history.len(),
                "Installed new manifest version"
            );
        }
        Ok(hash)
    }

    /// Fetch every CACHE entry and fallback target into the cache named by
    /// the version hash.
    async fn populate_cache(&self, version: &ManifestVersion) {
        self.caches.open(&version.hash).await;

        for url in version.parsed.precache_urls() {
            let request = Request::direct_get(&url);
            match self.network.fetch(&request).await {
                Ok(response) => {
                    if response.status == 404
                        || response.status == 410
                        || response.has_no_store_directive()
                    {
                        // Eviction hint: the resource is gone or refuses storage.
                        self.caches.delete_entry(&version.hash, url.as_str()).await;
                        debug!(url = %url, status = response.status, "Pre-cache entry evicted");
                    } else if response.ok() {
                        self.caches
                            .put(&version.hash, url.as_str(), response.to_cached(url.as_str()))
                            .await;
                    } else {
                        debug!(
                            url = %url,
                            status = response.status,
                            "Pre-cache response not storable; keeping any previous entry"
                        );
                    }
                }
                Err(error) => {
                    warn!(url = %url, error = %error, "Pre-cache fetch failed");
                }
            }
        }
    }
}

/// Records which manifest version the current document committed to, and
/// seeds that version's cache with the document itself (cache-as-you-go).
pub struct AssociationRecorder {
    db: Database,
    caches: CacheStorage,
    network: Arc<dyn Fetch>,
}

impl AssociationRecorder {
    /// Create a recorder over the shared stores and network.
    pub fn new(db: Database, caches: CacheStorage, network: Arc<dyn Fetch>) -> Self {
        Self {
            db,
            caches,
            network,
        }
    }

    /// Write the client binding for `document_url`, then seed the
    /// per-version cache with the document. The seed fetch is tolerant of
    /// failure; the binding write is not.
    pub async fn record(
        &self,
        document_url: &Url,
        manifest_url: &Url,
        hash: &str,
    ) -> Result<(), AppCacheError> {
        let binding = ClientBinding {
            url: manifest_url.clone(),
            hash: hash.to_string(),
        };
        self.db.put_client_binding(document_url, &binding).await?;
        debug!(client = %document_url, manifest = %manifest_url, hash, "Client binding recorded");

        let request = Request::direct_get(document_url);
        match self.network.fetch(&request).await {
            Ok(response) if response.ok() => {
                self.caches
                    .put(
                        hash,
                        document_url.as_str(),
                        response.to_cached(document_url.as_str()),
                    )
                    .await;
            }
            Ok(response) => {
                debug!(url = %document_url, status = response.status, "Document seed not storable");
            }
            Err(error) => {
                debug!(url = %document_url, error = %error, "Document seed fetch failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Response;
    use crate::net::StaticNetwork;
    use http::HeaderValue;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn setup() -> (Database, CacheStorage, Arc<StaticNetwork>) {
        (Database::open(), CacheStorage::new(), Arc::new(StaticNetwork::new()))
    }

    #[tokio::test]
    async fn test_install_populates_per_version_cache() {
        let (db, caches, network) = setup();
        network.route("https://s/a", Response::with_body(200, &b"aaa"[..])).await;
        network.route("https://s/offline.json", Response::with_body(200, &b"{}"[..])).await;

        let installer = Installer::new(db.clone(), caches.clone(), network.clone());
        let manifest_url = url("https://s/m");
        let text = "CACHE:\n/a\nFALLBACK:\n/api /offline.json\nNETWORK:\n*\n";
        let hash = installer.install(&manifest_url, text).await.unwrap();

        assert_eq!(hash, manifest_digest(text));
        assert!(caches.has(&hash).await);
        assert!(caches.match_in(&hash, "https://s/a").await.is_some());
        assert!(caches.match_in(&hash, "https://s/offline.json").await.is_some());

        let history = db.manifest_history(&manifest_url).await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.current().unwrap().hash, hash);
    }

    #[tokio::test]
    async fn test_install_idempotent() {
        let (db, caches, network) = setup();
        network.route("https://s/a", Response::with_body(200, &b"aaa"[..])).await;

        let installer = Installer::new(db.clone(), caches.clone(), network.clone());
        let manifest_url = url("https://s/m");
        let text = "CACHE:\n/a\n";

        installer.install(&manifest_url, text).await.unwrap();
        let first_urls = caches.entry_urls(&manifest_digest(text)).await;

        installer.install(&manifest_url, text).await.unwrap();
        let history = db.manifest_history(&manifest_url).await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(caches.entry_urls(&manifest_digest(text)).await, first_urls);
        // The no-op does not re-fetch.
        assert_eq!(network.hits("https://s/a").await, 1);
    }

    #[tokio::test]
    async fn test_install_version_monotonicity() {
        let (db, _caches, network) = setup();
        let installer = Installer::new(db.clone(), CacheStorage::new(), network);
        let manifest_url = url("https://s/m");

        let texts = ["CACHE:\n/a\n", "CACHE:\n/b\n", "CACHE:\n/c\n"];
        for text in texts {
            installer.install(&manifest_url, text).await.unwrap();
        }

        let history = db.manifest_history(&manifest_url).await.unwrap().unwrap();
        assert_eq!(history.len(), 3);
        let hashes: Vec<_> = history.iter().map(|v| v.hash.clone()).collect();
        assert_eq!(
            hashes,
            texts.iter().map(|t| manifest_digest(t)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_install_evicts_gone_and_no_store() {
        let (db, caches, network) = setup();
        let installer = Installer::new(db.clone(), caches.clone(), network.clone());
        let manifest_url = url("https://s/m");

        network.route("https://s/a", Response::with_body(200, &b"v1"[..])).await;
        network.route("https://s/b", Response::with_body(200, &b"v1"[..])).await;
        let v1 = installer.install(&manifest_url, "CACHE:\n/a\n/b\n").await.unwrap();
        assert!(caches.match_in(&v1, "https://s/a").await.is_some());

        // Next version: /a is gone, /b refuses storage.
        network.route("https://s/a", Response::new(410)).await;
        network
            .route(
                "https://s/b",
                Response::with_body(200, &b"v2"[..]).header(
                    http::header::CACHE_CONTROL,
                    HeaderValue::from_static("no-store"),
                ),
            )
            .await;
        let v2 = installer
            .install(&manifest_url, "# bump\nCACHE:\n/a\n/b\n")
            .await
            .unwrap();

        assert!(caches.match_in(&v2, "https://s/a").await.is_none());
        assert!(caches.match_in(&v2, "https://s/b").await.is_none());
        // The previous version's cache is untouched.
        assert!(caches.match_in(&v1, "https://s/a").await.is_some());
    }

    #[tokio::test]
    async fn test_install_survives_individual_failures() {
        let (db, caches, network) = setup();
        let installer = Installer::new(db.clone(), caches.clone(), network.clone());
        let manifest_url = url("https://s/m");

        // /err answers 500, /a answers 200; neither the 500 nor the 404 for
        // /missing aborts the rest.
        network.route("https://s/err", Response::new(500)).await;
        network.route("https://s/a", Response::with_body(200, &b"aaa"[..])).await;

        let hash = installer
            .install(&manifest_url, "CACHE:\n/err\n/missing\n/a\n")
            .await
            .unwrap();

        assert!(caches.match_in(&hash, "https://s/a").await.is_some());
        assert!(caches.match_in(&hash, "https://s/err").await.is_none());
        let history = db.manifest_history(&manifest_url).await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_precache_requests_pass_through() {
        let (db, caches, network) = setup();
        network.route("https://s/a", Response::new(200)).await;
        let installer = Installer::new(db, caches, network.clone());

        installer.install(&url("https://s/m"), "CACHE:\n/a\n").await.unwrap();

        let requests = network.requests().await;
        assert!(!requests.is_empty());
        assert!(requests.iter().all(|request| request.passes_through()));
    }

    #[tokio::test]
    async fn test_recorder_binding_and_seed() {
        let (db, caches, network) = setup();
        network
            .route("https://s/p", Response::with_body(200, &b"<html>"[..]))
            .await;

        let recorder = AssociationRecorder::new(db.clone(), caches.clone(), network.clone());
        recorder
            .record(&url("https://s/p"), &url("https://s/m"), "h1")
            .await
            .unwrap();

        let binding = db.client_binding(&url("https://s/p")).await.unwrap().unwrap();
        assert_eq!(binding.url.as_str(), "https://s/m");
        assert_eq!(binding.hash, "h1");
        assert!(caches.match_in("h1", "https://s/p").await.is_some());
    }

    #[tokio::test]
    async fn test_recorder_tolerates_seed_failure() {
        let (db, caches, network) = setup();
        network.set_online(false);

        let recorder = AssociationRecorder::new(db.clone(), caches.clone(), network);
        recorder
            .record(&url("https://s/p"), &url("https://s/m"), "h1")
            .await
            .unwrap();

        assert!(db.client_binding(&url("https://s/p")).await.unwrap().is_some());
        assert!(caches.match_in("h1", "https://s/p").await.is_none());
    }
}
