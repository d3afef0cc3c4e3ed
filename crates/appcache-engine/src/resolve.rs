//! The rule engine: AppCache CACHE / FALLBACK / NETWORK matching order.

use crate::clients::SharedClients;
use crate::event::FetchEvent;
use crate::AppCacheError;
use appcache_manifest::ManifestVersion;
use appcache_store::Database;
use tracing::{debug, trace};
use url::Url;

/// Where the response for an intercepted request must come from.
///
/// Computed first, executed second: the branching of the matching order
/// stays visible instead of being buried in nested continuations.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Serve the stored response for `url` from the named per-version cache.
    Cached { cache_name: String, url: Url },
    /// Try the network; on rejection serve `target` from the named cache.
    Fallback { cache_name: String, target: Url },
    /// Let the request go to the network.
    Network,
    /// Nothing matched: answer with the network-error object.
    NetworkError,
}

/// Map a fetch event to the client URL responsible for it: the client's
/// document URL when the id is known, else the referrer, else the request
/// URL itself (an otherwise-unknowable navigation).
pub async fn resolve_client_url(event: &FetchEvent, clients: &SharedClients) -> Url {
    if let Some(id) = &event.client_id {
        if let Some(client) = clients.read().await.get(id) {
            return client.url.clone();
        }
    }
    if let Some(referrer) = &event.request.referrer {
        return referrer.clone();
    }
    event.request.url.clone()
}

/// Applies the AppCache matching order to intercepted requests.
pub struct RuleEngine {
    db: Database,
    clients: SharedClients,
}

impl RuleEngine {
    /// Create a rule engine over the shared database and client registry.
    pub fn new(db: Database, clients: SharedClients) -> Self {
        Self { db, clients }
    }

    /// Decide how to answer `event`, following the matching order:
    ///
    /// 1. With a client binding whose version still exists: CACHE membership
    ///    (or the client's own URL), then longest FALLBACK prefix, then
    ///    NETWORK membership or wildcard, else the network-error object.
    /// 2. Without a usable binding: the longest current-version FALLBACK
    ///    prefix across every manifest, else the network.
    pub async fn resolution_for(&self, event: &FetchEvent) -> Result<Resolution, AppCacheError> {
        let client_url = resolve_client_url(event, &self.clients).await;
        trace!(request = %event.request.url, client = %client_url, "Resolving");

        if let Some(binding) = self.db.client_binding(&client_url).await? {
            if let Some(id) = &event.client_id {
                if self.db.client_id_hash(id).await?.is_none() {
                    self.db.put_client_id_hash(id, &binding.hash).await?;
                }
            }

            let history = self.db.manifest_history(&binding.url).await?;
            match history.as_ref().and_then(|h| h.find(&binding.hash)) {
                Some(version) => {
                    return Ok(Self::version_resolution(event, &client_url, version));
                }
                None => {
                    // The bound version was pruned while the binding
                    // lingered; continue as if the client were unbound.
                    debug!(client = %client_url, hash = %binding.hash, "Bound version missing");
                }
            }
        }

        self.cross_manifest_resolution(&event.request.url).await
    }

    fn version_resolution(
        event: &FetchEvent,
        client_url: &Url,
        version: &ManifestVersion,
    ) -> Resolution {
        let url = &event.request.url;

        if version.parsed.is_cached(url) || url == client_url {
            return Resolution::Cached {
                cache_name: version.hash.clone(),
                url: url.clone(),
            };
        }

        if let Some(rule) = version.parsed.fallback_match(url.as_str()) {
            return Resolution::Fallback {
                cache_name: version.hash.clone(),
                target: rule.target.clone(),
            };
        }

        if version.parsed.allows_network(url) {
            return Resolution::Network;
        }

        Resolution::NetworkError
    }

    /// No binding (or a pruned one): search every manifest's current version
    /// for the longest fallback prefix of `url`. Equal-length prefixes go to
    /// the manifest enumerated later; store enumeration is lexicographic by
    /// manifest URL, and that order is the documented tie-break.
    async fn cross_manifest_resolution(&self, url: &Url) -> Result<Resolution, AppCacheError> {
        let mut best: Option<(usize, Resolution)> = None;

        for (_, history) in self.db.all_manifest_histories().await? {
            let Some(version) = history.current() else {
                continue;
            };
            let Some(rule) = version.parsed.fallback_match(url.as_str()) else {
                continue;
            };
            if best
                .as_ref()
                .is_none_or(|(len, _)| rule.prefix.len() >= *len)
            {
                best = Some((
                    rule.prefix.len(),
                    Resolution::Fallback {
                        cache_name: version.hash.clone(),
                        target: rule.target.clone(),
                    },
                ));
            }
        }

        Ok(best.map_or(Resolution::Network, |(_, resolution)| resolution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{shared_clients, Client};
    use crate::event::Request;
    use appcache_manifest::ManifestVersion;
    use appcache_store::{ClientBinding, Database};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn install_version(db: &Database, manifest: &str, text: &str) -> String {
        let manifest_url = url(manifest);
        let mut history = db
            .manifest_history(&manifest_url)
            .await
            .unwrap()
            .unwrap_or_default();
        let version = ManifestVersion::from_text(&manifest_url, text);
        let hash = version.hash.clone();
        history.push(version);
        db.put_manifest_history(&manifest_url, &history).await.unwrap();
        hash
    }

    async fn bind(db: &Database, client: &str, manifest: &str, hash: &str) {
        db.put_client_binding(
            &url(client),
            &ClientBinding {
                url: url(manifest),
                hash: hash.to_string(),
            },
        )
        .await
        .unwrap();
    }

    fn event_from(client: &str, request: &str) -> FetchEvent {
        FetchEvent::new(Request::get(url(request)).referrer(url(client)))
    }

    #[tokio::test]
    async fn test_client_url_prefers_registry_then_referrer() {
        let clients = shared_clients();
        clients
            .write()
            .await
            .add(Client::new("client-1", url("https://s/page")));

        let event = FetchEvent::new(Request::get(url("https://s/a")).referrer(url("https://s/ref")))
            .with_client_id("client-1");
        assert_eq!(
            resolve_client_url(&event, &clients).await.as_str(),
            "https://s/page"
        );

        // Unknown id falls back to the referrer.
        let event = FetchEvent::new(Request::get(url("https://s/a")).referrer(url("https://s/ref")))
            .with_client_id("client-2");
        assert_eq!(
            resolve_client_url(&event, &clients).await.as_str(),
            "https://s/ref"
        );

        // No id, no referrer: the request itself.
        let event = FetchEvent::new(Request::get(url("https://s/a")));
        assert_eq!(
            resolve_client_url(&event, &clients).await.as_str(),
            "https://s/a"
        );
    }

    #[tokio::test]
    async fn test_cache_membership_resolves_to_cached() {
        let db = Database::open();
        let hash = install_version(&db, "https://s/m", "CACHE:\n/a\nNETWORK:\n*\n").await;
        bind(&db, "https://s/p", "https://s/m", &hash).await;

        let engine = RuleEngine::new(db, shared_clients());
        let resolution = engine
            .resolution_for(&event_from("https://s/p", "https://s/a"))
            .await
            .unwrap();
        assert_eq!(
            resolution,
            Resolution::Cached {
                cache_name: hash,
                url: url("https://s/a"),
            }
        );
    }

    #[tokio::test]
    async fn test_client_own_url_resolves_to_cached() {
        let db = Database::open();
        let hash = install_version(&db, "https://s/m", "NETWORK:\n*\n").await;
        bind(&db, "https://s/p", "https://s/m", &hash).await;

        let engine = RuleEngine::new(db, shared_clients());
        let resolution = engine
            .resolution_for(&event_from("https://s/p", "https://s/p"))
            .await
            .unwrap();
        assert_eq!(
            resolution,
            Resolution::Cached {
                cache_name: hash,
                url: url("https://s/p"),
            }
        );
    }

    #[tokio::test]
    async fn test_fallback_beats_network() {
        let db = Database::open();
        let hash = install_version(
            &db,
            "https://s/m",
            "FALLBACK:\n/api /offline.json\nNETWORK:\n*\n",
        )
        .await;
        bind(&db, "https://s/p", "https://s/m", &hash).await;

        let engine = RuleEngine::new(db, shared_clients());
        let resolution = engine
            .resolution_for(&event_from("https://s/p", "https://s/api/foo"))
            .await
            .unwrap();
        assert_eq!(
            resolution,
            Resolution::Fallback {
                cache_name: hash,
                target: url("https://s/offline.json"),
            }
        );
    }

    #[tokio::test]
    async fn test_network_wildcard_and_exact() {
        let db = Database::open();
        let hash = install_version(&db, "https://s/m", "CACHE:\n/a\nNETWORK:\n*\n").await;
        bind(&db, "https://s/p", "https://s/m", &hash).await;

        let engine = RuleEngine::new(db.clone(), shared_clients());
        let resolution = engine
            .resolution_for(&event_from("https://s/p", "https://s/unknown"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Network);
    }

    #[tokio::test]
    async fn test_nothing_matches_is_network_error() {
        let db = Database::open();
        let hash = install_version(&db, "https://s/m", "CACHE:\n/a\nNETWORK:\nexplicit-only\n").await;
        bind(&db, "https://s/p", "https://s/m", &hash).await;

        let engine = RuleEngine::new(db, shared_clients());
        let resolution = engine
            .resolution_for(&event_from("https://s/p", "https://s/other"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::NetworkError);
    }

    #[tokio::test]
    async fn test_first_sighting_pins_client_id() {
        let db = Database::open();
        let hash = install_version(&db, "https://s/m", "NETWORK:\n*\n").await;
        bind(&db, "https://s/p", "https://s/m", &hash).await;

        let clients = shared_clients();
        clients
            .write()
            .await
            .add(Client::new("client-1", url("https://s/p")));
        let engine = RuleEngine::new(db.clone(), clients);

        let event = FetchEvent::new(Request::get(url("https://s/x")))
            .with_client_id("client-1");
        engine.resolution_for(&event).await.unwrap();
        assert_eq!(
            db.client_id_hash("client-1").await.unwrap().as_deref(),
            Some(hash.as_str())
        );

        // A later, different binding does not overwrite the pin.
        bind(&db, "https://s/p", "https://s/m", "other-hash").await;
        engine.resolution_for(&event).await.unwrap();
        assert_eq!(
            db.client_id_hash("client-1").await.unwrap().as_deref(),
            Some(hash.as_str())
        );
    }

    #[tokio::test]
    async fn test_pruned_version_falls_through_to_cross_manifest() {
        let db = Database::open();
        install_version(&db, "https://s/m", "CACHE:\n/a\n").await;
        // The binding names a hash that no longer exists in history.
        bind(&db, "https://s/p", "https://s/m", "gone").await;
        install_version(&db, "https://s/n", "FALLBACK:\n/a /saved.html\n").await;

        let engine = RuleEngine::new(db, shared_clients());
        let resolution = engine
            .resolution_for(&event_from("https://s/p", "https://s/a/x"))
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Fallback { target, .. }
            if target.as_str() == "https://s/saved.html"));
    }

    #[tokio::test]
    async fn test_cross_manifest_longest_prefix_wins() {
        let db = Database::open();
        install_version(&db, "https://s/m1", "FALLBACK:\n/x /x-fallback\n").await;
        let deep = install_version(&db, "https://s/m2", "FALLBACK:\n/x/deeper /deep-fallback\n").await;

        let engine = RuleEngine::new(db, shared_clients());
        let resolution = engine
            .resolution_for(&event_from("https://s/nobinding", "https://s/x/deeper/q"))
            .await
            .unwrap();
        assert_eq!(
            resolution,
            Resolution::Fallback {
                cache_name: deep,
                target: url("https://s/deep-fallback"),
            }
        );
    }

    #[tokio::test]
    async fn test_cross_manifest_tie_goes_to_later_enumeration() {
        let db = Database::open();
        // Identical prefixes; enumeration is lexicographic by manifest URL,
        // so m2's current version wins the tie.
        install_version(&db, "https://s/m1", "FALLBACK:\n/x /from-m1\n").await;
        let later = install_version(&db, "https://s/m2", "FALLBACK:\n/x /from-m2\n").await;

        let engine = RuleEngine::new(db, shared_clients());
        let resolution = engine
            .resolution_for(&event_from("https://s/nobinding", "https://s/x/q"))
            .await
            .unwrap();
        assert_eq!(
            resolution,
            Resolution::Fallback {
                cache_name: later,
                target: url("https://s/from-m2"),
            }
        );
    }

    #[tokio::test]
    async fn test_cross_manifest_no_match_is_network() {
        let db = Database::open();
        install_version(&db, "https://s/m", "FALLBACK:\n/x /x-fallback\n").await;

        let engine = RuleEngine::new(db, shared_clients());
        let resolution = engine
            .resolution_for(&event_from("https://s/nobinding", "https://s/elsewhere"))
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Network);
    }
}
