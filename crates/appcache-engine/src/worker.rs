//! The worker-side agent: intercepted fetches in, responses out.

use crate::clients::SharedClients;
use crate::event::{FetchEvent, Request, Response};
use crate::gc::Sweeper;
use crate::net::Fetch;
use crate::resolve::{Resolution, RuleEngine};
use crate::AppCacheError;
use appcache_store::{CacheStorage, Database};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// The worker agent. Embedders install a fetch listener that calls
/// [`handle_fetch`] and respond with its result.
///
/// [`handle_fetch`]: WorkerAgent::handle_fetch
pub struct WorkerAgent {
    caches: CacheStorage,
    network: Arc<dyn Fetch>,
    engine: RuleEngine,
    sweeper: Sweeper,
}

impl WorkerAgent {
    /// Create a worker agent over the shared stores, clients, and network.
    pub fn new(
        db: Database,
        caches: CacheStorage,
        clients: SharedClients,
        network: Arc<dyn Fetch>,
    ) -> Self {
        Self {
            engine: RuleEngine::new(db.clone(), clients.clone()),
            sweeper: Sweeper::new(db, caches.clone(), clients),
            caches,
            network,
        }
    }

    /// Answer one intercepted fetch.
    ///
    /// Requests carrying the pass-through header reach the network exactly
    /// as issued. Any internal failure is logged and degrades to a live
    /// fetch; a navigation event schedules a cache sweep after responding.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> Response {
        if event.request.passes_through() {
            return self.live_fetch_or_error(&event.request).await;
        }

        let response = match self.respond(event).await {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    url = %event.request.url,
                    error = %error,
                    "Resolution failed; degrading to live fetch"
                );
                self.live_fetch_or_error(&event.request).await
            }
        };

        if event.request.is_navigation() {
            let sweeper = self.sweeper.clone();
            tokio::spawn(async move {
                if let Err(error) = sweeper.sweep().await {
                    warn!(error = %error, "Cache sweep failed");
                }
            });
        }

        response
    }

    async fn respond(&self, event: &FetchEvent) -> Result<Response, AppCacheError> {
        match self.engine.resolution_for(event).await? {
            Resolution::Cached { cache_name, url } => self
                .caches
                .match_in(&cache_name, url.as_str())
                .await
                .map(Response::from_cached)
                .ok_or(AppCacheError::CacheMiss {
                    cache: cache_name,
                    url: url.to_string(),
                }),
            Resolution::Fallback { cache_name, target } => {
                self.fetch_with_fallback(&event.request, &target, &cache_name)
                    .await
            }
            Resolution::Network => Ok(self.network.fetch(&event.request).await?),
            Resolution::NetworkError => Ok(Response::error()),
        }
    }

    /// Network-with-fallback: a live fetch, and on rejection (never on a
    /// mere error status) the stored response for `target` from the named
    /// cache. A miss there propagates the original rejection.
    async fn fetch_with_fallback(
        &self,
        request: &Request,
        target: &Url,
        cache_name: &str,
    ) -> Result<Response, AppCacheError> {
        match self.network.fetch(request).await {
            Ok(response) => Ok(response),
            Err(error) => match self.caches.match_in(cache_name, target.as_str()).await {
                Some(stored) => {
                    debug!(url = %request.url, fallback = %target, "Serving stored fallback");
                    Ok(Response::from_cached(stored))
                }
                None => Err(error.into()),
            },
        }
    }

    async fn live_fetch_or_error(&self, request: &Request) -> Response {
        match self.network.fetch(request).await {
            Ok(response) => response,
            Err(error) => {
                debug!(url = %request.url, error = %error, "Live fetch rejected");
                Response::error()
            }
        }
    }
}
