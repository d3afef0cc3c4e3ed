//! The network seam: live fetching as an injectable collaborator.

use crate::event::{Request, Response};
use async_trait::async_trait;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

/// Network-level fetch failure (offline, DNS, connection reset).
///
/// An HTTP error status is *not* a `FetchError`; it arrives as an `Ok`
/// response. The fallback broker keys off exactly this distinction.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Network request failed: {0}")]
    Network(String),
}

/// Live fetch against the embedding platform's network stack.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Perform the request. `Err` means the fetch was rejected before an
    /// HTTP response existed.
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// A scripted in-memory network: fixed responses per URL and an on/off
/// switch. Stands in for the platform fetch in tests and hermetic embeddings.
pub struct StaticNetwork {
    routes: RwLock<HashMap<String, Response>>,
    requests: RwLock<Vec<Request>>,
    online: AtomicBool,
}

impl StaticNetwork {
    /// Create an online network with no routes; unrouted URLs answer 404.
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            requests: RwLock::new(Vec::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Serve `response` for `url`.
    pub async fn route(&self, url: &str, response: Response) {
        self.routes.write().await.insert(url.to_string(), response);
    }

    /// Stop serving `url`; subsequent fetches answer 404.
    pub async fn unroute(&self, url: &str) {
        self.routes.write().await.remove(url);
    }

    /// Flip the network on or off. While off, every fetch is rejected.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Every request seen so far, in arrival order.
    pub async fn requests(&self) -> Vec<Request> {
        self.requests.read().await.clone()
    }

    /// How many fetches hit `url`.
    pub async fn hits(&self, url: &str) -> usize {
        self.requests
            .read()
            .await
            .iter()
            .filter(|request| request.url.as_str() == url)
            .count()
    }
}

impl Default for StaticNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetch for StaticNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        self.requests.write().await.push(request.clone());
        if !self.online.load(Ordering::SeqCst) {
            trace!(url = %request.url, "Fetch rejected: offline");
            return Err(FetchError::Network("offline".to_string()));
        }
        let routes = self.routes.read().await;
        match routes.get(request.url.as_str()) {
            Some(response) => Ok(response.clone()),
            None => Ok(Response::new(404)),
        }
    }
}
