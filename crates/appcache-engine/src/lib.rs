//! # AppCache Engine
//!
//! Manifest lifecycle and fetch resolution emulating the deprecated HTML
//! Application Cache on top of a fetch-interception layer and two persistent
//! stores.
//!
//! ## Features
//!
//! - **Page agent**: manifest polling, version installation, client
//!   association, worker registration
//! - **Worker agent**: CACHE / FALLBACK / NETWORK resolution per intercepted
//!   fetch, cross-manifest fallback selection, network-with-fallback
//! - **Garbage collection**: retires per-version caches no live client pins
//!
//! ## Architecture
//!
//! ```text
//! PageAgent (document context, every navigation)
//!     ├── Installer             new manifest version → per-version cache
//!     ├── AssociationRecorder   document URL → (manifest URL, hash)
//!     └── WorkerRegistrar       registers the worker script last
//!
//! WorkerAgent (fetch interception)
//!     ├── RuleEngine            (client URL, request URL) → Resolution
//!     ├── fetch-with-fallback   live fetch, stored response on rejection
//!     └── Sweeper               deletes caches once unreferenced
//! ```
//!
//! Both agents communicate only through [`appcache_store::Database`] and
//! [`appcache_store::CacheStorage`].

pub mod clients;
pub mod event;
pub mod gc;
pub mod install;
pub mod logging;
pub mod net;
pub mod page;
pub mod resolve;
pub mod worker;

use thiserror::Error;

pub use clients::{shared_clients, Client, ClientRegistry, SharedClients};
pub use event::{
    CredentialsMode, FetchEvent, RedirectMode, Request, RequestMode, Response, ResponseKind,
    USE_FETCH_HEADER,
};
pub use gc::{SweepReport, Sweeper};
pub use install::{AssociationRecorder, Installer};
pub use logging::{init_logging, LogConfig};
pub use net::{Fetch, FetchError, StaticNetwork};
pub use page::{BootConfig, NoopRegistrar, PageAgent, RegistrationError, WorkerRegistrar};
pub use resolve::{resolve_client_url, Resolution, RuleEngine};
pub use worker::WorkerAgent;

/// Errors that can occur while resolving or installing.
///
/// The worker agent's top-level rule is to log any of these and degrade to a
/// live fetch; none of them ever reaches an embedder as a panic.
#[derive(Error, Debug)]
pub enum AppCacheError {
    #[error(transparent)]
    Store(#[from] appcache_store::StoreError),

    #[error(transparent)]
    Manifest(#[from] appcache_manifest::ManifestError),

    #[error(transparent)]
    Fetch(#[from] net::FetchError),

    #[error("No response stored for {url} in cache {cache}")]
    CacheMiss { cache: String, url: String },
}
