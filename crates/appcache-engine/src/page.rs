//! The page-side agent: poll the manifest, install, associate, register.

use crate::event::Request;
use crate::install::{AssociationRecorder, Installer};
use crate::net::Fetch;
use crate::AppCacheError;
use appcache_manifest::{manifest_digest, resolve_manifest_url};
use appcache_store::{CacheStorage, Database};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

/// What the page boot snippet observed on the document: the document URL,
/// the document root's manifest attribute, and the configuration attribute
/// naming the worker script. The agent only runs when both attributes are
/// present.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub document_url: Url,
    pub manifest_attr: Option<String>,
    pub worker_script_attr: Option<String>,
}

/// Service worker registration failed.
#[derive(Error, Debug, Clone)]
#[error("Registration failed: {0}")]
pub struct RegistrationError(pub String);

/// Registers the worker script with the platform once page-side state is in
/// place. Failures are logged by the agent and never fatal.
#[async_trait]
pub trait WorkerRegistrar: Send + Sync {
    async fn register(&self, script_url: &Url) -> Result<(), RegistrationError>;
}

/// A registrar that does nothing; useful in tests and in embeddings where
/// the worker is installed out of band.
pub struct NoopRegistrar;

#[async_trait]
impl WorkerRegistrar for NoopRegistrar {
    async fn register(&self, _script_url: &Url) -> Result<(), RegistrationError> {
        Ok(())
    }
}

/// The page agent, run on every document load.
pub struct PageAgent {
    installer: Installer,
    recorder: AssociationRecorder,
    network: Arc<dyn Fetch>,
    registrar: Arc<dyn WorkerRegistrar>,
}

impl PageAgent {
    /// Create a page agent over the shared stores, network, and registrar.
    pub fn new(
        db: Database,
        caches: CacheStorage,
        network: Arc<dyn Fetch>,
        registrar: Arc<dyn WorkerRegistrar>,
    ) -> Self {
        Self {
            installer: Installer::new(db.clone(), caches.clone(), network.clone()),
            recorder: AssociationRecorder::new(db, caches, network.clone()),
            network,
            registrar,
        }
    }

    /// Run the page-side lifecycle for one document load: fetch the
    /// manifest, install and associate concurrently, then register the
    /// worker. A manifest fetch failure keeps the previous version current;
    /// registration failures are logged and non-fatal.
    pub async fn on_document_load(&self, boot: &BootConfig) -> Result<(), AppCacheError> {
        let (Some(manifest_attr), Some(script_attr)) =
            (&boot.manifest_attr, &boot.worker_script_attr)
        else {
            debug!(document = %boot.document_url, "No manifest or worker attribute; nothing to do");
            return Ok(());
        };

        let manifest_url = resolve_manifest_url(&boot.document_url, manifest_attr)?;

        match self.fetch_manifest_text(&manifest_url).await {
            Some(text) => {
                let hash = manifest_digest(&text);
                let (installed, recorded) = tokio::join!(
                    self.installer.install(&manifest_url, &text),
                    self.recorder
                        .record(&boot.document_url, &manifest_url, &hash),
                );
                if let Err(e) = installed {
                    error!(manifest = %manifest_url, error = %e, "Manifest installation failed");
                }
                if let Err(e) = recorded {
                    error!(document = %boot.document_url, error = %e, "Client association failed");
                }
            }
            None => {
                debug!(manifest = %manifest_url, "Manifest fetch failed; previous version stays current");
            }
        }

        match boot.document_url.join(script_attr) {
            Ok(script_url) => {
                if let Err(e) = self.registrar.register(&script_url).await {
                    warn!(script = %script_url, error = %e, "Worker registration failed");
                }
            }
            Err(e) => {
                warn!(attr = %script_attr, error = %e, "Invalid worker script attribute");
            }
        }
        Ok(())
    }

    /// Fetch the manifest body with a pass-through request. `None` on
    /// network rejection or a non-2xx status.
    async fn fetch_manifest_text(&self, manifest_url: &Url) -> Option<String> {
        let request = Request::direct_get(manifest_url);
        match self.network.fetch(&request).await {
            Ok(response) if response.ok() => Some(response.body_text()),
            Ok(response) => {
                debug!(manifest = %manifest_url, status = response.status, "Manifest fetch not ok");
                None
            }
            Err(error) => {
                debug!(manifest = %manifest_url, error = %error, "Manifest fetch rejected");
                None
            }
        }
    }
}
