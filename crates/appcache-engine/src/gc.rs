//! Garbage collection of per-version caches no live client references.

use crate::clients::SharedClients;
use appcache_store::{CacheStorage, Database, StoreError};
use std::collections::HashSet;
use tracing::{debug, warn};
use url::Url;

/// What one sweep did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Client-id pins dropped because the client is gone.
    pub stale_clients: usize,
    /// Per-version caches deleted.
    pub caches_deleted: Vec<String>,
    /// History records pruned alongside their caches.
    pub versions_pruned: usize,
}

/// Reconciles recorded client-id pins against live clients and deletes
/// per-version caches that nothing references any more.
///
/// A hash survives the sweep while any live client still pins it, or while
/// it is the current version of any manifest.
#[derive(Clone)]
pub struct Sweeper {
    db: Database,
    caches: CacheStorage,
    clients: SharedClients,
}

impl Sweeper {
    /// Create a sweeper over the shared stores and client registry.
    pub fn new(db: Database, caches: CacheStorage, clients: SharedClients) -> Self {
        Self {
            db,
            caches,
            clients,
        }
    }

    /// Run one sweep. Never blocks request handling; the worker agent
    /// schedules it after navigation fetches.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();

        let active_ids: HashSet<String> = self
            .clients
            .read()
            .await
            .match_all()
            .into_iter()
            .map(|client| client.id)
            .collect();

        // Partition recorded pins into live and stale; stale pins are
        // dropped as they are read.
        let mut live_hashes = HashSet::new();
        let mut stale_hashes = HashSet::new();
        for id in self.db.client_ids().await? {
            let hash = self.db.client_id_hash(&id).await?;
            if active_ids.contains(&id) {
                live_hashes.extend(hash);
            } else {
                stale_hashes.extend(hash);
                self.db.delete_client_id(&id).await?;
                report.stale_clients += 1;
            }
        }

        let histories = self.db.all_manifest_histories().await?;
        let mut retired_hashes = HashSet::new();
        let mut current_hashes = HashSet::new();
        for (_, history) in &histories {
            retired_hashes.extend(history.stale_hashes().map(str::to_string));
            current_hashes.extend(history.current().map(|v| v.hash.clone()));
        }

        let doomed: HashSet<String> = stale_hashes
            .into_iter()
            .filter(|hash| {
                retired_hashes.contains(hash)
                    && !live_hashes.contains(hash)
                    && !current_hashes.contains(hash)
            })
            .collect();

        for hash in &doomed {
            self.caches.delete(hash).await;
            report.caches_deleted.push(hash.clone());
        }
        report.caches_deleted.sort();

        if !doomed.is_empty() {
            report.versions_pruned = self.prune_histories(histories, &doomed).await?;
            debug!(
                caches = report.caches_deleted.len(),
                versions = report.versions_pruned,
                "Sweep retired unreferenced versions"
            );
        }

        Ok(report)
    }

    /// Drop pruned-cache records from the histories their caches belonged
    /// to, so history does not grow without bound.
    async fn prune_histories(
        &self,
        histories: Vec<(String, appcache_manifest::ManifestHistory)>,
        doomed: &HashSet<String>,
    ) -> Result<usize, StoreError> {
        let mut pruned = 0;
        for (key, mut history) in histories {
            let dropped = history.prune(|hash| doomed.contains(hash));
            if dropped == 0 {
                continue;
            }
            let Ok(manifest_url) = Url::parse(&key) else {
                warn!(key, "Skipping history with unparseable key");
                continue;
            };
            self.db.put_manifest_history(&manifest_url, &history).await?;
            pruned += dropped;
        }
        Ok(pruned)
    }
}
