//! Change-aware pruner: computes the resource plan and executes it.
//!
//! One prune pass lists every resource matching the filter snapshot,
//! refuses to touch resources created after the pass began (a client may
//! still be connecting), then deletes in the order containers, networks,
//! volumes, images with bounded retries. Cleanup is best-effort: errors
//! in one kind or filter never abort the others, and everything that went
//! wrong is reported together at the end.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ryuk_core::errors::RuntimeError;
use ryuk_core::filter::Filter;
use ryuk_core::runtime::{
    ImageDeleteItem, Resource, ResourceKind, RuntimeClient, REAPER_LABEL, REAPER_LABEL_VALUE,
};

use crate::config::Config;

/// Delay between delete rounds while a kind still has failing removals.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Per-kind removal counts for one prune pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneSummary {
    pub containers: u64,
    pub networks: u64,
    pub volumes: u64,
    pub images: u64,
}

impl PruneSummary {
    fn record(&mut self, kind: ResourceKind, count: u64) {
        match kind {
            ResourceKind::Container => self.containers += count,
            ResourceKind::Network => self.networks += count,
            ResourceKind::Volume => self.volumes += count,
            ResourceKind::Image => self.images += count,
        }
    }
}

/// Errors accumulated during a prune pass.
#[derive(Error, Debug)]
pub enum PruneError {
    /// A list call failed; matching resources of that kind were not
    /// planned this round.
    #[error("listing {kind}s: {source}")]
    List {
        kind: ResourceKind,
        source: RuntimeError,
    },

    /// A matching resource was created after the prune began and was
    /// excluded from the plan.
    #[error("{kind} {id} changed after prune start")]
    ChangeDetected { kind: ResourceKind, id: String },

    /// Removals left over after every retry.
    #[error("{kind} left {count} items")]
    Leftover { kind: ResourceKind, count: usize },
}

/// The identifiers selected for deletion in one prune pass.
#[derive(Debug, Default)]
struct ResourcePlan {
    containers: BTreeSet<String>,
    networks: BTreeSet<String>,
    volumes: BTreeSet<String>,
    images: BTreeSet<String>,
    /// List failures and change-detected entries recorded while planning.
    errors: Vec<PruneError>,
}

impl ResourcePlan {
    fn bucket(&mut self, kind: ResourceKind) -> &mut BTreeSet<String> {
        match kind {
            ResourceKind::Container => &mut self.containers,
            ResourceKind::Network => &mut self.networks,
            ResourceKind::Volume => &mut self.volumes,
            ResourceKind::Image => &mut self.images,
        }
    }

    fn take(&mut self, kind: ResourceKind) -> BTreeSet<String> {
        std::mem::take(self.bucket(kind))
    }

    fn changes_detected(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, PruneError::ChangeDetected { .. }))
    }
}

pub struct Pruner {
    runtime: Arc<dyn RuntimeClient>,
    request_timeout: Duration,
    remove_retries: u32,
    retry_offset: chrono::Duration,
    changes_retry_interval: Duration,
}

impl Pruner {
    pub fn new(runtime: Arc<dyn RuntimeClient>, config: &Config) -> Self {
        Self {
            runtime,
            request_timeout: config.request_timeout,
            remove_retries: config.remove_retries,
            retry_offset: config.retry_offset,
            changes_retry_interval: config.changes_retry_interval,
        }
    }

    /// Run one prune pass over the filter snapshot.
    ///
    /// The plan is recomputed while changes are detected; `deadline`
    /// bounds that loop when a shutdown forced the prune. Returns the
    /// per-kind removal counts and every error accumulated along the way.
    pub async fn run(
        &self,
        filters: &[Filter],
        deadline: Option<Instant>,
    ) -> (PruneSummary, Vec<PruneError>) {
        let mut plan = self.plan(filters).await;
        while plan.changes_detected() {
            if let Some(at) = deadline {
                if Instant::now() >= at {
                    warn!("shutdown deadline reached with changes outstanding, pruning anyway");
                    break;
                }
            }
            debug!(
                interval = ?self.changes_retry_interval,
                "resource changes detected, waiting before recomputing"
            );
            tokio::time::sleep(self.changes_retry_interval).await;
            plan = self.plan(filters).await;
        }

        let mut errors = std::mem::take(&mut plan.errors);
        let mut summary = PruneSummary::default();
        for kind in ResourceKind::DELETE_ORDER {
            let ids = plan.take(kind);
            let removed = self.remove_all(kind, ids, &mut errors).await;
            summary.record(kind, removed);
        }
        (summary, errors)
    }

    /// Compute the plan: everything matching the filters that existed
    /// before `now + retry_offset`.
    async fn plan(&self, filters: &[Filter]) -> ResourcePlan {
        let since = Utc::now() + self.retry_offset;
        let mut plan = ResourcePlan::default();

        for filter in filters {
            for kind in ResourceKind::DELETE_ORDER {
                let resources = match self.list(kind, filter).await {
                    Ok(resources) => resources,
                    Err(source) => {
                        warn!(%kind, "list failed: {source}");
                        plan.errors.push(PruneError::List { kind, source });
                        continue;
                    }
                };

                for resource in resources {
                    if is_reaper_owned(&resource) {
                        info!(id = %resource.id, "skipping reaper {kind}");
                        continue;
                    }
                    if let Some(created) = resource.created {
                        if created > since {
                            debug!(id = %resource.id, %created, "{kind} created after prune start");
                            plan.errors.push(PruneError::ChangeDetected {
                                kind,
                                id: resource.id,
                            });
                            continue;
                        }
                    }
                    plan.bucket(kind).insert(resource.id);
                }
            }
        }
        plan
    }

    async fn list(&self, kind: ResourceKind, filter: &Filter) -> Result<Vec<Resource>, RuntimeError> {
        match kind {
            ResourceKind::Container => {
                self.with_timeout(self.runtime.list_containers(filter)).await
            }
            ResourceKind::Network => self.with_timeout(self.runtime.list_networks(filter)).await,
            ResourceKind::Volume => {
                // The volume endpoint defaults to anonymous volumes only;
                // ask for all so named volumes matching the filter go too.
                // Applied to a clone, the stored filter stays untouched.
                let filter = filter.with("all", "true");
                self.with_timeout(self.runtime.list_volumes(&filter)).await
            }
            ResourceKind::Image => {
                // Without dangling=false only untagged leftovers would
                // be listed.
                let filter = filter.with("dangling", "false");
                self.with_timeout(self.runtime.list_images(&filter)).await
            }
        }
    }

    /// Delete every identifier of `kind`, retrying transient failures.
    async fn remove_all(
        &self,
        kind: ResourceKind,
        ids: BTreeSet<String>,
        errors: &mut Vec<PruneError>,
    ) -> u64 {
        if ids.is_empty() {
            return 0;
        }

        let mut todo = ids;
        let mut removed = 0u64;
        for attempt in 1..=self.remove_retries {
            let mut failed = BTreeSet::new();
            for id in &todo {
                match self.remove(kind, id).await {
                    Ok(count) => {
                        debug!(%id, "{kind} removed");
                        removed += count;
                    }
                    Err(RuntimeError::NotFound(_)) => {
                        debug!(%id, "{kind} already gone");
                    }
                    Err(e) => {
                        warn!(%id, attempt, "failed to remove {kind}: {e}");
                        failed.insert(id.clone());
                    }
                }
            }
            todo = failed;
            if todo.is_empty() {
                break;
            }
            if attempt < self.remove_retries {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }

        if !todo.is_empty() {
            errors.push(PruneError::Leftover {
                kind,
                count: todo.len(),
            });
        }
        removed
    }

    async fn remove(&self, kind: ResourceKind, id: &str) -> Result<u64, RuntimeError> {
        match kind {
            ResourceKind::Container => self
                .with_timeout(self.runtime.remove_container(id))
                .await
                .map(|()| 1),
            ResourceKind::Network => self
                .with_timeout(self.runtime.remove_network(id))
                .await
                .map(|()| 1),
            ResourceKind::Volume => self
                .with_timeout(self.runtime.remove_volume(id))
                .await
                .map(|()| 1),
            ResourceKind::Image => {
                let items = self.with_timeout(self.runtime.remove_image(id)).await?;
                Ok(count_image_deletes(&items))
            }
        }
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, RuntimeError>>,
    ) -> Result<T, RuntimeError> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(self.request_timeout)),
        }
    }
}

fn is_reaper_owned(resource: &Resource) -> bool {
    resource.labels.get(REAPER_LABEL).map(String::as_str) == Some(REAPER_LABEL_VALUE)
}

/// Count the distinct non-empty untagged tags and explicit deletions,
/// each exactly once.
fn count_image_deletes(items: &[ImageDeleteItem]) -> u64 {
    let mut seen = BTreeSet::new();
    for item in items {
        if let Some(tag) = item.untagged.as_deref() {
            if !tag.is_empty() {
                seen.insert(tag);
            }
        }
        if let Some(deleted) = item.deleted.as_deref() {
            if !deleted.is_empty() {
                seen.insert(deleted);
            }
        }
    }
    seen.len() as u64
}
