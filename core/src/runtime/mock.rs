//! In-memory [`RuntimeClient`] double for tests.
//!
//! Resources are registered per kind; list calls apply the `label` values
//! of the filter the way the real runtime does, and every call is
//! recorded so tests can assert ordering and filter payloads. Failures
//! are scripted per identifier and consumed in order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::errors::RuntimeError;
use crate::filter::Filter;

use super::{ImageDeleteItem, Resource, ResourceKind, RuntimeClient};

#[derive(Default)]
pub struct MockRuntime {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<ResourceKind, Vec<Resource>>,
    list_errors: HashMap<ResourceKind, VecDeque<RuntimeError>>,
    remove_errors: HashMap<(ResourceKind, String), VecDeque<RuntimeError>>,
    image_deletes: HashMap<String, Vec<ImageDeleteItem>>,
    list_calls: Vec<(ResourceKind, String)>,
    remove_calls: Vec<(ResourceKind, String)>,
    removed: Vec<(ResourceKind, String)>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource under `kind`.
    pub fn add(&self, kind: ResourceKind, resource: Resource) {
        self.locked().resources.entry(kind).or_default().push(resource);
    }

    /// Script the next list call for `kind` to fail. Repeated calls queue.
    pub fn script_list_error(&self, kind: ResourceKind, error: RuntimeError) {
        self.locked().list_errors.entry(kind).or_default().push_back(error);
    }

    /// Script the next remove call for `id` to fail. Repeated calls queue.
    pub fn script_remove_error(&self, kind: ResourceKind, id: &str, error: RuntimeError) {
        self.locked()
            .remove_errors
            .entry((kind, id.to_string()))
            .or_default()
            .push_back(error);
    }

    /// Script the delete entries returned when image `id` is removed.
    ///
    /// Unscripted image removals answer with a single `deleted` entry.
    pub fn script_image_delete(&self, id: &str, items: Vec<ImageDeleteItem>) {
        self.locked().image_deletes.insert(id.to_string(), items);
    }

    /// Every list call in order, with the canonical filter payload.
    pub fn list_calls(&self) -> Vec<(ResourceKind, String)> {
        self.locked().list_calls.clone()
    }

    /// Every remove attempt in order, including failed ones.
    pub fn remove_calls(&self) -> Vec<(ResourceKind, String)> {
        self.locked().remove_calls.clone()
    }

    /// Successfully removed resources in order.
    pub fn removed(&self) -> Vec<(ResourceKind, String)> {
        self.locked().removed.clone()
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("mock runtime state poisoned")
    }

    fn list(&self, kind: ResourceKind, filter: &Filter) -> Result<Vec<Resource>, RuntimeError> {
        let mut inner = self.locked();
        inner.list_calls.push((kind, filter.canonical()));
        if let Some(error) = inner.list_errors.get_mut(&kind).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(inner
            .resources
            .get(&kind)
            .map(|all| {
                all.iter()
                    .filter(|resource| matches_filter(resource, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove(&self, kind: ResourceKind, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.locked();
        inner.remove_calls.push((kind, id.to_string()));
        if let Some(error) = inner
            .remove_errors
            .get_mut(&(kind, id.to_string()))
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        let position = inner
            .resources
            .get(&kind)
            .and_then(|all| all.iter().position(|resource| resource.id == id));
        match position {
            Some(index) => {
                if let Some(all) = inner.resources.get_mut(&kind) {
                    all.remove(index);
                }
                inner.removed.push((kind, id.to_string()));
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }
}

/// Apply the `label` values of `filter` the way the runtime does: every
/// `k=v` pair must match a resource label, a bare `k` only requires the
/// key. Other filter keys are accepted unconditionally.
fn matches_filter(resource: &Resource, filter: &Filter) -> bool {
    let Some(labels) = filter.get("label") else {
        return true;
    };
    labels.iter().all(|pair| match pair.split_once('=') {
        Some((key, value)) => resource.labels.get(key).map(String::as_str) == Some(value),
        None => resource.labels.contains_key(pair.as_str()),
    })
}

#[async_trait::async_trait]
impl RuntimeClient for MockRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn list_containers(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError> {
        self.list(ResourceKind::Container, filter)
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.remove(ResourceKind::Container, id)
    }

    async fn list_networks(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError> {
        self.list(ResourceKind::Network, filter)
    }

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        self.remove(ResourceKind::Network, id)
    }

    async fn list_volumes(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError> {
        self.list(ResourceKind::Volume, filter)
    }

    async fn remove_volume(&self, id: &str) -> Result<(), RuntimeError> {
        self.remove(ResourceKind::Volume, id)
    }

    async fn list_images(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError> {
        self.list(ResourceKind::Image, filter)
    }

    async fn remove_image(&self, id: &str) -> Result<Vec<ImageDeleteItem>, RuntimeError> {
        self.remove(ResourceKind::Image, id)?;
        let scripted = self.locked().image_deletes.remove(id);
        Ok(scripted.unwrap_or_else(|| {
            vec![ImageDeleteItem {
                untagged: None,
                deleted: Some(id.to_string()),
            }]
        }))
    }
}
