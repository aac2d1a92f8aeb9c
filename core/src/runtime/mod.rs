//! Container-runtime client abstraction.
//!
//! The reaper consumes a narrow capability set: ping plus list/remove for
//! containers, networks, volumes and images. [`RuntimeClient`] is the seam
//! between the pruner and the concrete runtime; the `docker` feature
//! provides the bollard-backed implementation and the `mock` feature an
//! in-memory double for tests.

#[cfg(feature = "docker")]
pub mod docker;
#[cfg(feature = "mock")]
pub mod mock;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::errors::RuntimeError;
use crate::filter::Filter;

/// Label identifying containers owned by a reaper instance.
pub const REAPER_LABEL: &str = "org.testcontainers.ryuk";

/// Value of [`REAPER_LABEL`] marking a resource as reaper-owned.
pub const REAPER_LABEL_VALUE: &str = "true";

/// The four resource kinds the reaper manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Container,
    Network,
    Volume,
    Image,
}

impl ResourceKind {
    /// All kinds in the order deletions must be applied: containers first
    /// (networks and volumes attached to a running container cannot be
    /// removed), images last.
    pub const DELETE_ORDER: [ResourceKind; 4] = [
        ResourceKind::Container,
        ResourceKind::Network,
        ResourceKind::Volume,
        ResourceKind::Image,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Container => "container",
            ResourceKind::Network => "network",
            ResourceKind::Volume => "volume",
            ResourceKind::Image => "image",
        };
        f.write_str(name)
    }
}

/// A listed runtime resource, normalized across kinds.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Runtime identifier: id for containers, networks and images, name
    /// for volumes.
    pub id: String,
    /// Creation time, when the runtime reports one.
    pub created: Option<DateTime<Utc>>,
    /// Resource labels.
    pub labels: HashMap<String, String>,
}

/// One entry of an image-remove response.
#[derive(Debug, Clone, Default)]
pub struct ImageDeleteItem {
    /// A tag that was untagged by the removal.
    pub untagged: Option<String>,
    /// An image that was deleted outright.
    pub deleted: Option<String>,
}

/// Capability set the reaper needs from a container runtime.
///
/// Implementations are assumed safe for concurrent calls; the pruner
/// itself issues them sequentially.
#[async_trait::async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Liveness check. Failure is fatal at startup.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// List containers matching `filter`, including stopped ones.
    async fn list_containers(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError>;

    /// Remove a container, force-killing it and dropping its anonymous
    /// volumes.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn list_networks(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError>;

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError>;

    async fn list_volumes(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError>;

    /// Remove a volume, forced.
    async fn remove_volume(&self, id: &str) -> Result<(), RuntimeError>;

    async fn list_images(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError>;

    /// Remove an image together with its untagged parents.
    ///
    /// Returns the delete entries reported by the runtime so the caller
    /// can count what actually went away.
    async fn remove_image(&self, id: &str) -> Result<Vec<ImageDeleteItem>, RuntimeError>;
}
