//! Docker implementation of [`RuntimeClient`].
//!
//! Uses the [`bollard`] crate for async Docker API access. Listing and
//! removal map the Docker models onto the kind-agnostic [`Resource`]
//! shape; creation timestamps are normalized to UTC (unix seconds for
//! containers and images, RFC 3339 strings for networks and volumes).

use bollard::container::{ListContainersOptions, RemoveContainerOptions};
use bollard::image::{ListImagesOptions, RemoveImageOptions};
use bollard::network::ListNetworksOptions;
use bollard::volume::{ListVolumesOptions, RemoveVolumeOptions};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::RuntimeError;
use crate::filter::Filter;

use super::{ImageDeleteItem, Resource, RuntimeClient};

/// Docker-backed runtime client.
pub struct DockerRuntime {
    client: bollard::Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and negotiate the API version.
    ///
    /// Negotiation failures are tolerated: the client falls back to its
    /// default version and the failure is logged at debug level.
    pub async fn connect() -> Result<Self, RuntimeError> {
        let client = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Api(format!("failed to connect to Docker daemon: {e}")))?;

        let client = match client.clone().negotiate_version().await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                debug!("API version negotiation failed, keeping default: {e}");
                client
            }
        };

        Ok(Self { client })
    }
}

/// Map a bollard error onto [`RuntimeError`], turning HTTP 404 into the
/// not-found sentinel.
fn map_err(err: bollard::errors::Error, what: &str) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(what.to_string()),
        other => RuntimeError::Api(other.to_string()),
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait::async_trait]
impl RuntimeClient for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_err(e, "ping"))
    }

    async fn list_containers(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError> {
        // Include stopped containers: test containers may have exited
        // before cleanup.
        let options = ListContainersOptions::<String> {
            all: true,
            filters: filter.to_args(),
            ..Default::default()
        };
        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| map_err(e, "container list"))?;

        Ok(summaries
            .into_iter()
            .map(|summary| Resource {
                id: summary.id.unwrap_or_default(),
                created: summary
                    .created
                    .and_then(|secs| DateTime::from_timestamp(secs, 0)),
                labels: summary.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err(e, id))
    }

    async fn list_networks(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError> {
        let options = ListNetworksOptions {
            filters: filter.to_args(),
        };
        let networks = self
            .client
            .list_networks(Some(options))
            .await
            .map_err(|e| map_err(e, "network list"))?;

        Ok(networks
            .into_iter()
            .map(|network| Resource {
                id: network.id.unwrap_or_default(),
                created: parse_timestamp(network.created.as_deref()),
                labels: network.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .remove_network(id)
            .await
            .map_err(|e| map_err(e, id))
    }

    async fn list_volumes(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError> {
        let options = ListVolumesOptions {
            filters: filter.to_args(),
        };
        let response = self
            .client
            .list_volumes(Some(options))
            .await
            .map_err(|e| map_err(e, "volume list"))?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| Resource {
                id: volume.name,
                created: parse_timestamp(volume.created_at.as_deref()),
                labels: volume.labels,
            })
            .collect())
    }

    async fn remove_volume(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveVolumeOptions { force: true };
        self.client
            .remove_volume(id, Some(options))
            .await
            .map_err(|e| map_err(e, id))
    }

    async fn list_images(&self, filter: &Filter) -> Result<Vec<Resource>, RuntimeError> {
        let options = ListImagesOptions::<String> {
            filters: filter.to_args(),
            ..Default::default()
        };
        let summaries = self
            .client
            .list_images(Some(options))
            .await
            .map_err(|e| map_err(e, "image list"))?;

        Ok(summaries
            .into_iter()
            .map(|summary| Resource {
                id: summary.id,
                created: DateTime::from_timestamp(summary.created, 0),
                labels: summary.labels,
            })
            .collect())
    }

    async fn remove_image(&self, id: &str) -> Result<Vec<ImageDeleteItem>, RuntimeError> {
        // noprune: false asks the daemon to also delete untagged parents.
        let options = RemoveImageOptions {
            force: false,
            noprune: false,
        };
        let items = self
            .client
            .remove_image(id, Some(options), None)
            .await
            .map_err(|e| map_err(e, id))?;

        Ok(items
            .into_iter()
            .map(|item| ImageDeleteItem {
                untagged: item.untagged,
                deleted: item.deleted,
            })
            .collect())
    }
}
