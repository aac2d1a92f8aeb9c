//! ryuk, a resource reaper for a local container runtime.
//!
//! Co-launched with an integration-test session. Test harnesses connect
//! over TCP and register URL-encoded resource filters; once the session
//! ends (every client gone and the reconnection window elapsed, or a
//! shutdown signal forcing the issue) all matching containers, networks,
//! volumes and images are removed with bounded retries and best-effort
//! error aggregation.
//!
//! The library half exists so integration tests can drive a full reaper
//! against a mock runtime over real sockets; the binary wires it to
//! Docker.

pub mod config;
pub mod controller;
pub mod net;
pub mod pruner;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ryuk_core::filter::FilterStore;
use ryuk_core::runtime::RuntimeClient;

use crate::config::Config;
use crate::controller::{Controller, Outcome};
use crate::pruner::{PruneError, PruneSummary, Pruner};

/// Result of a completed reaper run.
///
/// `errors` holds the best-effort leftovers; they are reported, not fatal.
#[derive(Debug)]
pub struct PruneReport {
    pub removed: PruneSummary,
    pub errors: Vec<PruneError>,
}

/// A bound reaper, ready to serve clients and prune at session end.
pub struct Reaper {
    config: Config,
    runtime: Arc<dyn RuntimeClient>,
    store: Arc<FilterStore>,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Reaper {
    /// Bind the client listener.
    ///
    /// Port 0 requests an OS-assigned port; the actual address is
    /// available through [`local_addr`](Self::local_addr).
    pub async fn bind(
        config: Config,
        runtime: Arc<dyn RuntimeClient>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| format!("failed to bind port {}", config.port))?;
        let local_addr = listener
            .local_addr()
            .context("listener has no local address")?;
        info!(addr = %local_addr, "listening for filter clients");

        Ok(Self {
            config,
            runtime,
            store: Arc::new(FilterStore::new()),
            listener,
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle to the filter store.
    pub fn filter_store(&self) -> Arc<FilterStore> {
        self.store.clone()
    }

    /// Serve clients until the lifecycle controller decides to prune,
    /// then prune and return the report.
    ///
    /// Only the abnormal paths fail: nobody connecting within the
    /// connection timeout. Prune leftovers are part of the report.
    pub async fn run(self) -> anyhow::Result<PruneReport> {
        let (connect_tx, connect_rx) = mpsc::channel(1);
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();

        // The listener closes on an OS signal (child of the signal token)
        // or when pruning begins. Accepted sessions are not severed by the
        // signal: they live through the shutdown grace period and only
        // drop once pruning starts.
        let listener_shutdown = self.shutdown.child_token();
        let session_shutdown = CancellationToken::new();
        let acceptor = tokio::spawn(net::serve(
            self.listener,
            self.store.clone(),
            connect_tx,
            disconnect_tx,
            listener_shutdown.clone(),
            session_shutdown.clone(),
        ));

        let controller = Controller::new(
            &self.config,
            connect_rx,
            disconnect_rx,
            self.shutdown.clone(),
        );
        let outcome = controller.run().await;

        listener_shutdown.cancel();
        session_shutdown.cancel();
        let _ = acceptor.await;

        match outcome {
            Outcome::FirstConnectionTimeout => {
                anyhow::bail!(
                    "no first connection within {:?}",
                    self.config.connection_timeout
                )
            }
            Outcome::Prune { deadline } => {
                let filters = self.store.snapshot().await;
                info!(filters = filters.len(), "pruning");

                let pruner = Pruner::new(self.runtime.clone(), &self.config);
                let (removed, errors) = pruner.run(&filters, deadline).await;

                info!(
                    containers = removed.containers,
                    networks = removed.networks,
                    volumes = removed.volumes,
                    images = removed.images,
                    "removed"
                );
                for error in &errors {
                    warn!("prune: {error}");
                }

                Ok(PruneReport { removed, errors })
            }
        }
    }
}
