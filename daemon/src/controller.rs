//! Lifecycle controller: decides when the reaper stops accepting filters
//! and starts pruning.
//!
//! A single task owns the state machine and suspends only in one
//! `tokio::select!` over connect requests, disconnect events, the shutdown
//! signal and a single timer slot. The timer carries the first-connection
//! deadline initially, the reconnection deadline whenever the last client
//! leaves, and the prune-check deadline once a shutdown signal arrives.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::net::{ConnectRequest, Verdict};

/// Why the controller stopped accepting clients.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Run the prune pass. `deadline` is the forced-prune instant when a
    /// shutdown signal started the transition; change-detected waiting
    /// must not outlive it.
    Prune { deadline: Option<Instant> },
    /// No client ever connected within the connection timeout.
    FirstConnectionTimeout,
}

/// Controller phase. `Active` keeps no timer; every other phase has a
/// deadline armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the very first client.
    WaitingFirst,
    /// At least one client is connected.
    Active,
    /// All clients left; the reconnection window is running.
    Idle,
    /// A shutdown signal arrived; new clients are rejected until the
    /// prune-check deadline fires.
    Shutdown,
}

pub struct Controller {
    connection_timeout: Duration,
    reconnection_timeout: Duration,
    shutdown_timeout: Duration,
    connects: mpsc::Receiver<ConnectRequest>,
    disconnects: mpsc::UnboundedReceiver<SocketAddr>,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(
        config: &Config,
        connects: mpsc::Receiver<ConnectRequest>,
        disconnects: mpsc::UnboundedReceiver<SocketAddr>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connection_timeout: config.connection_timeout,
            reconnection_timeout: config.reconnection_timeout,
            shutdown_timeout: config.shutdown_timeout,
            connects,
            disconnects,
            shutdown,
        }
    }

    /// Drive the state machine to its decision.
    ///
    /// The live-client counter is incremented before the accept verdict is
    /// sent back, so a client can never be observed disconnecting before
    /// it was counted as connected.
    pub async fn run(self) -> Outcome {
        let Self {
            connection_timeout,
            reconnection_timeout,
            shutdown_timeout,
            mut connects,
            mut disconnects,
            shutdown,
        } = self;

        let mut phase = Phase::WaitingFirst;
        let mut clients: usize = 0;
        let mut deadline = Some(Instant::now() + connection_timeout);
        let mut prune_deadline: Option<Instant> = None;

        loop {
            let sleep_at = deadline;
            let timer = async move {
                match sleep_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                Some(ConnectRequest { addr, verdict }) = connects.recv() => {
                    if phase == Phase::Shutdown {
                        let _ = verdict.send(Verdict::Reject);
                        debug!(peer = %addr, "rejected connection in shutdown");
                        continue;
                    }
                    clients += 1;
                    phase = Phase::Active;
                    deadline = None;
                    let _ = verdict.send(Verdict::Accept);
                    debug!(peer = %addr, clients, "connection registered");
                }

                Some(addr) = disconnects.recv() => {
                    if clients == 0 {
                        warn!(peer = %addr, "disconnect event with no live clients");
                        continue;
                    }
                    clients -= 1;
                    debug!(peer = %addr, clients, "connection dropped");
                    if clients == 0 && phase == Phase::Active {
                        phase = Phase::Idle;
                        deadline = Some(Instant::now() + reconnection_timeout);
                        debug!(
                            window = ?reconnection_timeout,
                            "last client left, waiting for reconnection"
                        );
                    }
                }

                _ = shutdown.cancelled(), if phase != Phase::Shutdown => {
                    let now = Instant::now();
                    let forced = now + shutdown_timeout;
                    prune_deadline = Some(forced);
                    // Prune right away when nobody is connected, otherwise
                    // grant the grace period.
                    deadline = Some(if clients == 0 { now } else { forced });
                    phase = Phase::Shutdown;
                    info!(clients, "shutdown signal received");
                }

                _ = timer => {
                    match phase {
                        Phase::WaitingFirst => {
                            return Outcome::FirstConnectionTimeout;
                        }
                        Phase::Idle => {
                            info!("reconnection window elapsed");
                            return Outcome::Prune { deadline: None };
                        }
                        Phase::Shutdown => {
                            if clients > 0 {
                                warn!(clients, "forcing prune with clients still connected");
                            }
                            return Outcome::Prune { deadline: prune_deadline };
                        }
                        // No timer is armed while clients are connected.
                        Phase::Active => deadline = None,
                    }
                }
            }
        }
    }
}
