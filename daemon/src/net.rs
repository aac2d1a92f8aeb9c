//! TCP session manager: the acceptor and the per-connection protocol loop.
//!
//! Clients connect, send newline-delimited URL-encoded filter lines and
//! receive `ACK\n` for each. Accept and disconnect bookkeeping is reported
//! to the lifecycle controller; the `connected` handoff is synchronous
//! (the acceptor waits for the controller's verdict before reading any
//! bytes), so the controller's counter is incremented before the client
//! could possibly disconnect.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ryuk_core::filter::FilterStore;

/// Reply sent after every non-empty filter line.
const ACK: &[u8] = b"ACK\n";

/// Controller verdict for a freshly accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Serve the client.
    Accept,
    /// Shutdown in progress: close without ACK so the client reconnects
    /// to a freshly launched reaper instead.
    Reject,
}

/// Connection notification, answered synchronously by the controller.
#[derive(Debug)]
pub struct ConnectRequest {
    pub addr: SocketAddr,
    pub verdict: oneshot::Sender<Verdict>,
}

/// Run the accept loop until `shutdown` is cancelled.
///
/// Every accepted socket is announced to the controller and only served
/// after an explicit [`Verdict::Accept`]. `shutdown` only closes the
/// listener; accepted sessions keep running (a signalled reaper still
/// serves connected clients through the grace period) and are torn down
/// by `sessions`, cancelled once pruning begins.
pub async fn serve(
    listener: TcpListener,
    store: Arc<FilterStore>,
    connects: mpsc::Sender<ConnectRequest>,
    disconnects: mpsc::UnboundedSender<SocketAddr>,
    shutdown: CancellationToken,
    sessions: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("closing listener");
                break;
            }

            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };

                let (verdict_tx, verdict_rx) = oneshot::channel();
                let request = ConnectRequest { addr, verdict: verdict_tx };
                if connects.send(request).await.is_err() {
                    warn!(peer = %addr, "rejecting connection, controller is gone");
                    continue;
                }

                match verdict_rx.await {
                    Ok(Verdict::Accept) => {
                        info!(peer = %addr, "client connected");
                        let store = store.clone();
                        let disconnects = disconnects.clone();
                        let session_shutdown = sessions.child_token();
                        tokio::spawn(handle_client(
                            stream,
                            addr,
                            store,
                            disconnects,
                            session_shutdown,
                        ));
                    }
                    Ok(Verdict::Reject) | Err(_) => {
                        warn!(peer = %addr, "rejecting connection during shutdown");
                    }
                }
            }
        }
    }
}

/// Per-connection read loop.
///
/// Emits the disconnect event only after the socket has been dropped.
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    store: Arc<FilterStore>,
    disconnects: mpsc::UnboundedSender<SocketAddr>,
    shutdown: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();

        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(peer = %addr, "dropping client, prune is starting");
                break;
            }

            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => {
                        debug!(peer = %addr, "client closed the connection");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            warn!(peer = %addr, "ignoring empty filter line");
                            continue;
                        }
                        match store.add(trimmed).await {
                            Ok(true) => debug!(peer = %addr, filter = %trimmed, "filter registered"),
                            Ok(false) => debug!(peer = %addr, filter = %trimmed, "filter already registered"),
                            Err(e) => warn!(peer = %addr, "bad filter line: {e}"),
                        }
                        // ACK regardless; parse failures are a server-side log only.
                        if let Err(e) = write_half.write_all(ACK).await {
                            warn!(peer = %addr, "failed to ack: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(peer = %addr, "read error: {e}");
                        break;
                    }
                }
            }
        }
    }

    drop(reader);
    drop(write_half);
    info!(peer = %addr, "client disconnected");
    let _ = disconnects.send(addr);
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio::time::{timeout, Duration};

    struct Fixture {
        addr: SocketAddr,
        store: Arc<FilterStore>,
        disconnects: mpsc::UnboundedReceiver<SocketAddr>,
        shutdown: CancellationToken,
        sessions: CancellationToken,
    }

    /// Start a listener whose controller stand-in answers every connect
    /// with `verdict`.
    async fn start(verdict: Verdict) -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(FilterStore::new());
        let (connect_tx, mut connect_rx) = mpsc::channel::<ConnectRequest>(1);
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let sessions = CancellationToken::new();

        tokio::spawn(serve(
            listener,
            store.clone(),
            connect_tx,
            disconnect_tx,
            shutdown.clone(),
            sessions.clone(),
        ));
        tokio::spawn(async move {
            while let Some(request) = connect_rx.recv().await {
                let _ = request.verdict.send(verdict);
            }
        });

        Fixture {
            addr,
            store,
            disconnects: disconnect_rx,
            shutdown,
            sessions,
        }
    }

    async fn read_ack(stream: &mut TcpStream) {
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("timed out waiting for ack")
            .unwrap();
        assert_eq!(&buf, b"ACK\n");
    }

    #[tokio::test]
    async fn acks_filter_lines_and_reports_disconnect() {
        let mut fixture = start(Verdict::Accept).await;

        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        stream.write_all(b"label=k=v\n").await.unwrap();
        read_ack(&mut stream).await;
        drop(stream);

        let peer = timeout(Duration::from_secs(5), fixture.disconnects.recv())
            .await
            .expect("timed out waiting for disconnect")
            .unwrap();
        assert_eq!(fixture.store.len().await, 1);
        assert!(peer.ip().is_loopback());
        fixture.shutdown.cancel();
    }

    #[tokio::test]
    async fn acks_malformed_lines_without_storing() {
        let fixture = start(Verdict::Accept).await;

        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        stream.write_all(b"not a query string\n").await.unwrap();
        read_ack(&mut stream).await;

        assert!(fixture.store.is_empty().await);
        fixture.shutdown.cancel();
    }

    #[tokio::test]
    async fn empty_lines_are_skipped_without_ack() {
        let fixture = start(Verdict::Accept).await;

        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        stream.write_all(b"\nlabel=a\n").await.unwrap();
        // Exactly one ACK arrives, for the non-empty line.
        read_ack(&mut stream).await;

        assert_eq!(fixture.store.len().await, 1);
        fixture.shutdown.cancel();
    }

    #[tokio::test]
    async fn sessions_survive_listener_shutdown() {
        let fixture = start(Verdict::Accept).await;

        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        stream.write_all(b"label=a\n").await.unwrap();
        read_ack(&mut stream).await;

        // Closing the listener leaves accepted sessions running.
        fixture.shutdown.cancel();
        stream.write_all(b"label=b\n").await.unwrap();
        read_ack(&mut stream).await;
        assert_eq!(fixture.store.len().await, 2);

        // Only the session token drops them.
        fixture.sessions.cancel();
        let mut buf = [0u8; 4];
        let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("timed out waiting for the session to close");
        assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");
    }

    #[tokio::test]
    async fn rejected_connection_is_closed_without_ack() {
        let fixture = start(Verdict::Reject).await;

        let mut stream = TcpStream::connect(fixture.addr).await.unwrap();
        let _ = stream.write_all(b"label=a\n").await;

        let mut buf = [0u8; 4];
        let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("timed out waiting for close");
        assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");
        fixture.shutdown.cancel();
    }
}
