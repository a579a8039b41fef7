//! Local listener and the per-connection bridge into a pod tunnel.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::registry::{ConnectionGuard, SessionControl};
use super::ForwardError;
use crate::cluster::{self, Cluster, TunnelStream};

/// Back-off after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Where a session's connections are tunnelled to.
pub(crate) struct TunnelTarget {
    pub session: String,
    pub cluster: Arc<dyn Cluster>,
    pub namespace: String,
    pub pod: String,
    pub port: u16,
    pub timeout: Duration,
}

/// Bind the local side of a session.
pub(crate) async fn bind(address: IpAddr, port: u16) -> Result<TcpListener, ForwardError> {
    TcpListener::bind(SocketAddr::new(address, port))
        .await
        .map_err(|e| ForwardError::LocalBindFailed {
            port,
            reason: e.to_string(),
        })
}

/// Open a tunnel, failing with `TunnelSetupFailed` if it takes longer than
/// `timeout`.
pub(crate) async fn open_tunnel(
    cluster: &dyn Cluster,
    namespace: &str,
    pod: &str,
    port: u16,
    timeout: Duration,
) -> Result<TunnelStream, ForwardError> {
    let what = format!("opening tunnel to {namespace}/{pod}:{port}");
    cluster::bounded(timeout, &what, cluster.open_tunnel(namespace, pod, port)).await
}

/// Start the accept loop for a freshly registered session.
pub(crate) fn spawn_session(listener: TcpListener, target: TunnelTarget) -> SessionControl {
    let cancel = CancellationToken::new();
    let kill = CancellationToken::new();
    let tracker = TaskTracker::new();
    let connections = Arc::new(AtomicUsize::new(0));

    let accept = tokio::spawn(accept_loop(
        listener,
        Arc::new(target),
        cancel.clone(),
        kill.clone(),
        tracker.clone(),
        connections.clone(),
    ));

    SessionControl {
        cancel,
        kill,
        tracker,
        accept: Some(accept),
        connections,
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: Arc<TunnelTarget>,
    cancel: CancellationToken,
    kill: CancellationToken,
    tracker: TaskTracker,
    connections: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(session = %target.session, %peer, "accepted connection");
                    let guard = ConnectionGuard::new(&connections);
                    tracker.spawn(bridge_connection(
                        stream,
                        peer,
                        target.clone(),
                        cancel.clone(),
                        kill.clone(),
                        guard,
                    ));
                }
                Err(e) => {
                    tracing::warn!(session = %target.session, error = %e, "accept failed");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            },
        }
    }
    drop(listener);
    tracing::debug!(session = %target.session, "listener closed");
}

async fn bridge_connection(
    mut local: TcpStream,
    peer: SocketAddr,
    target: Arc<TunnelTarget>,
    cancel: CancellationToken,
    kill: CancellationToken,
    _guard: ConnectionGuard,
) {
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::debug!(session = %target.session, %peer, "session stopping, tunnel negotiation aborted");
            return;
        }
        opened = open_tunnel(
            target.cluster.as_ref(),
            &target.namespace,
            &target.pod,
            target.port,
            target.timeout,
        ) => opened,
    };

    let tunnel = match opened {
        Ok(tunnel) => tunnel,
        Err(e) => {
            tracing::warn!(
                session = %target.session,
                %peer,
                pod = %target.pod,
                port = target.port,
                error = %e,
                "failed to open tunnel"
            );
            return;
        }
    };

    // Whichever direction finishes first (EOF or error) ends the bridge and
    // drops both streams. Pod tunnels have no half-close.
    let (mut local_read, mut local_write) = local.split();
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);

    tokio::select! {
        () = kill.cancelled() => {
            tracing::debug!(session = %target.session, %peer, "connection force-closed");
        }
        result = tokio::io::copy(&mut local_read, &mut tunnel_write) => match result {
            Ok(sent) => {
                tracing::debug!(session = %target.session, %peer, sent, "client closed connection");
            }
            Err(e) => {
                tracing::debug!(session = %target.session, %peer, error = %e, "client connection failed");
            }
        },
        result = tokio::io::copy(&mut tunnel_read, &mut local_write) => match result {
            Ok(received) => {
                tracing::debug!(session = %target.session, %peer, received, "tunnel closed");
            }
            Err(e) => {
                tracing::warn!(
                    session = %target.session,
                    %peer,
                    pod = %target.pod,
                    port = target.port,
                    error = %e,
                    "tunnel failed"
                );
            }
        },
    }
}
