#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kpf::cluster::{MemoryCluster, MemoryPod};
use kpf::forward::{ForwardManager, ForwardOptions, StartRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const NAMESPACE: &str = "default";

/// How long tests wait for asynchronous state (connection counts) to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A manager backed by an in-memory cluster the test can keep mutating.
pub struct TestForwarder {
    pub cluster: Arc<MemoryCluster>,
    pub manager: ForwardManager,
}

/// Short timeouts so drain and timeout paths finish quickly.
pub fn test_options() -> ForwardOptions {
    ForwardOptions {
        tunnel_timeout: Duration::from_millis(500),
        drain_grace: Duration::from_millis(200),
        ..ForwardOptions::default()
    }
}

/// Cluster with a single running pod `nginx` in the default namespace.
pub fn create_forwarder() -> TestForwarder {
    create_forwarder_with(test_options())
}

pub fn create_forwarder_with(options: ForwardOptions) -> TestForwarder {
    let cluster = Arc::new(MemoryCluster::new(NAMESPACE));
    cluster.add_pod(NAMESPACE, MemoryPod::running("nginx"));
    let manager = ForwardManager::new(cluster.clone(), options);
    TestForwarder { cluster, manager }
}

/// Find a currently free local port.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn is_port_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

pub fn request(target: &str, local: u16, remote: u16) -> StartRequest {
    StartRequest::parse(target, &format!("{local}:{remote}"), None).unwrap()
}

/// Connect to a forwarded port and check the tunnel echoes `payload`.
pub async fn connect_and_echo(port: u16, payload: &[u8]) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert_echo(&mut stream, payload).await;
    stream
}

pub async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(SETTLE_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

/// Wait until the session reports `expected` open connections.
pub async fn wait_for_connections(manager: &ForwardManager, id: &str, expected: usize) {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let current = manager
            .list()
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.connections);
        if current == Some(expected) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("session {id} has {current:?} connections, expected {expected}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Read until the peer closes; a reset counts as closed.
pub async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(SETTLE_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("connection was not closed");
    assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");
}
