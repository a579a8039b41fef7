//! The slice of the cluster API the port-forward manager depends on.
//!
//! [`ForwardManager`](crate::forward::ForwardManager) only ever talks to the
//! cluster through the [`Cluster`] trait. [`KubeCluster`] talks to a real
//! API server; [`MemoryCluster`] is an in-process stand-in.

pub mod kubernetes;
pub mod memory;

pub use self::kubernetes::KubeCluster;
pub use self::memory::{MemoryCluster, MemoryPod};

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::forward::ForwardError;

/// Byte stream to a port inside a pod.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// A pod selected by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodCandidate {
    pub name: String,
    /// Running with a `Ready=True` condition.
    pub ready: bool,
    /// Named container ports, used to resolve named service target ports.
    pub named_ports: Vec<(String, u16)>,
}

/// Where a service port sends traffic on its pods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPortRef {
    Number(u16),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePortMapping {
    pub port: u16,
    pub target: Option<TargetPortRef>,
}

/// A service together with the pods its selector currently matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceBackends {
    pub ports: Vec<ServicePortMapping>,
    pub pods: Vec<PodCandidate>,
}

#[async_trait::async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// Namespace used when the caller does not name one.
    fn default_namespace(&self) -> &str;

    /// Look up a service and the pods matching its selector.
    ///
    /// Fails with `ServiceNotFound` when the service does not exist.
    async fn service_backends(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<ServiceBackends, ForwardError>;

    /// Open a stream to `port` inside `pod`.
    ///
    /// Fails with `PodNotFound`, `PodNotReady`, `ConnectionRefused` or
    /// `TunnelSetupFailed`. Dropping the returned future aborts negotiation.
    async fn open_tunnel(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<TunnelStream, ForwardError>;

    /// Check that a tunnel to `port` inside `pod` can be opened, then close it.
    ///
    /// Used by the start-time preflight. Backends that only learn about
    /// remote failures after the stream is up should wait for them here.
    async fn check_tunnel(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ForwardError> {
        let what = format!("opening tunnel to {namespace}/{pod}:{port}");
        bounded(timeout, &what, self.open_tunnel(namespace, pod, port))
            .await
            .map(drop)
    }
}

/// Run a cluster call, failing with `TunnelSetupFailed` if it takes longer
/// than `limit`.
pub async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> Result<T, ForwardError>
where
    F: Future<Output = Result<T, ForwardError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ForwardError::TunnelSetupFailed(format!(
            "timed out after {}ms {what}",
            limit.as_millis()
        ))),
    }
}
