//! [`Cluster`] backed by the Kubernetes API via `kube`.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, Portforwarder};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{
    bounded, Cluster, PodCandidate, ServiceBackends, ServicePortMapping, TargetPortRef, TunnelIo,
    TunnelStream,
};
use crate::forward::ForwardError;

/// How long the preflight waits for the remote side to report a failure
/// after the stream is up.
const PREFLIGHT_ERROR_WINDOW: Duration = Duration::from_millis(300);

/// Errors building a client from kubeconfig or in-cluster config.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("could not infer cluster config: {0}")]
    Infer(#[from] kube::config::InferConfigError),

    #[error("kube client error: {0}")]
    Client(#[from] kube::Error),
}

pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    /// Build a client for `context` (or the current context / in-cluster
    /// config when `None`). `namespace` overrides the context's default.
    pub async fn connect(
        context: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<Self, ConnectError> {
        let config = match context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.to_string()),
                    ..Default::default()
                };
                Config::from_kubeconfig(&options).await?
            }
            None => Config::infer().await?,
        };
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| config.default_namespace.clone());
        let client = Client::try_from(config)?;
        tracing::debug!(%namespace, "connected to cluster");
        Ok(Self { client, namespace })
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    fn default_namespace(&self) -> &str {
        &self.namespace
    }

    async fn service_backends(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<ServiceBackends, ForwardError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let found = services
            .get_opt(service)
            .await
            .map_err(|e| ForwardError::Cluster(e.to_string()))?
            .ok_or_else(|| ForwardError::ServiceNotFound {
                namespace: namespace.to_string(),
                name: service.to_string(),
            })?;

        let spec = found.spec.unwrap_or_default();
        let ports = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| {
                let port = u16::try_from(p.port).ok()?;
                let target = p.target_port.and_then(|t| match t {
                    IntOrString::Int(n) => u16::try_from(n).ok().map(TargetPortRef::Number),
                    IntOrString::String(name) => Some(TargetPortRef::Name(name)),
                });
                Some(ServicePortMapping { port, target })
            })
            .collect();

        // A selector-less service is backed by manually managed endpoints,
        // which port-forward cannot reach.
        let selector = spec.selector.unwrap_or_default();
        if selector.is_empty() {
            return Ok(ServiceBackends {
                ports,
                pods: Vec::new(),
            });
        }

        let labels = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&labels))
            .await
            .map_err(|e| ForwardError::Cluster(e.to_string()))?;

        Ok(ServiceBackends {
            ports,
            pods: list.items.iter().filter_map(pod_candidate).collect(),
        })
    }

    async fn open_tunnel(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<TunnelStream, ForwardError> {
        let Forwarded {
            forwarder,
            stream,
            errors,
        } = self.forward(namespace, pod, port).await?;

        Ok(Box::new(KubeTunnel {
            stream: ReportingStream::new(stream, errors, pod, port),
            forwarder,
        }))
    }

    async fn check_tunnel(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ForwardError> {
        let what = format!("opening tunnel to {namespace}/{pod}:{port}");
        let mut forwarded = bounded(timeout, &what, self.forward(namespace, pod, port)).await?;

        // The kubelet dials the pod port as soon as the stream is up and
        // reports a refusal on the error channel, not through `portforward`.
        let early = match forwarded.errors.as_mut() {
            Some(errors) => early_error(errors, PREFLIGHT_ERROR_WINDOW).await,
            None => None,
        };
        forwarded.forwarder.abort();

        match early {
            Some(message) => Err(classify_forward_error(pod, port, &message)),
            None => Ok(()),
        }
    }
}

/// Resolves to the message the remote side reports for a port, or `None`
/// once the forwarder ends without one.
type ErrorChannel = BoxFuture<'static, Option<String>>;

struct Forwarded {
    forwarder: Portforwarder,
    stream: Box<dyn TunnelIo>,
    errors: Option<ErrorChannel>,
}

impl KubeCluster {
    /// Check the pod is running and open a port-forward stream to it.
    async fn forward(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<Forwarded, ForwardError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let found = pods
            .get_opt(pod)
            .await
            .map_err(|e| ForwardError::TunnelSetupFailed(e.to_string()))?
            .ok_or_else(|| ForwardError::PodNotFound {
                namespace: namespace.to_string(),
                name: pod.to_string(),
            })?;

        let phase = found
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        if phase != "Running" {
            return Err(ForwardError::PodNotReady {
                namespace: namespace.to_string(),
                name: pod.to_string(),
                phase,
            });
        }

        let mut forwarder = pods
            .portforward(pod, &[port])
            .await
            .map_err(|e| ForwardError::TunnelSetupFailed(e.to_string()))?;
        let stream = forwarder.take_stream(port).ok_or_else(|| {
            ForwardError::TunnelSetupFailed(format!("no stream for port {port}"))
        })?;
        let errors = forwarder
            .take_error(port)
            .map(|errors| -> ErrorChannel { Box::pin(errors) });

        Ok(Forwarded {
            forwarder,
            stream: Box::new(stream),
            errors,
        })
    }
}

/// Wait up to `window` for the error channel to report a failure.
async fn early_error<F>(errors: &mut F, window: Duration) -> Option<String>
where
    F: Future<Output = Option<String>> + Unpin,
{
    tokio::time::timeout(window, errors).await.ok().flatten()
}

/// Map an error message from the port-forward error channel to an error kind.
pub fn classify_forward_error(pod: &str, port: u16, message: &str) -> ForwardError {
    if message.to_ascii_lowercase().contains("connection refused") {
        ForwardError::ConnectionRefused {
            pod: pod.to_string(),
            port,
        }
    } else {
        ForwardError::TunnelSetupFailed(message.to_string())
    }
}

fn pod_candidate(pod: &Pod) -> Option<PodCandidate> {
    let name = pod.metadata.name.clone()?;
    let named_ports = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| {
            let name = p.name.clone()?;
            let port = u16::try_from(p.container_port).ok()?;
            Some((name, port))
        })
        .collect();
    Some(PodCandidate {
        name,
        ready: is_pod_ready(pod),
        named_ports,
    })
}

fn is_pod_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

/// A stream that turns a failure reported on the error channel into a read
/// error, so the bridge sees it on the connection it belongs to.
struct ReportingStream<S> {
    stream: S,
    errors: Option<ErrorChannel>,
    pod: String,
    port: u16,
}

impl<S> ReportingStream<S> {
    fn new(stream: S, errors: Option<ErrorChannel>, pod: &str, port: u16) -> Self {
        Self {
            stream,
            errors,
            pod: pod.to_string(),
            port,
        }
    }

    fn poll_remote_error(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        let errors = self.errors.as_mut()?;
        let Poll::Ready(message) = errors.as_mut().poll(cx) else {
            return None;
        };
        self.errors = None;
        let error = classify_forward_error(&self.pod, self.port, &message?);
        let kind = match error {
            ForwardError::ConnectionRefused { .. } => io::ErrorKind::ConnectionRefused,
            _ => io::ErrorKind::Other,
        };
        Some(io::Error::new(kind, error.to_string()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReportingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(error) = this.poll_remote_error(cx) {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReportingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// A port-forward stream that tears down its forwarder when dropped.
struct KubeTunnel {
    stream: ReportingStream<Box<dyn TunnelIo>>,
    forwarder: Portforwarder,
}

impl Drop for KubeTunnel {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl AsyncRead for KubeTunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for KubeTunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
