//! Resolve a pod or service target to the concrete pod and port to forward to.

use crate::cluster::{Cluster, PodCandidate, ServiceBackends, TargetPortRef};
use crate::forward::ForwardError;
use crate::target::TargetKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub pod_name: String,
    /// Port inside the pod. Differs from the requested port when a service
    /// maps it to another `targetPort`.
    pub pod_port: u16,
}

/// Resolve `(kind, name)` in `namespace`.
///
/// Pods resolve to themselves without contacting the cluster; a missing pod
/// surfaces when the tunnel is opened. Services resolve to their ready pod
/// with the lexicographically smallest name.
pub async fn resolve(
    cluster: &dyn Cluster,
    namespace: &str,
    kind: TargetKind,
    name: &str,
    remote_port: u16,
) -> Result<ResolvedTarget, ForwardError> {
    match kind {
        TargetKind::Pod => Ok(ResolvedTarget {
            pod_name: name.to_string(),
            pod_port: remote_port,
        }),
        TargetKind::Service => {
            let backends = cluster.service_backends(namespace, name).await?;
            select_service_backend(&backends, remote_port).ok_or_else(|| {
                ForwardError::NoReadyPodsForService {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                }
            })
        }
    }
}

/// Pick a ready pod and translate `remote_port` through the service's port
/// mappings. Returns `None` when no pod is ready.
pub fn select_service_backend(
    backends: &ServiceBackends,
    remote_port: u16,
) -> Option<ResolvedTarget> {
    let pod = backends
        .pods
        .iter()
        .filter(|p| p.ready)
        .min_by(|a, b| a.name.cmp(&b.name))?;

    Some(ResolvedTarget {
        pod_name: pod.name.clone(),
        pod_port: target_port(backends, pod, remote_port),
    })
}

fn target_port(backends: &ServiceBackends, pod: &PodCandidate, remote_port: u16) -> u16 {
    let mapping = backends.ports.iter().find(|m| m.port == remote_port);
    match mapping.and_then(|m| m.target.as_ref()) {
        Some(TargetPortRef::Number(n)) => *n,
        Some(TargetPortRef::Name(port_name)) => pod
            .named_ports
            .iter()
            .find(|(n, _)| n == port_name)
            .map(|(_, p)| *p)
            .unwrap_or(remote_port),
        None => remote_port,
    }
}
