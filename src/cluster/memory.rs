//! In-process [`Cluster`] with echo tunnels, for tests and local demos.
//!
//! Pods and services are plain records; every tunnel is a
//! `tokio::io::duplex` pipe whose far end echoes back what it receives,
//! unless the cluster is told to hang or go silent.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use tokio::io::DuplexStream;

use super::{Cluster, PodCandidate, ServiceBackends, ServicePortMapping, TunnelStream};
use crate::forward::ForwardError;

const TUNNEL_BUFFER: usize = 64 * 1024;

/// A pod as seen by [`MemoryCluster`].
#[derive(Debug, Clone)]
pub struct MemoryPod {
    pub name: String,
    pub phase: String,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
    pub named_ports: Vec<(String, u16)>,
    /// Ports with nothing listening behind them.
    pub refused_ports: HashSet<u16>,
}

impl MemoryPod {
    /// A running, ready pod.
    pub fn running(name: &str) -> Self {
        Self {
            name: name.to_string(),
            phase: "Running".to_string(),
            ready: true,
            labels: BTreeMap::new(),
            named_ports: Vec::new(),
            refused_ports: HashSet::new(),
        }
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn named_port(mut self, name: &str, port: u16) -> Self {
        self.named_ports.push((name.to_string(), port));
        self
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self.ready = false;
        self
    }

    pub fn refuse(mut self, port: u16) -> Self {
        self.refused_ports.insert(port);
        self
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryService {
    selector: BTreeMap<String, String>,
    ports: Vec<ServicePortMapping>,
}

#[derive(Default)]
struct MemoryState {
    pods: HashMap<(String, String), MemoryPod>,
    services: HashMap<(String, String), MemoryService>,
    hang_tunnels: bool,
    hang_services: bool,
    silent_tunnels: bool,
    /// Far ends of silent tunnels, kept open so the near end never sees EOF.
    held: Vec<DuplexStream>,
    opened: Vec<(String, String, u16)>,
}

pub struct MemoryCluster {
    namespace: String,
    state: Mutex<MemoryState>,
}

impl MemoryCluster {
    pub fn new(default_namespace: &str) -> Self {
        Self {
            namespace: default_namespace.to_string(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn add_pod(&self, namespace: &str, pod: MemoryPod) {
        self.state
            .lock()
            .pods
            .insert((namespace.to_string(), pod.name.clone()), pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn add_service(
        &self,
        namespace: &str,
        name: &str,
        selector: &[(&str, &str)],
        ports: Vec<ServicePortMapping>,
    ) {
        let service = MemoryService {
            selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ports,
        };
        self.state
            .lock()
            .services
            .insert((namespace.to_string(), name.to_string()), service);
    }

    /// Make every later `open_tunnel` call hang until it is cancelled.
    pub fn hang_tunnels(&self, hang: bool) {
        self.state.lock().hang_tunnels = hang;
    }

    /// Make every later `service_backends` call hang until it is cancelled.
    pub fn hang_services(&self, hang: bool) {
        self.state.lock().hang_services = hang;
    }

    /// Make later tunnels neither echo nor close: the pod end stays open and
    /// never writes, like a server waiting for more input.
    pub fn silent_tunnels(&self, silent: bool) {
        self.state.lock().silent_tunnels = silent;
    }

    /// `(namespace, pod, port)` of every tunnel opened so far.
    pub fn opened_tunnels(&self) -> Vec<(String, String, u16)> {
        self.state.lock().opened.clone()
    }
}

#[async_trait::async_trait]
impl Cluster for MemoryCluster {
    fn default_namespace(&self) -> &str {
        &self.namespace
    }

    async fn service_backends(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<ServiceBackends, ForwardError> {
        let hang = self.state.lock().hang_services;
        if hang {
            std::future::pending::<()>().await;
        }

        let state = self.state.lock();
        let found = state
            .services
            .get(&(namespace.to_string(), service.to_string()))
            .ok_or_else(|| ForwardError::ServiceNotFound {
                namespace: namespace.to_string(),
                name: service.to_string(),
            })?;

        let pods = if found.selector.is_empty() {
            Vec::new()
        } else {
            state
                .pods
                .iter()
                .filter(|((ns, _), _)| ns == namespace)
                .filter(|(_, pod)| {
                    found
                        .selector
                        .iter()
                        .all(|(k, v)| pod.labels.get(k) == Some(v))
                })
                .map(|(_, pod)| PodCandidate {
                    name: pod.name.clone(),
                    ready: pod.ready && pod.phase == "Running",
                    named_ports: pod.named_ports.clone(),
                })
                .collect()
        };

        Ok(ServiceBackends {
            ports: found.ports.clone(),
            pods,
        })
    }

    async fn open_tunnel(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<TunnelStream, ForwardError> {
        let hang = {
            let mut state = self.state.lock();
            let found = state
                .pods
                .get(&(namespace.to_string(), pod.to_string()))
                .ok_or_else(|| ForwardError::PodNotFound {
                    namespace: namespace.to_string(),
                    name: pod.to_string(),
                })?;
            if found.phase != "Running" {
                return Err(ForwardError::PodNotReady {
                    namespace: namespace.to_string(),
                    name: pod.to_string(),
                    phase: found.phase.clone(),
                });
            }
            if found.refused_ports.contains(&port) {
                return Err(ForwardError::ConnectionRefused {
                    pod: pod.to_string(),
                    port,
                });
            }
            if !state.hang_tunnels {
                state
                    .opened
                    .push((namespace.to_string(), pod.to_string(), port));
            }
            state.hang_tunnels
        };

        if hang {
            std::future::pending::<()>().await;
        }

        let (near, far) = tokio::io::duplex(TUNNEL_BUFFER);
        {
            let mut state = self.state.lock();
            if state.silent_tunnels {
                state.held.push(far);
                return Ok(Box::new(near));
            }
        }
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(near))
    }
}
