//! Port-forward session manager.
//!
//! [`ForwardManager`] ties the pieces together: it resolves a target to a
//! pod, binds the local listener, optionally checks that a tunnel can be
//! opened, and registers the session. Each session runs its own accept loop
//! and one bridge task per accepted connection, all scoped to the session's
//! cancellation tokens, so stopping one session never touches another.

mod bridge;
pub mod error;
pub mod registry;

pub use error::ForwardError;
pub use registry::{PortForwardSession, SessionRegistry};

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{self, Cluster};
use crate::resolve::resolve;
use crate::target::{self, ParseError, TargetKind};
use bridge::TunnelTarget;
use registry::SessionSpec;

/// Tunables for [`ForwardManager`].
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Address local listeners bind to.
    pub bind_address: IpAddr,
    /// Upper bound on opening one tunnel.
    pub tunnel_timeout: Duration,
    /// How long in-flight connections may keep running after `stop`.
    pub drain_grace: Duration,
    /// Open (and discard) one tunnel during `start`.
    pub preflight: bool,
    pub max_sessions: usize,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tunnel_timeout: Duration::from_secs(10),
            drain_grace: Duration::from_secs(3),
            preflight: true,
            max_sessions: SessionRegistry::DEFAULT_MAX_SESSIONS,
        }
    }
}

/// A validated request to start forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// `None` means the cluster's default namespace.
    pub namespace: Option<String>,
    pub target_type: TargetKind,
    pub target: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl StartRequest {
    /// Build a request from the user-facing `target` and `ports` strings.
    pub fn parse(target: &str, ports: &str, namespace: Option<String>) -> Result<Self, ParseError> {
        let parsed = target::parse_target(target)?;
        let mapping = target::parse_port_mapping(ports)?;
        Ok(Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            target_type: parsed.kind,
            target: parsed.name,
            local_port: mapping.local,
            remote_port: mapping.remote,
        })
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.target.is_empty() {
            return Err(ParseError::EmptyTargetName);
        }
        if self.local_port == 0 || self.remote_port == 0 {
            return Err(ParseError::PortsOutOfRange {
                local: self.local_port.into(),
                remote: self.remote_port.into(),
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ForwardManager {
    cluster: Arc<dyn Cluster>,
    registry: SessionRegistry,
    options: ForwardOptions,
}

impl ForwardManager {
    pub fn new(cluster: Arc<dyn Cluster>, options: ForwardOptions) -> Self {
        let registry = SessionRegistry::with_max_sessions(options.max_sessions);
        Self {
            cluster,
            registry,
            options,
        }
    }

    pub fn options(&self) -> &ForwardOptions {
        &self.options
    }

    /// Start a port-forward session.
    ///
    /// Runs resolution, local bind, optional tunnel preflight and registry
    /// insert in that order. Any failure releases what was already
    /// allocated, so a failed start leaves no socket or entry behind.
    pub async fn start(&self, request: StartRequest) -> Result<PortForwardSession, ForwardError> {
        request.validate()?;

        let namespace = request
            .namespace
            .clone()
            .unwrap_or_else(|| self.cluster.default_namespace().to_string());

        if !self.registry.has_capacity() {
            return Err(ForwardError::MaxSessionsReached);
        }
        if let Some(owner) = self.registry.port_owner(request.local_port) {
            return Err(ForwardError::LocalBindFailed {
                port: request.local_port,
                reason: format!("already forwarded by session {owner}"),
            });
        }

        let what = format!(
            "resolving {} {namespace}/{}",
            request.target_type, request.target
        );
        let resolved = cluster::bounded(
            self.options.tunnel_timeout,
            &what,
            resolve(
                self.cluster.as_ref(),
                &namespace,
                request.target_type,
                &request.target,
                request.remote_port,
            ),
        )
        .await?;

        let listener = bridge::bind(self.options.bind_address, request.local_port).await?;

        if self.options.preflight {
            // On error `listener` is dropped here, releasing the port.
            self.cluster
                .check_tunnel(
                    &namespace,
                    &resolved.pod_name,
                    resolved.pod_port,
                    self.options.tunnel_timeout,
                )
                .await?;
        }

        let spec = SessionSpec {
            namespace: namespace.clone(),
            target_type: request.target_type,
            target: request.target.clone(),
            pod_name: resolved.pod_name.clone(),
            local_port: request.local_port,
            remote_port: request.remote_port,
            pod_port: resolved.pod_port,
        };
        let cluster = self.cluster.clone();
        let timeout = self.options.tunnel_timeout;
        let session = self.registry.insert_with(spec, |id| {
            bridge::spawn_session(
                listener,
                TunnelTarget {
                    session: id.to_string(),
                    cluster,
                    namespace,
                    pod: resolved.pod_name,
                    port: resolved.pod_port,
                    timeout,
                },
            )
        })?;

        tracing::info!(
            session = %session.id,
            target_type = %session.target_type,
            target_name = %session.target,
            pod = %session.pod_name,
            local_port = session.local_port,
            pod_port = session.pod_port,
            "port-forward started"
        );
        Ok(session)
    }

    /// Stop a session: close its listener, let in-flight connections drain
    /// for up to `drain_grace`, force-close the rest, then drop the entry.
    ///
    /// Once this returns the local port can be bound again. Unknown or
    /// already-stopped IDs yield `SessionNotFound`.
    pub async fn stop(&self, id: &str) -> Result<(), ForwardError> {
        let handle = self.registry.begin_stop(id)?;
        let registry = self.registry.clone();
        let grace = self.options.drain_grace;
        let id = id.to_string();

        // Run teardown on its own task so it completes even if the caller
        // stops polling us.
        let teardown = tokio::spawn(async move {
            handle.cancel.cancel();
            if let Some(accept) = handle.accept {
                if let Err(e) = accept.await {
                    tracing::warn!(session = %id, error = %e, "accept loop panicked");
                }
            }

            handle.tracker.close();
            if tokio::time::timeout(grace, handle.tracker.wait()).await.is_err() {
                tracing::debug!(session = %id, "drain grace elapsed, force-closing connections");
                handle.kill.cancel();
                handle.tracker.wait().await;
            }

            registry.remove(&id);
            tracing::info!(session = %id, "port-forward stopped");
        });

        if let Err(e) = teardown.await {
            tracing::error!(error = %e, "port-forward teardown task failed");
        }
        Ok(())
    }

    /// Active sessions, ascending by ID.
    pub fn list(&self) -> Vec<PortForwardSession> {
        self.registry.list()
    }

    /// Stop every active session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.list().into_iter().map(|s| s.id).collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "stopping all port-forwards");
        let stops = ids.iter().map(|id| self.stop(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                tracing::debug!(session = %id, error = %e, "session already stopped");
            }
        }
    }
}
