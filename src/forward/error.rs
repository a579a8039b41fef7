use crate::target::ParseError;

/// Everything that can go wrong starting, running or stopping a port-forward.
///
/// None of these are retried inside the crate; callers decide.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("service {namespace}/{name} not found")]
    ServiceNotFound { namespace: String, name: String },

    #[error("service {namespace}/{name} has no ready pods")]
    NoReadyPodsForService { namespace: String, name: String },

    #[error("pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },

    #[error("pod {namespace}/{name} is not running (phase: {phase})")]
    PodNotReady {
        namespace: String,
        name: String,
        phase: String,
    },

    #[error("failed to bind local port {port}: {reason}")]
    LocalBindFailed { port: u16, reason: String },

    #[error("connection refused by {pod}:{port}")]
    ConnectionRefused { pod: String, port: u16 },

    #[error("tunnel setup failed: {0}")]
    TunnelSetupFailed(String),

    #[error("port-forward session not found: {0}")]
    SessionNotFound(String),

    #[error("maximum number of port-forward sessions reached")]
    MaxSessionsReached,

    #[error("cluster api error: {0}")]
    Cluster(String),
}

impl ForwardError {
    /// True when the error stems from the caller's request rather than from
    /// the cluster or the local machine.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            Self::Parse(_)
                | Self::ServiceNotFound { .. }
                | Self::NoReadyPodsForService { .. }
                | Self::PodNotFound { .. }
                | Self::SessionNotFound(_)
                | Self::LocalBindFailed { .. }
        )
    }
}
