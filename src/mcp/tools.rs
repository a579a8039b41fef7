// MCP tool parameter types

use serde::Deserialize;

/// Parameters for the `start_port_forward` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StartPortForwardParams {
    /// `pod/<name>`, `service/<name>` or `svc/<name>`.
    #[schemars(description = "What to forward to: 'pod/<name>', 'service/<name>' or 'svc/<name>'.")]
    pub target: String,

    /// `PORT` or `LOCAL:REMOTE`.
    #[schemars(description = "Port mapping: 'PORT' to use the same port locally and remotely, or 'LOCAL:REMOTE'.")]
    pub ports: String,

    /// Namespace of the target. Defaults to the current namespace.
    #[schemars(description = "Namespace of the target. Defaults to the current kubeconfig namespace.")]
    pub namespace: Option<String>,
}

/// Parameters for the `stop_port_forward` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StopPortForwardParams {
    #[schemars(description = "ID of the port-forward session to stop, e.g. 'pf-1'.")]
    pub session_id: String,
}

/// Parameters for the `list_port_forwards` tool (none).
#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
pub struct ListPortForwardsParams {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_params_without_namespace() {
        let json = serde_json::json!({"target": "pod/nginx", "ports": "8080:80"});
        let params: StartPortForwardParams = serde_json::from_value(json).unwrap();
        assert_eq!(params.target, "pod/nginx");
        assert_eq!(params.ports, "8080:80");
        assert!(params.namespace.is_none());
    }

    #[test]
    fn start_params_with_namespace() {
        let json = serde_json::json!({"target": "svc/api", "ports": "80", "namespace": "prod"});
        let params: StartPortForwardParams = serde_json::from_value(json).unwrap();
        assert_eq!(params.namespace.as_deref(), Some("prod"));
    }

    #[test]
    fn start_params_missing_ports() {
        let json = serde_json::json!({"target": "pod/nginx"});
        assert!(serde_json::from_value::<StartPortForwardParams>(json).is_err());
    }

    #[test]
    fn start_params_ports_must_be_string() {
        let json = serde_json::json!({"target": "pod/nginx", "ports": 8080});
        assert!(serde_json::from_value::<StartPortForwardParams>(json).is_err());
    }

    #[test]
    fn stop_params_require_session_id() {
        let params: StopPortForwardParams =
            serde_json::from_value(serde_json::json!({"session_id": "pf-3"})).unwrap();
        assert_eq!(params.session_id, "pf-3");
        assert!(serde_json::from_value::<StopPortForwardParams>(serde_json::json!({})).is_err());
    }

    #[test]
    fn list_params_accept_empty_object() {
        assert!(serde_json::from_value::<ListPortForwardsParams>(serde_json::json!({})).is_ok());
    }
}
