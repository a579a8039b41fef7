pub mod tools;

use rmcp::{
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router, ServerHandler,
};
use serde::Serialize;

use crate::forward::{ForwardError, ForwardManager, StartRequest};

use tools::{ListPortForwardsParams, StartPortForwardParams, StopPortForwardParams};

/// Map a manager error to an MCP error: caller mistakes become
/// `invalid_params`, everything else `internal_error`.
fn forward_error(e: ForwardError) -> ErrorData {
    if e.is_invalid_request() {
        ErrorData::invalid_params(e.to_string(), None)
    } else {
        ErrorData::internal_error(e.to_string(), None)
    }
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, ErrorData> {
    let text = serde_json::to_string(value).map_err(|e| {
        ErrorData::internal_error(format!("failed to serialize result: {e}"), None)
    })?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

// ── MCP server ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct KpfMcpServer {
    manager: ForwardManager,
    tool_router: ToolRouter<KpfMcpServer>,
}

impl KpfMcpServer {
    pub fn new(manager: ForwardManager) -> Self {
        Self {
            manager,
            tool_router: Self::tool_router(),
        }
    }

    pub fn manager(&self) -> &ForwardManager {
        &self.manager
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for KpfMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "kpf".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some(
                    "Port-forwards from this machine into Kubernetes pods and services."
                        .to_string(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Use start_port_forward to open a local port that tunnels to a pod or service \
                 (target 'pod/<name>' or 'svc/<name>', ports 'PORT' or 'LOCAL:REMOTE'). \
                 It returns a session id like 'pf-1'. list_port_forwards shows active sessions; \
                 stop_port_forward closes one and frees its local port."
                    .to_string(),
            ),
        }
    }
}

#[tool_router]
impl KpfMcpServer {
    /// Start forwarding a local port to a pod or service.
    #[tool(description = "Start a port-forward from a local TCP port to a pod or service in the cluster. target is 'pod/<name>', 'service/<name>' or 'svc/<name>'; ports is 'PORT' or 'LOCAL:REMOTE'; namespace defaults to the current namespace. Services are forwarded to one of their ready pods. Returns the session descriptor, including its id.")]
    async fn start_port_forward(
        &self,
        Parameters(params): Parameters<StartPortForwardParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let request = StartRequest::parse(&params.target, &params.ports, params.namespace)
            .map_err(|e| ErrorData::invalid_params(e.to_string(), None))?;
        let session = self.manager.start(request).await.map_err(forward_error)?;
        json_result(&session)
    }

    /// Stop a port-forward session by ID.
    #[tool(description = "Stop a port-forward session by id (e.g. 'pf-1'). The local port is released once this returns. Fails if the session does not exist or was already stopped.")]
    async fn stop_port_forward(
        &self,
        Parameters(params): Parameters<StopPortForwardParams>,
    ) -> Result<CallToolResult, ErrorData> {
        self.manager
            .stop(&params.session_id)
            .await
            .map_err(forward_error)?;
        let result = serde_json::json!({
            "status": "stopped",
            "session_id": params.session_id,
        });
        json_result(&result)
    }

    /// List active port-forward sessions.
    #[tool(description = "List active port-forward sessions in ascending id order, with namespace, target, resolved pod, ports and number of open connections.")]
    async fn list_port_forwards(
        &self,
        #[allow(unused_variables)]
        Parameters(params): Parameters<ListPortForwardsParams>,
    ) -> Result<CallToolResult, ErrorData> {
        json_result(&self.manager.list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cluster::{MemoryCluster, MemoryPod};
    use crate::forward::ForwardOptions;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_server() -> KpfMcpServer {
        let cluster = MemoryCluster::new("default");
        cluster.add_pod("default", MemoryPod::running("nginx"));
        let manager = ForwardManager::new(Arc::new(cluster), ForwardOptions::default());
        KpfMcpServer::new(manager)
    }

    /// Parse the JSON text payload of a tool result.
    fn payload(result: &CallToolResult) -> serde_json::Value {
        let value = serde_json::to_value(result).unwrap();
        let text = value["content"][0]["text"].as_str().unwrap();
        serde_json::from_str(text).unwrap()
    }

    fn start_params(target: &str, ports: &str) -> Parameters<StartPortForwardParams> {
        Parameters(StartPortForwardParams {
            target: target.to_string(),
            ports: ports.to_string(),
            namespace: None,
        })
    }

    #[tokio::test]
    async fn start_list_stop_roundtrip() {
        let server = test_server();
        let port = free_port();

        let started = server
            .start_port_forward(start_params("pod/nginx", &format!("{port}:80")))
            .await
            .unwrap();
        let session = payload(&started);
        assert_eq!(session["id"], "pf-1");
        assert_eq!(session["namespace"], "default");
        assert_eq!(session["target_type"], "pod");
        assert_eq!(session["pod_name"], "nginx");
        assert_eq!(session["local_port"], port);
        assert_eq!(session["remote_port"], 80);

        let listed = server
            .list_port_forwards(Parameters(ListPortForwardsParams::default()))
            .await
            .unwrap();
        let listed = payload(&listed);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["id"], "pf-1");

        let stopped = server
            .stop_port_forward(Parameters(StopPortForwardParams {
                session_id: "pf-1".into(),
            }))
            .await
            .unwrap();
        assert_eq!(payload(&stopped)["status"], "stopped");

        let listed = server
            .list_port_forwards(Parameters(ListPortForwardsParams::default()))
            .await
            .unwrap();
        assert!(payload(&listed).as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_target_is_invalid_params() {
        let server = test_server();
        let err = server
            .start_port_forward(start_params("deployment/nginx", "8080"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
        assert!(err.message.contains("deployment"));
    }

    #[tokio::test]
    async fn malformed_ports_are_invalid_params() {
        let server = test_server();
        let err = server
            .start_port_forward(start_params("pod/nginx", "8080:80:90"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn stop_unknown_session_is_invalid_params() {
        let server = test_server();
        let err = server
            .stop_port_forward(Parameters(StopPortForwardParams {
                session_id: "pf-42".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
        assert!(err.message.contains("pf-42"));
    }

    #[test]
    fn unserializable_result_is_internal_error() {
        // JSON object keys must be strings.
        let value: std::collections::HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
        let err = json_result(&value).unwrap_err();
        assert_eq!(err.code, ErrorCode::INTERNAL_ERROR);
        assert!(err.message.contains("serialize"));
    }

    #[test]
    fn server_info_advertises_tools() {
        let info = test_server().get_info();
        assert_eq!(info.server_info.name, "kpf");
        assert!(info.capabilities.tools.is_some());
    }

    #[test]
    fn router_lists_three_tools() {
        let server = test_server();
        let mut names: Vec<String> = server
            .tool_router
            .list_all()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["list_port_forwards", "start_port_forward", "stop_port_forward"]
        );
    }
}
