//! kpf - Kubernetes port-forward session manager.
//!
//! Opens local TCP listeners that tunnel into pods (or services, via one of
//! their ready pods) and keeps track of them as named sessions. Sessions are
//! driven through [`forward::ForwardManager`] and exposed to AI hosts as MCP
//! tools by [`mcp::KpfMcpServer`].

pub mod cluster;
pub mod config;
pub mod forward;
pub mod mcp;
pub mod resolve;
pub mod target;
