//! Parsing of user-supplied port-forward targets and port mappings.
//!
//! Targets look like `pod/<name>`, `service/<name>` or `svc/<name>`; port
//! mappings are either `PORT` or `LOCAL:REMOTE`.

use serde::Serialize;

/// Kind of object a port-forward points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Pod,
    Service,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Service => "service",
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `<kind>/<name>` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: TargetKind,
    pub name: String,
}

/// Local and remote halves of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub local: u16,
    pub remote: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid target format {0:?}: expected <kind>/<name>")]
    InvalidTargetFormat(String),
    #[error("invalid target type {0:?}: expected pod, service or svc")]
    InvalidTargetType(String),
    #[error("target name must not be empty")]
    EmptyTargetName,
    #[error("invalid port {0:?}: must be an integer between 1 and 65535")]
    InvalidPort(String),
    #[error("invalid local port {0:?}")]
    InvalidLocalPort(String),
    #[error("invalid remote port {0:?}")]
    InvalidRemotePort(String),
    #[error("ports out of range ({local}:{remote}): both must be between 1 and 65535")]
    PortsOutOfRange { local: i64, remote: i64 },
    #[error("invalid port mapping {0:?}: expected PORT or LOCAL:REMOTE")]
    InvalidPortMappingFormat(String),
}

/// Parse a `<kind>/<name>` target string.
///
/// The kind is matched case-insensitively; `svc` is normalized to
/// [`TargetKind::Service`]. The name is returned verbatim.
pub fn parse_target(input: &str) -> Result<Target, ParseError> {
    let mut parts = input.split('/');
    let (kind, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(name), None) => (kind, name),
        _ => return Err(ParseError::InvalidTargetFormat(input.to_string())),
    };

    let kind = match kind.to_ascii_lowercase().as_str() {
        "pod" => TargetKind::Pod,
        "service" | "svc" => TargetKind::Service,
        _ => return Err(ParseError::InvalidTargetType(kind.to_string())),
    };

    if name.is_empty() {
        return Err(ParseError::EmptyTargetName);
    }

    Ok(Target {
        kind,
        name: name.to_string(),
    })
}

/// Parse a `PORT` or `LOCAL:REMOTE` port mapping.
pub fn parse_port_mapping(input: &str) -> Result<PortMapping, ParseError> {
    let parts: Vec<&str> = input.split(':').collect();
    match parts.as_slice() {
        [single] => {
            let port = parse_int(single)
                .and_then(in_range)
                .ok_or_else(|| ParseError::InvalidPort(single.to_string()))?;
            Ok(PortMapping {
                local: port,
                remote: port,
            })
        }
        [local, remote] => {
            let local_raw =
                parse_int(local).ok_or_else(|| ParseError::InvalidLocalPort(local.to_string()))?;
            let remote_raw = parse_int(remote)
                .ok_or_else(|| ParseError::InvalidRemotePort(remote.to_string()))?;
            match (in_range(local_raw), in_range(remote_raw)) {
                (Some(local), Some(remote)) => Ok(PortMapping { local, remote }),
                _ => Err(ParseError::PortsOutOfRange {
                    local: local_raw,
                    remote: remote_raw,
                }),
            }
        }
        _ => Err(ParseError::InvalidPortMappingFormat(input.to_string())),
    }
}

fn parse_int(s: &str) -> Option<i64> {
    s.parse::<i64>().ok()
}

fn in_range(port: i64) -> Option<u16> {
    if (1..=65535).contains(&port) {
        Some(port as u16)
    } else {
        None
    }
}
