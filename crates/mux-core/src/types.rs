//! Core type definitions for gpumux

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a node (backend or frontend)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new NodeId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random NodeId
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the string representation of the NodeId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Roles a node can register as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Owns one GPU and runs model executors
    Backend,
    /// Accepts user requests and routes inputs to backends
    Frontend,
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backend" => Ok(NodeType::Backend),
            "frontend" => Ok(NodeType::Frontend),
            _ => Err(format!("Unknown node type: {}", s)),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Backend => write!(f, "backend"),
            NodeType::Frontend => write!(f, "frontend"),
        }
    }
}

/// Status carried by control replies and task results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlStatus {
    /// Success
    Ok,
    /// A deadline was missed; the input was dropped with a virtual output
    Timeout,
    /// The target backend does not host the model session
    ModelNotLoaded,
    /// The control RPC could not reach the peer
    ServerUnreachable,
    /// The workload descriptor was rejected
    InvalidWorkload,
    /// Unexpected failure on the serving path
    InternalError,
}

impl CtrlStatus {
    /// Check whether this status represents success
    pub fn is_ok(&self) -> bool {
        matches!(self, CtrlStatus::Ok)
    }
}

impl fmt::Display for CtrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtrlStatus::Ok => write!(f, "ok"),
            CtrlStatus::Timeout => write!(f, "timeout"),
            CtrlStatus::ModelNotLoaded => write!(f, "model_not_loaded"),
            CtrlStatus::ServerUnreachable => write!(f, "server_unreachable"),
            CtrlStatus::InvalidWorkload => write!(f, "invalid_workload"),
            CtrlStatus::InternalError => write!(f, "internal_error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_creation() {
        let id1 = NodeId::new("backend-1");
        assert_eq!(id1.as_str(), "backend-1");

        let id2 = NodeId::generate();
        assert!(!id2.as_str().is_empty());
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_node_type_parsing() {
        assert_eq!("backend".parse::<NodeType>().unwrap(), NodeType::Backend);
        assert_eq!("Frontend".parse::<NodeType>().unwrap(), NodeType::Frontend);
        assert!("router".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_ctrl_status() {
        assert!(CtrlStatus::Ok.is_ok());
        assert!(!CtrlStatus::Timeout.is_ok());
        assert_eq!(CtrlStatus::ServerUnreachable.to_string(), "server_unreachable");
    }
}
