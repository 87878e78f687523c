//! # mux-proto
//!
//! Protocol buffer definitions and generated gRPC bindings for the gpumux
//! control plane:
//!
//! - `BackendCtrl`: scheduler -> backend model-table pushes and liveness
//! - `SchedulerCtrl`: node registration, keep-alive, model loading
//! - `FrontendCtrl`: scheduler -> frontend backend-list pushes
//!
//! The `conversions` module maps between the wire types and the richer
//! `mux-core` data model.

pub mod conversions;

// Generated protobuf code
pub mod control {
    pub mod v1 {
        tonic::include_proto!("gpumux.control.v1");
    }
}

// Re-export commonly used types for convenience (both server and client)
pub use control::v1::{
    backend_ctrl_client::BackendCtrlClient,
    backend_ctrl_server::{BackendCtrl, BackendCtrlServer},
    frontend_ctrl_client::FrontendCtrlClient,
    frontend_ctrl_server::{FrontendCtrl, FrontendCtrlServer},
    scheduler_ctrl_client::SchedulerCtrlClient,
    scheduler_ctrl_server::{SchedulerCtrl, SchedulerCtrlServer},
    BackendInfo, BackendListUpdate, CheckAliveRequest, CtrlStatus, KeepAliveRequest,
    LoadModelReply, LoadModelRequest, ModelInstanceConfig, ModelSession, ModelTableConfig,
    NodeType, RegisterReply, RegisterRequest, RpcReply, SubscribeModelRequest,
};

/// Common error type for proto conversions
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, ProtoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_creation() {
        let reply = RpcReply {
            status: CtrlStatus::Ok as i32,
        };
        assert_eq!(reply.status(), CtrlStatus::Ok);

        let request = CheckAliveRequest {
            node_type: NodeType::Backend as i32,
            node_id: "backend-1".to_string(),
        };
        assert_eq!(request.node_type(), NodeType::Backend);
    }

    #[test]
    fn test_model_table_defaults() {
        let table = ModelTableConfig::default();
        assert_eq!(table.duty_cycle_us, 0.0);
        assert!(table.model_instance_config.is_empty());
    }
}
