//! gRPC control service exposed by the backend
//!
//! Carries the two scheduler-facing operations: `UpdateModelTable` and
//! `CheckAlive`. Failures on the table path are reported in the reply
//! status rather than as transport errors, so the scheduler can tell
//! "backend refused" from "backend gone".

use crate::server::BackendServer;
use mux_proto::control::v1 as proto;
use mux_proto::BackendCtrl;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, error};

/// Tonic service wrapper around a [`BackendServer`]
#[derive(Clone)]
pub struct BackendCtrlService {
    server: Arc<BackendServer>,
}

impl BackendCtrlService {
    pub fn new(server: Arc<BackendServer>) -> Self {
        Self { server }
    }
}

#[tonic::async_trait]
impl BackendCtrl for BackendCtrlService {
    async fn update_model_table(
        &self,
        request: Request<proto::ModelTableConfig>,
    ) -> std::result::Result<Response<proto::RpcReply>, Status> {
        let table: mux_core::ModelTableConfig = request
            .into_inner()
            .try_into()
            .map_err(|e| Status::invalid_argument(format!("bad model table: {}", e)))?;
        debug!(
            "UpdateModelTable: {} instances, duty cycle {} us",
            table.instances.len(),
            table.duty_cycle_us
        );

        let status = match self.server.update_model_table(table).await {
            Ok(()) => proto::CtrlStatus::Ok,
            Err(e) => {
                error!("UpdateModelTable failed: {}", e);
                proto::CtrlStatus::InternalError
            }
        };
        Ok(Response::new(proto::RpcReply {
            status: status as i32,
        }))
    }

    async fn check_alive(
        &self,
        request: Request<proto::CheckAliveRequest>,
    ) -> std::result::Result<Response<proto::RpcReply>, Status> {
        let req = request.into_inner();
        debug!("CheckAlive from {} ({})", req.node_id, self.server.check_alive());
        Ok(Response::new(proto::RpcReply {
            status: proto::CtrlStatus::Ok as i32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockModelFactory;
    use mux_core::{BackendConfig, NodeId};
    use mux_profile::ProfileDatabase;

    fn service() -> BackendCtrlService {
        let config = BackendConfig {
            node_id: NodeId::new("backend-1"),
            gpu: 0,
            gpu_device: "TITAN_X".to_string(),
            gpu_memory: 8 << 30,
            scheduler_addr: "127.0.0.1:10001".to_string(),
            port: 8001,
            rpc_port: 8002,
            model_root: "/tmp/models".into(),
            postprocess_workers: 1,
        };
        let server = BackendServer::new(
            config,
            None,
            Arc::new(ProfileDatabase::empty()),
            Arc::new(MockModelFactory),
        );
        BackendCtrlService::new(server)
    }

    #[tokio::test]
    async fn test_check_alive_replies_ok() {
        let service = service();
        let reply = service
            .check_alive(Request::new(proto::CheckAliveRequest {
                node_type: proto::NodeType::Backend as i32,
                node_id: "backend-1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), proto::CtrlStatus::Ok);
    }

    #[tokio::test]
    async fn test_update_model_table_applies() {
        let service = service();
        let session = mux_core::ModelSession::new("tensorflow", "resnet50", 1, 50);
        let table = proto::ModelTableConfig {
            duty_cycle_us: 30_000.0,
            model_instance_config: vec![proto::ModelInstanceConfig {
                model_session: Some(session.clone().into()),
                batch: 4,
                max_batch: 8,
                forward_latency_us: 20_000.0,
                memory_usage: 1 << 30,
                throughput: 100.0,
                workload: 100.0,
            }],
        };
        let reply = service
            .update_model_table(Request::new(table))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), proto::CtrlStatus::Ok);
        assert_eq!(
            service.server.loaded_sessions().await,
            vec![session.session_id()]
        );
    }

    #[tokio::test]
    async fn test_update_model_table_rejects_malformed() {
        let service = service();
        let table = proto::ModelTableConfig {
            duty_cycle_us: 30_000.0,
            model_instance_config: vec![proto::ModelInstanceConfig::default()],
        };
        assert!(service.update_model_table(Request::new(table)).await.is_err());
    }
}
