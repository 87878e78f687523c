//! gRPC control service exposed by the scheduler
//!
//! Backends and frontends register, keep alive, subscribe to model
//! sessions, and request model loads through this service. Placement
//! failures are reported in the reply status; transport-level errors are
//! reserved for malformed requests.

use crate::scheduler::Scheduler;
use crate::SchedulerError;
use mux_core::NodeId;
use mux_proto::control::v1 as proto;
use mux_proto::SchedulerCtrl;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

/// Tonic service wrapper around a [`Scheduler`]
#[derive(Clone)]
pub struct SchedulerCtrlService {
    scheduler: Arc<Scheduler>,
}

impl SchedulerCtrlService {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

fn status_for(error: &SchedulerError) -> proto::CtrlStatus {
    match error {
        SchedulerError::PlacementInfeasible { .. } | SchedulerError::BackendNotIdle(_) => {
            proto::CtrlStatus::InvalidWorkload
        }
        SchedulerError::NotRegistered(_) | SchedulerError::AlreadyRegistered(_) => {
            proto::CtrlStatus::InternalError
        }
        SchedulerError::Transport(_) => proto::CtrlStatus::ServerUnreachable,
        _ => proto::CtrlStatus::InternalError,
    }
}

#[tonic::async_trait]
impl SchedulerCtrl for SchedulerCtrlService {
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> std::result::Result<Response<proto::RegisterReply>, Status> {
        let req = request.into_inner();
        let node_type = req.node_type();
        let node_id = NodeId::new(req.node_id.clone());
        debug!("Register {} as {:?}", node_id, node_type);

        let result = match node_type {
            proto::NodeType::Backend => {
                self.scheduler
                    .register_backend(
                        node_id,
                        req.server_address,
                        req.rpc_address,
                        req.gpu_device,
                        req.gpu_available_memory,
                    )
                    .await
            }
            proto::NodeType::Frontend => {
                self.scheduler
                    .register_frontend(node_id, req.server_address, req.rpc_address)
                    .await
            }
            proto::NodeType::Unspecified => {
                return Err(Status::invalid_argument("node_type is required"));
            }
        };

        let reply = match result {
            Ok(timeout_s) => proto::RegisterReply {
                status: proto::CtrlStatus::Ok as i32,
                timeout_s,
            },
            Err(e) => {
                warn!("Registration failed: {}", e);
                proto::RegisterReply {
                    status: status_for(&e) as i32,
                    timeout_s: 0,
                }
            }
        };
        Ok(Response::new(reply))
    }

    async fn keep_alive(
        &self,
        request: Request<proto::KeepAliveRequest>,
    ) -> std::result::Result<Response<proto::RpcReply>, Status> {
        let req = request.into_inner();
        let status = match self.scheduler.keep_alive(&NodeId::new(req.node_id)).await {
            Ok(()) => proto::CtrlStatus::Ok,
            Err(e) => status_for(&e),
        };
        Ok(Response::new(proto::RpcReply {
            status: status as i32,
        }))
    }

    async fn load_model(
        &self,
        request: Request<proto::LoadModelRequest>,
    ) -> std::result::Result<Response<proto::LoadModelReply>, Status> {
        let req = request.into_inner();
        let session: mux_core::ModelSession = req
            .model_session
            .ok_or_else(|| Status::invalid_argument("model_session is required"))?
            .into();
        let session_id = session.session_id();

        let reply = match self.scheduler.load_model(&session, req.estimate_workload).await {
            Ok(config) => {
                let backends = self
                    .scheduler
                    .backends_for(&session_id)
                    .await
                    .into_iter()
                    .map(|endpoint| proto::BackendInfo {
                        node_id: endpoint.node_id.to_string(),
                        server_address: endpoint.server_address,
                    })
                    .collect();
                proto::LoadModelReply {
                    status: proto::CtrlStatus::Ok as i32,
                    config: Some(config.into()),
                    backends,
                }
            }
            Err(e) => {
                warn!("LoadModel for {} failed: {}", session_id, e);
                proto::LoadModelReply {
                    status: status_for(&e) as i32,
                    config: None,
                    backends: Vec::new(),
                }
            }
        };
        Ok(Response::new(reply))
    }

    async fn subscribe_model(
        &self,
        request: Request<proto::SubscribeModelRequest>,
    ) -> std::result::Result<Response<proto::RpcReply>, Status> {
        let req = request.into_inner();
        let status = match self
            .scheduler
            .subscribe_model(&NodeId::new(req.node_id), &req.model_session_id)
            .await
        {
            Ok(_) => proto::CtrlStatus::Ok,
            Err(e) => {
                warn!("SubscribeModel failed: {}", e);
                status_for(&e)
            }
        };
        Ok(Response::new(proto::RpcReply {
            status: status as i32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockTransport;
    use mux_core::SchedulerConfig;
    use mux_profile::{ForwardEntry, LatencyStat, ModelProfile, ProfileDatabase};
    use std::collections::BTreeMap;

    fn service() -> SchedulerCtrlService {
        let forward = (1..=16)
            .map(|b| {
                (
                    b,
                    ForwardEntry {
                        latency_us: (b as f64) * 2000.0,
                        std_us: 50.0,
                        memory_bytes: b as u64 * (128 << 20),
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        let mut db = ProfileDatabase::empty();
        db.insert(ModelProfile {
            profile_id: "tensorflow:resnet50:1".to_string(),
            gpu_device: "TITAN_X".to_string(),
            forward,
            preprocess: LatencyStat { mean_us: 2000.0, std_us: 10.0 },
            postprocess: LatencyStat { mean_us: 1000.0, std_us: 10.0 },
        })
        .unwrap();

        let config = SchedulerConfig {
            port: 10001,
            model_root: "/tmp/models".into(),
            workload: None,
            timeout_s: 5,
            tick_interval_s: 1,
            rpc_timeout_ms: 100,
        };
        let scheduler = Scheduler::with_static_workload(
            config,
            Arc::new(db),
            MockTransport::new(),
            mux_core::StaticWorkload::default(),
        );
        SchedulerCtrlService::new(Arc::new(scheduler))
    }

    fn register_request(name: &str) -> proto::RegisterRequest {
        proto::RegisterRequest {
            node_type: proto::NodeType::Backend as i32,
            node_id: name.to_string(),
            server_address: "10.0.0.1:8001".to_string(),
            rpc_address: "10.0.0.1:8002".to_string(),
            gpu_device: "TITAN_X".to_string(),
            gpu_available_memory: 8 << 30,
        }
    }

    #[tokio::test]
    async fn test_register_and_keep_alive() {
        let service = service();
        let reply = service
            .register(Request::new(register_request("backend-1")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), proto::CtrlStatus::Ok);
        assert_eq!(reply.timeout_s, 5);

        let reply = service
            .keep_alive(Request::new(proto::KeepAliveRequest {
                node_type: proto::NodeType::Backend as i32,
                node_id: "backend-1".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), proto::CtrlStatus::Ok);

        let reply = service
            .keep_alive(Request::new(proto::KeepAliveRequest {
                node_type: proto::NodeType::Backend as i32,
                node_id: "ghost".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), proto::CtrlStatus::InternalError);
    }

    #[tokio::test]
    async fn test_load_model_reports_placement() {
        let service = service();
        service
            .register(Request::new(register_request("backend-1")))
            .await
            .unwrap();

        let session = mux_core::ModelSession::new("tensorflow", "resnet50", 1, 50);
        let reply = service
            .load_model(Request::new(proto::LoadModelRequest {
                node_id: "frontend-1".to_string(),
                model_session: Some(session.into()),
                estimate_workload: 0.0,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), proto::CtrlStatus::Ok);
        assert!(reply.config.is_some());
        assert_eq!(reply.backends.len(), 1);
    }

    #[tokio::test]
    async fn test_load_model_infeasible_status() {
        let service = service();
        let session = mux_core::ModelSession::new("tensorflow", "resnet50", 1, 50);
        let reply = service
            .load_model(Request::new(proto::LoadModelRequest {
                node_id: "frontend-1".to_string(),
                model_session: Some(session.into()),
                estimate_workload: 0.0,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.status(), proto::CtrlStatus::InvalidWorkload);
        assert!(reply.config.is_none());
    }

    #[tokio::test]
    async fn test_register_requires_node_type() {
        let service = service();
        let mut request = register_request("backend-1");
        request.node_type = proto::NodeType::Unspecified as i32;
        assert!(service.register(Request::new(request)).await.is_err());
    }
}
