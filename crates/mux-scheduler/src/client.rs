//! Control-plane transports
//!
//! The scheduler talks to backends and frontends through the
//! [`BackendControl`] and [`FrontendControl`] traits. The gRPC
//! implementations connect lazily and reconnect after failures; the mock
//! implementations script replies and count calls so placement and
//! liveness logic is testable without sockets.

use crate::{Result, SchedulerError};
use async_trait::async_trait;
use mux_core::{CtrlStatus, ModelTableConfig, NodeId};
use mux_proto::control::v1 as proto;
use mux_proto::{BackendCtrlClient, FrontendCtrlClient};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// One backend endpoint a frontend can route a session to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub node_id: NodeId,
    pub server_address: String,
}

/// Scheduler -> backend control operations
#[async_trait]
pub trait BackendControl: Send + Sync {
    /// Deliver the desired model set
    async fn update_model_table(&self, table: ModelTableConfig) -> Result<CtrlStatus>;

    /// Liveness ping
    async fn check_alive(&self, node_id: &NodeId) -> Result<CtrlStatus>;
}

/// Scheduler -> frontend control operations
#[async_trait]
pub trait FrontendControl: Send + Sync {
    /// Push the backend list for one subscribed model session
    async fn update_backend_list(
        &self,
        session_id: &str,
        backends: Vec<BackendEndpoint>,
    ) -> Result<CtrlStatus>;

    /// Liveness ping
    async fn check_alive(&self, node_id: &NodeId) -> Result<CtrlStatus>;
}

/// Creates control channels for newly registered nodes
pub trait ControlTransport: Send + Sync {
    fn backend(&self, rpc_address: &str) -> Arc<dyn BackendControl>;
    fn frontend(&self, rpc_address: &str) -> Arc<dyn FrontendControl>;
}

/// gRPC transport with per-call timeouts and lazy connection
pub struct GrpcTransport {
    rpc_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self { rpc_timeout }
    }
}

impl ControlTransport for GrpcTransport {
    fn backend(&self, rpc_address: &str) -> Arc<dyn BackendControl> {
        Arc::new(GrpcBackendControl {
            address: rpc_address.to_string(),
            timeout: self.rpc_timeout,
            client: Mutex::new(None),
        })
    }

    fn frontend(&self, rpc_address: &str) -> Arc<dyn FrontendControl> {
        Arc::new(GrpcFrontendControl {
            address: rpc_address.to_string(),
            timeout: self.rpc_timeout,
            client: Mutex::new(None),
        })
    }
}

async fn connect(address: &str, timeout: Duration) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{}", address))
        .map_err(|e| SchedulerError::transport(format!("bad address {}: {}", address, e)))?
        .timeout(timeout)
        .connect_timeout(timeout);
    endpoint
        .connect()
        .await
        .map_err(|e| SchedulerError::transport(format!("connect {}: {}", address, e)))
}

struct GrpcBackendControl {
    address: String,
    timeout: Duration,
    client: Mutex<Option<BackendCtrlClient<Channel>>>,
}

impl GrpcBackendControl {
    async fn client(&self) -> Result<BackendCtrlClient<Channel>> {
        let mut guard = self.client.lock().await;
        match guard.as_ref() {
            Some(client) => Ok(client.clone()),
            None => {
                let channel = connect(&self.address, self.timeout).await?;
                let client = BackendCtrlClient::new(channel);
                *guard = Some(client.clone());
                Ok(client)
            }
        }
    }

    async fn reset(&self) {
        *self.client.lock().await = None;
    }
}

#[async_trait]
impl BackendControl for GrpcBackendControl {
    async fn update_model_table(&self, table: ModelTableConfig) -> Result<CtrlStatus> {
        let mut client = self.client().await?;
        let reply = match client.update_model_table(proto::ModelTableConfig::from(table)).await {
            Ok(reply) => reply.into_inner(),
            Err(e) => {
                self.reset().await;
                return Err(SchedulerError::transport(format!(
                    "UpdateModelTable to {}: {}",
                    self.address, e
                )));
            }
        };
        reply
            .status()
            .try_into()
            .map_err(|e| SchedulerError::transport(format!("bad reply status: {}", e)))
    }

    async fn check_alive(&self, node_id: &NodeId) -> Result<CtrlStatus> {
        let mut client = self.client().await?;
        let request = proto::CheckAliveRequest {
            node_type: proto::NodeType::Backend as i32,
            node_id: node_id.to_string(),
        };
        let reply = match client.check_alive(request).await {
            Ok(reply) => reply.into_inner(),
            Err(e) => {
                self.reset().await;
                return Err(SchedulerError::transport(format!(
                    "CheckAlive to {}: {}",
                    self.address, e
                )));
            }
        };
        reply
            .status()
            .try_into()
            .map_err(|e| SchedulerError::transport(format!("bad reply status: {}", e)))
    }
}

struct GrpcFrontendControl {
    address: String,
    timeout: Duration,
    client: Mutex<Option<FrontendCtrlClient<Channel>>>,
}

impl GrpcFrontendControl {
    async fn client(&self) -> Result<FrontendCtrlClient<Channel>> {
        let mut guard = self.client.lock().await;
        match guard.as_ref() {
            Some(client) => Ok(client.clone()),
            None => {
                let channel = connect(&self.address, self.timeout).await?;
                let client = FrontendCtrlClient::new(channel);
                *guard = Some(client.clone());
                Ok(client)
            }
        }
    }
}

#[async_trait]
impl FrontendControl for GrpcFrontendControl {
    async fn update_backend_list(
        &self,
        session_id: &str,
        backends: Vec<BackendEndpoint>,
    ) -> Result<CtrlStatus> {
        let mut client = self.client().await?;
        let request = proto::BackendListUpdate {
            model_session_id: session_id.to_string(),
            backends: backends
                .into_iter()
                .map(|b| proto::BackendInfo {
                    node_id: b.node_id.to_string(),
                    server_address: b.server_address,
                })
                .collect(),
        };
        let reply = match client.update_backend_list(request).await {
            Ok(reply) => reply.into_inner(),
            Err(e) => {
                *self.client.lock().await = None;
                return Err(SchedulerError::transport(format!(
                    "UpdateBackendList to {}: {}",
                    self.address, e
                )));
            }
        };
        reply
            .status()
            .try_into()
            .map_err(|e| SchedulerError::transport(format!("bad reply status: {}", e)))
    }

    async fn check_alive(&self, node_id: &NodeId) -> Result<CtrlStatus> {
        let mut client = self.client().await?;
        let request = proto::CheckAliveRequest {
            node_type: proto::NodeType::Frontend as i32,
            node_id: node_id.to_string(),
        };
        let reply = match client.check_alive(request).await {
            Ok(reply) => reply.into_inner(),
            Err(e) => {
                *self.client.lock().await = None;
                return Err(SchedulerError::transport(format!(
                    "CheckAlive to {}: {}",
                    self.address, e
                )));
            }
        };
        reply
            .status()
            .try_into()
            .map_err(|e| SchedulerError::transport(format!("bad reply status: {}", e)))
    }
}

/// Scripted backend control for tests
pub struct MockBackendControl {
    alive: AtomicBool,
    fail_update: AtomicBool,
    pub update_calls: AtomicU64,
    pub check_calls: AtomicU64,
    last_table: Mutex<Option<ModelTableConfig>>,
}

impl MockBackendControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            fail_update: AtomicBool::new(false),
            update_calls: AtomicU64::new(0),
            check_calls: AtomicU64::new(0),
            last_table: Mutex::new(None),
        })
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn set_fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::Relaxed);
    }

    pub async fn last_table(&self) -> Option<ModelTableConfig> {
        self.last_table.lock().await.clone()
    }
}

#[async_trait]
impl BackendControl for MockBackendControl {
    async fn update_model_table(&self, table: ModelTableConfig) -> Result<CtrlStatus> {
        self.update_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_update.load(Ordering::Relaxed) || !self.alive.load(Ordering::Relaxed) {
            return Err(SchedulerError::transport("mock backend unreachable"));
        }
        *self.last_table.lock().await = Some(table);
        Ok(CtrlStatus::Ok)
    }

    async fn check_alive(&self, node_id: &NodeId) -> Result<CtrlStatus> {
        self.check_calls.fetch_add(1, Ordering::Relaxed);
        debug!("mock CheckAlive for {}", node_id);
        if self.alive.load(Ordering::Relaxed) {
            Ok(CtrlStatus::Ok)
        } else {
            Err(SchedulerError::transport("mock backend unreachable"))
        }
    }
}

/// Scripted frontend control for tests
pub struct MockFrontendControl {
    alive: AtomicBool,
    pub updates: Mutex<Vec<(String, Vec<BackendEndpoint>)>>,
}

impl MockFrontendControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            updates: Mutex::new(Vec::new()),
        })
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }
}

#[async_trait]
impl FrontendControl for MockFrontendControl {
    async fn update_backend_list(
        &self,
        session_id: &str,
        backends: Vec<BackendEndpoint>,
    ) -> Result<CtrlStatus> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(SchedulerError::transport("mock frontend unreachable"));
        }
        self.updates
            .lock()
            .await
            .push((session_id.to_string(), backends));
        Ok(CtrlStatus::Ok)
    }

    async fn check_alive(&self, _node_id: &NodeId) -> Result<CtrlStatus> {
        if self.alive.load(Ordering::Relaxed) {
            Ok(CtrlStatus::Ok)
        } else {
            Err(SchedulerError::transport("mock frontend unreachable"))
        }
    }
}

/// Transport handing out shared mocks, keyed by rpc address
#[derive(Default)]
pub struct MockTransport {
    backends: std::sync::Mutex<HashMap<String, Arc<MockBackendControl>>>,
    frontends: std::sync::Mutex<HashMap<String, Arc<MockFrontendControl>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The mock behind a backend rpc address, creating it if needed
    pub fn backend_mock(&self, rpc_address: &str) -> Arc<MockBackendControl> {
        self.backends
            .lock()
            .unwrap()
            .entry(rpc_address.to_string())
            .or_insert_with(MockBackendControl::new)
            .clone()
    }

    /// The mock behind a frontend rpc address, creating it if needed
    pub fn frontend_mock(&self, rpc_address: &str) -> Arc<MockFrontendControl> {
        self.frontends
            .lock()
            .unwrap()
            .entry(rpc_address.to_string())
            .or_insert_with(MockFrontendControl::new)
            .clone()
    }
}

impl ControlTransport for MockTransport {
    fn backend(&self, rpc_address: &str) -> Arc<dyn BackendControl> {
        self.backend_mock(rpc_address)
    }

    fn frontend(&self, rpc_address: &str) -> Arc<dyn FrontendControl> {
        self.frontend_mock(rpc_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_backend_control() {
        let mock = MockBackendControl::new();
        let node = NodeId::new("backend-1");

        assert!(mock.check_alive(&node).await.unwrap().is_ok());
        assert_eq!(mock.check_calls.load(Ordering::Relaxed), 1);

        mock.set_alive(false);
        assert!(mock.check_alive(&node).await.is_err());

        mock.set_alive(true);
        let table = ModelTableConfig::empty();
        assert!(mock.update_model_table(table).await.unwrap().is_ok());
        assert!(mock.last_table().await.is_some());
    }

    #[tokio::test]
    async fn test_mock_transport_shares_mocks() {
        let transport = MockTransport::new();
        let a = transport.backend_mock("10.0.0.1:8002");
        let ctrl = transport.backend("10.0.0.1:8002");
        ctrl.check_alive(&NodeId::new("x")).await.unwrap();
        assert_eq!(a.check_calls.load(Ordering::Relaxed), 1);
    }
}
