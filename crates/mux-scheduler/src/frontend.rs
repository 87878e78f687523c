//! Scheduler-side frontend state
//!
//! A [`FrontendHandle`] tracks one registered frontend: the model sessions
//! it subscribed to and its liveness timestamp. Subscribed frontends get
//! `UpdateBackendList` pushes whenever a session's hosting set changes.

use crate::client::{BackendEndpoint, FrontendControl};
use chrono::{DateTime, Utc};
use mux_core::NodeId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

struct FrontendState {
    subscribed: HashSet<String>,
    last_alive: DateTime<Utc>,
}

/// One registered frontend, as the scheduler sees it
pub struct FrontendHandle {
    node_id: NodeId,
    server_address: String,
    rpc_address: String,
    timeout: Duration,
    ctrl: Arc<dyn FrontendControl>,
    state: Mutex<FrontendState>,
}

impl FrontendHandle {
    pub fn new(
        node_id: NodeId,
        server_address: impl Into<String>,
        rpc_address: impl Into<String>,
        timeout: Duration,
        ctrl: Arc<dyn FrontendControl>,
    ) -> Self {
        Self {
            node_id,
            server_address: server_address.into(),
            rpc_address: rpc_address.into(),
            timeout,
            ctrl,
            state: Mutex::new(FrontendState {
                subscribed: HashSet::new(),
                last_alive: Utc::now(),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub fn rpc_address(&self) -> &str {
        &self.rpc_address
    }

    /// Subscribe this frontend to a model session
    pub async fn subscribe_model(&self, session_id: impl Into<String>) {
        self.state.lock().await.subscribed.insert(session_id.into());
    }

    /// Whether this frontend subscribed to `session_id`
    pub async fn is_subscribed(&self, session_id: &str) -> bool {
        self.state.lock().await.subscribed.contains(session_id)
    }

    /// Snapshot of subscribed session ids
    pub async fn subscribed(&self) -> Vec<String> {
        self.state.lock().await.subscribed.iter().cloned().collect()
    }

    /// Refresh the liveness timestamp
    pub async fn touch(&self) {
        self.state.lock().await.last_alive = Utc::now();
    }

    /// Push the hosting backend list for one session
    pub async fn push_backend_list(&self, session_id: &str, backends: Vec<BackendEndpoint>) {
        match self.ctrl.update_backend_list(session_id, backends).await {
            Ok(_) => {
                self.state.lock().await.last_alive = Utc::now();
            }
            Err(e) => {
                warn!(
                    "Frontend {} backend list push for {} failed: {}",
                    self.node_id, session_id, e
                );
            }
        }
    }

    /// Liveness check: recent traffic counts as alive; otherwise ping and
    /// refresh the timestamp on success.
    pub async fn is_alive(&self) -> bool {
        let mut state = self.state.lock().await;
        let elapsed = Utc::now() - state.last_alive;
        if elapsed
            < chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::zero())
        {
            return true;
        }
        match self.ctrl.check_alive(&self.node_id).await {
            Ok(_) => {
                state.last_alive = Utc::now();
                true
            }
            Err(e) => {
                warn!("Frontend {} liveness ping failed: {}", self.node_id, e);
                false
            }
        }
    }
}
