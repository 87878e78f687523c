//! The placement scheduler
//!
//! Holds the authoritative placement state behind one scheduler-wide
//! mutex: registered backends and frontends, model-session assignments,
//! and the not-yet-assigned static workloads. Placement is coarse-grained
//! and infrequent, so the single lock is deliberate.
//!
//! A background control loop walks the backends every few seconds: dead
//! backends are removed and their sessions orphaned for re-placement,
//! live ones get their dirty model tables pushed.

use crate::backend::BackendHandle;
use crate::client::{BackendEndpoint, ControlTransport};
use crate::frontend::FrontendHandle;
use crate::{Result, SchedulerError};
use mux_core::{
    BackendWorkload, ModelInstanceConfig, ModelSession, NodeId, SchedulerConfig, StaticWorkload,
};
use mux_profile::ProfileDatabase;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

struct State {
    backends: HashMap<NodeId, Arc<BackendHandle>>,
    frontends: HashMap<NodeId, Arc<FrontendHandle>>,
    /// model session id -> hosting backends
    assignments: HashMap<String, Vec<NodeId>>,
    /// static workloads waiting for a backend to register
    static_workloads: VecDeque<BackendWorkload>,
}

/// The singleton placement controller
pub struct Scheduler {
    config: SchedulerConfig,
    profile_db: Arc<ProfileDatabase>,
    transport: Arc<dyn ControlTransport>,
    state: Mutex<State>,
}

impl Scheduler {
    /// Create a scheduler, loading the static workload descriptor named in
    /// the configuration if any
    pub fn new(
        config: SchedulerConfig,
        profile_db: Arc<ProfileDatabase>,
        transport: Arc<dyn ControlTransport>,
    ) -> Result<Self> {
        let workload = match &config.workload {
            Some(path) => {
                let workload = StaticWorkload::load(path)
                    .map_err(|e| SchedulerError::InvalidWorkload(e.to_string()))?;
                info!(
                    "Loaded static workload descriptor: {} backend workloads",
                    workload.len()
                );
                workload
            }
            None => StaticWorkload::default(),
        };
        Ok(Self::with_static_workload(config, profile_db, transport, workload))
    }

    /// Create a scheduler with an in-memory workload descriptor
    pub fn with_static_workload(
        config: SchedulerConfig,
        profile_db: Arc<ProfileDatabase>,
        transport: Arc<dyn ControlTransport>,
        workload: StaticWorkload,
    ) -> Self {
        Self {
            config,
            profile_db,
            transport,
            state: Mutex::new(State {
                backends: HashMap::new(),
                frontends: HashMap::new(),
                assignments: HashMap::new(),
                static_workloads: workload.0.into(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_s)
    }

    /// Admit a backend. If a static workload is pending, the backend is
    /// pinned to the next one in registration order. Returns the liveness
    /// timeout the node must ping within.
    pub async fn register_backend(
        &self,
        node_id: NodeId,
        server_address: String,
        rpc_address: String,
        gpu_device: String,
        gpu_available_memory: u64,
    ) -> Result<u64> {
        let handle = Arc::new(BackendHandle::new(
            node_id.clone(),
            server_address,
            rpc_address.clone(),
            gpu_device,
            gpu_available_memory,
            self.timeout(),
            self.transport.backend(&rpc_address),
        ));

        let mut affected = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.backends.contains_key(&node_id) {
                return Err(SchedulerError::AlreadyRegistered(node_id.to_string()));
            }
            if let Some(workload) = state.static_workloads.pop_front() {
                for entry in &workload.models {
                    if let Err(e) = handle.load_static(&self.profile_db, entry).await {
                        // leave the workload for the next backend
                        state.static_workloads.push_front(workload.clone());
                        return Err(e);
                    }
                    affected.push(entry.session().session_id());
                }
            }
            state.backends.insert(node_id.clone(), Arc::clone(&handle));
            for session_id in &affected {
                state
                    .assignments
                    .entry(session_id.clone())
                    .or_default()
                    .push(node_id.clone());
            }
        }
        info!("Registered backend {}", node_id);

        // push the pinned table right away; the control loop re-drives on
        // failure
        if !affected.is_empty() {
            let _ = handle.update_model_table().await;
            for session_id in affected {
                self.notify_session(&session_id).await;
            }
        }
        Ok(self.config.timeout_s)
    }

    /// Admit a frontend. Returns the liveness timeout it must ping within.
    pub async fn register_frontend(
        &self,
        node_id: NodeId,
        server_address: String,
        rpc_address: String,
    ) -> Result<u64> {
        let handle = Arc::new(FrontendHandle::new(
            node_id.clone(),
            server_address,
            rpc_address.clone(),
            self.timeout(),
            self.transport.frontend(&rpc_address),
        ));
        let mut state = self.state.lock().await;
        if state.frontends.contains_key(&node_id) {
            return Err(SchedulerError::AlreadyRegistered(node_id.to_string()));
        }
        state.frontends.insert(node_id.clone(), handle);
        info!("Registered frontend {}", node_id);
        Ok(self.config.timeout_s)
    }

    /// Refresh a node's liveness timestamp
    pub async fn keep_alive(&self, node_id: &NodeId) -> Result<()> {
        let state = self.state.lock().await;
        if let Some(backend) = state.backends.get(node_id) {
            backend.touch().await;
            return Ok(());
        }
        if let Some(frontend) = state.frontends.get(node_id) {
            frontend.touch().await;
            return Ok(());
        }
        Err(SchedulerError::NotRegistered(node_id.to_string()))
    }

    /// Subscribe a frontend to a model session; returns the current
    /// hosting backends
    pub async fn subscribe_model(
        &self,
        frontend_id: &NodeId,
        session_id: &str,
    ) -> Result<Vec<BackendEndpoint>> {
        let state = self.state.lock().await;
        let frontend = state
            .frontends
            .get(frontend_id)
            .ok_or_else(|| SchedulerError::NotRegistered(frontend_id.to_string()))?;
        frontend.subscribe_model(session_id).await;
        Ok(Self::endpoints(&state, session_id))
    }

    /// Place a model session onto some idle backend, sized for
    /// `workload` queries per second (zero = saturate). Among feasible
    /// candidates the highest-occupancy placement wins. A session that is
    /// already placed returns its existing config.
    pub async fn load_model(
        &self,
        session: &ModelSession,
        workload: f64,
    ) -> Result<ModelInstanceConfig> {
        let session_id = session.session_id();
        let committed = {
            let mut state = self.state.lock().await;

            if let Some(existing) = Self::existing_config(&state, &session_id).await {
                return Ok(existing);
            }

            let mut best: Option<(Arc<BackendHandle>, ModelInstanceConfig, f64)> = None;
            for handle in state.backends.values() {
                let (config, occupancy) = handle
                    .prepare_load_model(&self.profile_db, session, workload)
                    .await;
                if !config.is_feasible() {
                    continue;
                }
                let better = best
                    .as_ref()
                    .map_or(true, |(_, _, best_occ)| occupancy > *best_occ);
                if better {
                    best = Some((Arc::clone(handle), config, occupancy));
                }
            }
            let (handle, config, occupancy) = best.ok_or_else(|| {
                SchedulerError::placement(&session_id, "no backend can host this session")
            })?;
            handle.load_model(config.clone()).await?;
            info!(
                "Placed {} on backend {} (batch {}, occupancy {:.2})",
                session_id,
                handle.node_id(),
                config.batch,
                occupancy
            );
            state
                .assignments
                .entry(session_id.clone())
                .or_default()
                .push(handle.node_id().clone());
            (handle, config)
        };

        let (handle, config) = committed;
        let _ = handle.update_model_table().await;
        self.notify_session(&session_id).await;
        Ok(config)
    }

    /// The backends currently hosting a session
    pub async fn backends_for(&self, session_id: &str) -> Vec<BackendEndpoint> {
        let state = self.state.lock().await;
        Self::endpoints(&state, session_id)
    }

    /// One pass of the control loop: drop dead nodes, push dirty tables
    pub async fn tick(&self) {
        let backends: Vec<Arc<BackendHandle>> = {
            let state = self.state.lock().await;
            state.backends.values().cloned().collect()
        };
        for handle in backends {
            if handle.is_alive().await {
                handle.update_model_table().await;
            } else {
                warn!("Backend {} is unreachable", handle.node_id());
                self.remove_backend(handle.node_id()).await;
            }
        }

        let frontends: Vec<Arc<FrontendHandle>> = {
            let state = self.state.lock().await;
            state.frontends.values().cloned().collect()
        };
        for handle in frontends {
            if !handle.is_alive().await {
                warn!("Frontend {} is unreachable", handle.node_id());
                self.state.lock().await.frontends.remove(handle.node_id());
            }
        }
    }

    /// Run the control loop until the process exits
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.tick_interval_s));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Drop a backend and orphan its sessions; orphans are candidates for
    /// re-placement on a later `load_model`
    async fn remove_backend(&self, node_id: &NodeId) {
        let orphaned = {
            let mut state = self.state.lock().await;
            state.backends.remove(node_id);
            let mut orphaned = Vec::new();
            state.assignments.retain(|session_id, nodes| {
                let before = nodes.len();
                nodes.retain(|n| n != node_id);
                if nodes.len() != before {
                    orphaned.push(session_id.clone());
                }
                !nodes.is_empty()
            });
            orphaned
        };
        for session_id in orphaned {
            warn!(
                "Session {} lost backend {}; eligible for re-placement",
                session_id, node_id
            );
            self.notify_session(&session_id).await;
        }
    }

    /// Push the current backend list for a session to every subscribed
    /// frontend
    async fn notify_session(&self, session_id: &str) {
        let (endpoints, subscribers) = {
            let state = self.state.lock().await;
            let endpoints = Self::endpoints(&state, session_id);
            let mut subscribers = Vec::new();
            for frontend in state.frontends.values() {
                if frontend.is_subscribed(session_id).await {
                    subscribers.push(Arc::clone(frontend));
                }
            }
            (endpoints, subscribers)
        };
        for frontend in subscribers {
            frontend.push_backend_list(session_id, endpoints.clone()).await;
        }
    }

    fn endpoints(state: &State, session_id: &str) -> Vec<BackendEndpoint> {
        state
            .assignments
            .get(session_id)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|node_id| state.backends.get(node_id))
                    .map(|handle| BackendEndpoint {
                        node_id: handle.node_id().clone(),
                        server_address: handle.server_address().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn existing_config(state: &State, session_id: &str) -> Option<ModelInstanceConfig> {
        let nodes = state.assignments.get(session_id)?;
        for node_id in nodes {
            let Some(handle) = state.backends.get(node_id) else {
                continue;
            };
            for config in handle.model_table().await {
                if config.session.session_id() == session_id {
                    return Some(config);
                }
            }
        }
        None
    }
}
