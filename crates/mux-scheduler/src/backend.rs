//! Scheduler-side backend state and the placement engine
//!
//! A [`BackendHandle`] tracks one registered backend: its GPU, free
//! memory, loaded model configs, the exec/duty cycle of its schedule, a
//! dirty flag for pending model-table pushes, and the liveness timestamp.
//!
//! Placement works against offline profile curves. For an idle backend,
//! `prepare_load_model` either saturates the GPU (workload unknown or at
//! least the profile's peak throughput) or sizes a smaller batch for a
//! residue load so that queueing plus service still fits the SLA:
//!
//! ```text
//! (batch - 1) / workload + forward(batch) + pre + post <= latency_sla
//! ```
//!
//! A backend that already runs a model rejects further placement; packing
//! a second tenant would need a full re-solve of the cyclic schedule.

use crate::client::BackendControl;
use crate::{Result, SchedulerError};
use chrono::{DateTime, Utc};
use mux_core::{CtrlStatus, ModelInstanceConfig, ModelSession, ModelTableConfig, NodeId, WorkloadEntry};
use mux_profile::ProfileDatabase;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

struct BackendState {
    model_table: Vec<ModelInstanceConfig>,
    /// Total GPU busy time per duty cycle, microseconds
    exec_cycle_us: f64,
    /// Period of the cyclic schedule, microseconds
    duty_cycle_us: f64,
    dirty: bool,
    last_alive: DateTime<Utc>,
}

/// One registered backend, as the scheduler sees it
pub struct BackendHandle {
    node_id: NodeId,
    server_address: String,
    rpc_address: String,
    gpu_device: String,
    gpu_available_memory: u64,
    timeout: Duration,
    ctrl: Arc<dyn BackendControl>,
    state: Mutex<BackendState>,
}

impl BackendHandle {
    pub fn new(
        node_id: NodeId,
        server_address: impl Into<String>,
        rpc_address: impl Into<String>,
        gpu_device: impl Into<String>,
        gpu_available_memory: u64,
        timeout: Duration,
        ctrl: Arc<dyn BackendControl>,
    ) -> Self {
        Self {
            node_id,
            server_address: server_address.into(),
            rpc_address: rpc_address.into(),
            gpu_device: gpu_device.into(),
            gpu_available_memory,
            timeout,
            ctrl,
            state: Mutex::new(BackendState {
                model_table: Vec::new(),
                exec_cycle_us: 0.0,
                duty_cycle_us: 0.0,
                dirty: false,
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

    pub fn gpu_device(&self) -> &str {
        &self.gpu_device
    }

    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.exec_cycle_us == 0.0
    }

    pub async fn exec_cycle_us(&self) -> f64 {
        self.state.lock().await.exec_cycle_us
    }

    pub async fn duty_cycle_us(&self) -> f64 {
        self.state.lock().await.duty_cycle_us
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Snapshot of the loaded model configs
    pub async fn model_table(&self) -> Vec<ModelInstanceConfig> {
        self.state.lock().await.model_table.clone()
    }

    /// Refresh the liveness timestamp (keep-alive path)
    pub async fn touch(&self) {
        self.state.lock().await.last_alive = Utc::now();
    }

    /// Ingest a backend's periodic stats report. The per-session rates do
    /// not feed back into placement yet; the report counts as liveness
    /// traffic.
    pub async fn update_stats(&self, _session_rates: &HashMap<String, f64>) {
        self.state.lock().await.last_alive = Utc::now();
    }

    /// Compute the placement this backend could host for `session` under
    /// `workload` queries per second (zero = unknown, saturate). Returns
    /// the config and the GPU occupancy it implies; an infeasible
    /// placement comes back with `batch == 0` and occupancy zero.
    pub async fn prepare_load_model(
        &self,
        profile_db: &ProfileDatabase,
        session: &ModelSession,
        workload: f64,
    ) -> (ModelInstanceConfig, f64) {
        let infeasible = (ModelInstanceConfig::infeasible(session.clone()), 0.0);
        let profile = match profile_db.get(&self.gpu_device, &session.profile_id()) {
            Some(profile) => profile,
            None => return infeasible,
        };

        let latency_sla_us = session.latency_sla_ms as f64 * 1000.0;
        let (max_batch, max_throughput) = profile.max_throughput(session.latency_sla_ms);
        if max_batch == 0 {
            // forward latency of batch size 1 already exceeds the SLA
            return infeasible;
        }

        let state = self.state.lock().await;
        if state.exec_cycle_us > 0.0 {
            // multi-tenant packing would need a full re-solve; reject
            return infeasible;
        }

        if workload == 0.0 || max_throughput <= workload {
            // the workload saturates an empty GPU
            let forward_latency_us = match profile.forward_latency(max_batch) {
                Some(latency) => latency,
                None => return infeasible,
            };
            let memory_usage = profile.memory_usage(max_batch).unwrap_or(u64::MAX);
            if memory_usage > self.gpu_available_memory {
                return infeasible;
            }
            let config = ModelInstanceConfig {
                session: session.clone(),
                batch: max_batch,
                max_batch,
                forward_latency_us,
                memory_usage,
                throughput: max_throughput,
                workload: max_throughput,
            };
            return (config, 1.0);
        }

        // residue load: find the largest batch whose accumulation wait
        // plus service time still fits the SLA
        let preprocess = profile.preprocess_latency();
        let postprocess = profile.postprocess_latency();
        let mut batch = 1u32;
        while batch <= max_batch {
            let forward = match profile.forward_latency(batch) {
                Some(latency) => latency,
                None => break,
            };
            // batch = ceil(workload * duty_cycle), so the duty cycle must
            // be at least (batch - 1) / workload
            let min_duty_cycle_us = (batch - 1) as f64 * 1e6 / workload;
            if min_duty_cycle_us + forward + preprocess + postprocess > latency_sla_us {
                break;
            }
            batch += 1;
        }
        batch -= 1;
        if batch == 0 {
            return infeasible;
        }
        let forward_latency_us = match profile.forward_latency(batch) {
            Some(latency) => latency,
            None => return infeasible,
        };
        let memory_usage = profile.memory_usage(batch).unwrap_or(u64::MAX);
        if memory_usage > self.gpu_available_memory {
            return infeasible;
        }
        let duty_cycle_us = latency_sla_us - forward_latency_us - preprocess - postprocess;
        let throughput = batch as f64 * 1e6 / duty_cycle_us;
        let config = ModelInstanceConfig {
            session: session.clone(),
            batch,
            max_batch,
            forward_latency_us,
            memory_usage,
            throughput,
            workload,
        };
        (config, forward_latency_us / duty_cycle_us)
    }

    /// Commit a placement computed by `prepare_load_model`
    pub async fn load_model(&self, config: ModelInstanceConfig) -> Result<()> {
        if !config.is_feasible() {
            return Err(SchedulerError::placement(
                config.session.session_id(),
                "cannot commit an infeasible placement",
            ));
        }
        let mut state = self.state.lock().await;
        if state.exec_cycle_us > 0.0 {
            return Err(SchedulerError::BackendNotIdle(self.node_id.to_string()));
        }
        state.exec_cycle_us = config.forward_latency_us;
        state.duty_cycle_us =
            config.session.latency_sla_ms as f64 * 1e3 - state.exec_cycle_us;
        info!(
            "Backend {} loads {} (batch {}): exec cycle {} us, duty cycle {} us",
            self.node_id,
            config.session.session_id(),
            config.batch,
            state.exec_cycle_us,
            state.duty_cycle_us
        );
        state.model_table.push(config);
        state.dirty = true;
        Ok(())
    }

    /// Pin a fixed batch from a static workload descriptor. Unlike
    /// `load_model` this *adds* to an already loaded backend, growing the
    /// duty cycle and rewriting every loaded config's throughput under the
    /// new cycle. SLA feasibility is the operator's responsibility.
    pub async fn load_static(
        &self,
        profile_db: &ProfileDatabase,
        entry: &WorkloadEntry,
    ) -> Result<()> {
        let session = entry.session();
        let profile = profile_db
            .get(&self.gpu_device, &session.profile_id())
            .ok_or_else(|| {
                SchedulerError::placement(session.session_id(), "no profile for this gpu")
            })?;
        let batch = entry.batch;
        let max_batch = batch;
        let forward_latency_us = profile.forward_latency(batch).ok_or_else(|| {
            SchedulerError::placement(
                session.session_id(),
                format!("profile has no measurement for batch {}", batch),
            )
        })?;
        let memory_usage = profile.memory_usage(max_batch).unwrap_or(0);

        let mut state = self.state.lock().await;
        state.model_table.push(ModelInstanceConfig {
            session: session.clone(),
            batch,
            max_batch,
            forward_latency_us,
            memory_usage,
            throughput: 0.0,
            workload: 0.0,
        });
        state.exec_cycle_us += forward_latency_us;
        state.duty_cycle_us += forward_latency_us;
        let duty_cycle_us = state.duty_cycle_us;
        for cfg in &mut state.model_table {
            let throughput = cfg.batch as f64 * 1e6 / duty_cycle_us;
            cfg.throughput = throughput;
            cfg.workload = throughput;
        }
        state.dirty = true;
        info!(
            "Backend {} pins {} (batch {}): exec cycle {} us, duty cycle {} us",
            self.node_id,
            session.session_id(),
            batch,
            state.exec_cycle_us,
            state.duty_cycle_us
        );
        Ok(())
    }

    /// Push the model table if it changed since the last successful push.
    /// A clean table returns `Ok` without an RPC.
    pub async fn update_model_table(&self) -> CtrlStatus {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return CtrlStatus::Ok;
        }
        let table = ModelTableConfig {
            duty_cycle_us: state.duty_cycle_us,
            instances: state.model_table.clone(),
        };
        match self.ctrl.update_model_table(table).await {
            Ok(status) => {
                state.last_alive = Utc::now();
                if status.is_ok() {
                    state.dirty = false;
                }
                status
            }
            Err(e) => {
                warn!("Backend {} model table push failed: {}", self.node_id, e);
                CtrlStatus::ServerUnreachable
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
                warn!("Backend {} liveness ping failed: {}", self.node_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBackendControl;
    use mux_profile::{ForwardEntry, LatencyStat, ModelProfile};
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    /// Forward latencies (ms) for batches 1..=16 with pre=2ms, post=1ms:
    /// 5, 8, 10, 15, 16, 17, 18, 20, 21, 22, 24, 25, 27, 28, 29, 30
    fn profile_db() -> ProfileDatabase {
        let latencies_ms = [5, 8, 10, 15, 16, 17, 18, 20, 21, 22, 24, 25, 27, 28, 29, 30];
        let forward = latencies_ms
            .iter()
            .enumerate()
            .map(|(i, ms)| {
                (
                    i as u32 + 1,
                    ForwardEntry {
                        latency_us: *ms as f64 * 1000.0,
                        std_us: 100.0,
                        memory_bytes: (i as u64 + 1) * (384 << 20),
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
        db
    }

    fn session() -> ModelSession {
        ModelSession::new("tensorflow", "resnet50", 1, 50)
    }

    fn handle_with(
        ctrl: Arc<MockBackendControl>,
        gpu_memory: u64,
        timeout: Duration,
    ) -> BackendHandle {
        BackendHandle::new(
            NodeId::new("backend-1"),
            "10.0.0.1:8001",
            "10.0.0.1:8002",
            "TITAN_X",
            gpu_memory,
            timeout,
            ctrl,
        )
    }

    fn handle() -> BackendHandle {
        handle_with(MockBackendControl::new(), 8 << 30, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_saturating_placement_uses_max_batch() {
        let db = profile_db();
        let backend = handle();
        // workload 0 = unknown: saturate the GPU
        let (config, occupancy) = backend.prepare_load_model(&db, &session(), 0.0).await;
        assert_eq!(config.batch, 16);
        assert_eq!(config.max_batch, 16);
        assert_eq!(config.forward_latency_us, 30_000.0);
        // 16 * 1e6 / 30000 ~= 533 qps
        assert!((config.throughput - 533.333).abs() < 0.1);
        assert_eq!(config.workload, config.throughput);
        assert_eq!(config.memory_usage, 16 * (384 << 20));
        assert_eq!(occupancy, 1.0);
    }

    #[tokio::test]
    async fn test_residue_placement_sizes_batch_for_workload() {
        let db = profile_db();
        let backend = handle();
        // 100 qps against a 533 qps peak: batch 4 is the largest where
        // (batch-1)*10ms + forward + 3ms fits inside 50ms
        let (config, occupancy) = backend.prepare_load_model(&db, &session(), 100.0).await;
        assert_eq!(config.batch, 4);
        assert_eq!(config.max_batch, 16);
        assert_eq!(config.forward_latency_us, 15_000.0);
        // duty cycle = 50 - 15 - 2 - 1 = 32 ms
        assert!((config.throughput - 4.0 * 1e6 / 32_000.0).abs() < 1e-6);
        assert_eq!(config.workload, 100.0);
        assert!((occupancy - 15_000.0 / 32_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_placement_rejects_missing_profile() {
        let db = profile_db();
        let backend = handle();
        let unknown = ModelSession::new("caffe", "vgg16", 1, 50);
        let (config, occupancy) = backend.prepare_load_model(&db, &unknown, 0.0).await;
        assert!(!config.is_feasible());
        assert_eq!(occupancy, 0.0);
    }

    #[tokio::test]
    async fn test_placement_rejects_tight_sla() {
        let db = profile_db();
        let backend = handle();
        // batch 1 costs 5 + 2 + 1 = 8 ms; a 7 ms SLA admits nothing
        let tight = ModelSession::new("tensorflow", "resnet50", 1, 7);
        let (config, _) = backend.prepare_load_model(&db, &tight, 0.0).await;
        assert!(!config.is_feasible());
    }

    #[tokio::test]
    async fn test_placement_rejects_memory_overflow() {
        let db = profile_db();
        // batch 16 needs 6 GB; only 4 GB free
        let backend = handle_with(MockBackendControl::new(), 4 << 30, Duration::from_secs(5));
        let (config, _) = backend.prepare_load_model(&db, &session(), 0.0).await;
        assert!(!config.is_feasible());
    }

    #[tokio::test]
    async fn test_placement_rejects_non_idle_backend() {
        let db = profile_db();
        let backend = handle();
        let (config, _) = backend.prepare_load_model(&db, &session(), 0.0).await;
        backend.load_model(config).await.unwrap();

        let other = ModelSession::new("tensorflow", "resnet50", 1, 100);
        let (config, _) = backend.prepare_load_model(&db, &other, 50.0).await;
        assert!(!config.is_feasible());
    }

    #[tokio::test]
    async fn test_load_model_commit_sets_cycles() {
        let db = profile_db();
        let backend = handle();
        assert!(backend.is_idle().await);

        let (config, _) = backend.prepare_load_model(&db, &session(), 0.0).await;
        backend.load_model(config.clone()).await.unwrap();

        assert!(!backend.is_idle().await);
        assert_eq!(backend.exec_cycle_us().await, 30_000.0);
        assert_eq!(backend.duty_cycle_us().await, 50_000.0 - 30_000.0);
        assert!(backend.is_dirty().await);
        assert_eq!(backend.model_table().await, vec![config.clone()]);

        // a second commit must be refused
        assert!(matches!(
            backend.load_model(config).await,
            Err(SchedulerError::BackendNotIdle(_))
        ));
    }

    #[tokio::test]
    async fn test_static_load_grows_cycle_and_rewrites_throughput() {
        let db = profile_db();
        let backend = handle();
        let first = WorkloadEntry {
            framework: "tensorflow".to_string(),
            model_name: "resnet50".to_string(),
            version: 1,
            latency_sla: 50,
            image_height: None,
            image_width: None,
            batch: 8,
        };
        backend.load_static(&db, &first).await.unwrap();
        assert_eq!(backend.exec_cycle_us().await, 20_000.0);
        assert_eq!(backend.duty_cycle_us().await, 20_000.0);
        let table = backend.model_table().await;
        assert!((table[0].throughput - 8.0 * 1e6 / 20_000.0).abs() < 1e-6);

        // pinning a second model grows the shared duty cycle and rewrites
        // every config's throughput under it
        let second = WorkloadEntry { batch: 4, ..first.clone() };
        backend.load_static(&db, &second).await.unwrap();
        assert_eq!(backend.exec_cycle_us().await, 35_000.0);
        assert_eq!(backend.duty_cycle_us().await, 35_000.0);
        let table = backend.model_table().await;
        assert_eq!(table.len(), 2);
        assert!((table[0].throughput - 8.0 * 1e6 / 35_000.0).abs() < 1e-6);
        assert!((table[1].throughput - 4.0 * 1e6 / 35_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_static_load_rejects_unprofiled_batch() {
        let db = profile_db();
        let backend = handle();
        let entry = WorkloadEntry {
            framework: "tensorflow".to_string(),
            model_name: "resnet50".to_string(),
            version: 1,
            latency_sla: 50,
            image_height: None,
            image_width: None,
            batch: 99,
        };
        assert!(backend.load_static(&db, &entry).await.is_err());
    }

    #[tokio::test]
    async fn test_dirty_flag_push_protocol() {
        let db = profile_db();
        let ctrl = MockBackendControl::new();
        let backend = handle_with(Arc::clone(&ctrl), 8 << 30, Duration::from_secs(5));

        // clean table: no RPC at all
        assert!(backend.update_model_table().await.is_ok());
        assert_eq!(ctrl.update_calls.load(Ordering::Relaxed), 0);

        let (config, _) = backend.prepare_load_model(&db, &session(), 0.0).await;
        backend.load_model(config).await.unwrap();
        assert!(backend.is_dirty().await);

        assert!(backend.update_model_table().await.is_ok());
        assert_eq!(ctrl.update_calls.load(Ordering::Relaxed), 1);
        assert!(!backend.is_dirty().await);
        let pushed = ctrl.last_table().await.unwrap();
        assert_eq!(pushed.instances.len(), 1);
        assert_eq!(pushed.duty_cycle_us, 20_000.0);

        // idempotent: the second push is a no-op without an RPC
        assert!(backend.update_model_table().await.is_ok());
        assert_eq!(ctrl.update_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failed_push_keeps_table_dirty() {
        let db = profile_db();
        let ctrl = MockBackendControl::new();
        let backend = handle_with(Arc::clone(&ctrl), 8 << 30, Duration::from_secs(5));
        let (config, _) = backend.prepare_load_model(&db, &session(), 0.0).await;
        backend.load_model(config).await.unwrap();

        ctrl.set_fail_update(true);
        assert_eq!(
            backend.update_model_table().await,
            CtrlStatus::ServerUnreachable
        );
        assert!(backend.is_dirty().await);

        // the next tick re-drives the push
        ctrl.set_fail_update(false);
        assert!(backend.update_model_table().await.is_ok());
        assert!(!backend.is_dirty().await);
    }

    #[tokio::test]
    async fn test_liveness_pings_after_timeout() {
        let ctrl = MockBackendControl::new();
        let backend = handle_with(Arc::clone(&ctrl), 8 << 30, Duration::from_millis(50));

        // fresh registration: within the timeout, no ping
        assert!(backend.is_alive().await);
        assert_eq!(ctrl.check_calls.load(Ordering::Relaxed), 0);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(backend.is_alive().await);
        assert_eq!(ctrl.check_calls.load(Ordering::Relaxed), 1);

        // the successful ping refreshed last_alive
        assert!(backend.is_alive().await);
        assert_eq!(ctrl.check_calls.load(Ordering::Relaxed), 1);

        tokio::time::sleep(Duration::from_millis(70)).await;
        ctrl.set_alive(false);
        assert!(!backend.is_alive().await);
    }

    #[tokio::test]
    async fn test_stats_report_counts_as_liveness() {
        let ctrl = MockBackendControl::new();
        let backend = handle_with(Arc::clone(&ctrl), 8 << 30, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(70)).await;
        backend.update_stats(&HashMap::new()).await;
        assert!(backend.is_alive().await);
        assert_eq!(ctrl.check_calls.load(Ordering::Relaxed), 0);
    }
}
