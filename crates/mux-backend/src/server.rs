//! The backend worker
//!
//! A `BackendServer` owns one GPU's model table: a map from model session
//! id to a running [`ModelExecutor`]. The table is mutated only by
//! `UpdateModelTable` pushes from the scheduler; the serving path routes
//! queries into executors by session id. Executors torn down by a table
//! update drain their queues before exiting, so no admitted task is lost
//! across an update.

use crate::executor::ModelExecutor;
use crate::model::ModelFactory;
use crate::postprocess::PostprocessQueue;
use crate::task::{Task, TaskReply};
use crate::{BackendError, Result};
use chrono::{DateTime, Utc};
use mux_core::{BackendConfig, ModelManifest, ModelTableConfig};
use mux_profile::ProfileDatabase;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

/// A running executor plus the channels that drive its drain loop
struct ExecutorHandle {
    executor: Arc<ModelExecutor>,
    duty_tx: watch::Sender<Duration>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: JoinHandle<()>,
}

/// One GPU worker hosting a model table
pub struct BackendServer {
    config: BackendConfig,
    manifest: Option<ModelManifest>,
    profile_db: Arc<ProfileDatabase>,
    factory: Arc<dyn ModelFactory>,
    table: RwLock<HashMap<String, ExecutorHandle>>,
    post_queue: PostprocessQueue,
    _post_handles: Vec<JoinHandle<()>>,
    next_tid: AtomicU64,
}

impl BackendServer {
    pub fn new(
        config: BackendConfig,
        manifest: Option<ModelManifest>,
        profile_db: Arc<ProfileDatabase>,
        factory: Arc<dyn ModelFactory>,
    ) -> Arc<Self> {
        let (post_queue, post_handles) = PostprocessQueue::start(config.postprocess_workers);
        Arc::new(Self {
            config,
            manifest,
            profile_db,
            factory,
            table: RwLock::new(HashMap::new()),
            post_queue,
            _post_handles: post_handles,
            next_tid: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Reconcile the model table with the scheduler's desired state:
    /// create executors for new sessions, update batch and cadence for
    /// survivors, tear down executors that disappeared.
    pub async fn update_model_table(&self, table: ModelTableConfig) -> Result<()> {
        let duty_cycle = Duration::from_micros(table.duty_cycle_us.max(0.0) as u64);
        let desired: HashMap<String, _> = table
            .instances
            .into_iter()
            .filter(|cfg| cfg.is_feasible())
            .map(|cfg| (cfg.session.session_id(), cfg))
            .collect();

        let mut current = self.table.write().await;

        let removed: Vec<String> = current
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();
        for key in removed {
            if let Some(handle) = current.remove(&key) {
                info!("Unloading model session {}", key);
                let _ = handle.shutdown_tx.send(true);
                // the drain loop serves remaining inputs, then exits
                drop(handle.loop_handle);
            }
        }

        for (key, cfg) in desired {
            if let Some(handle) = current.get(&key) {
                handle.executor.set_batch(cfg.batch);
                let _ = handle.duty_tx.send(duty_cycle);
                continue;
            }
            let entry = self.manifest.as_ref().and_then(|manifest| {
                manifest.get(&cfg.session.framework, &cfg.session.model_name, cfg.session.version)
            });
            let model = self
                .factory
                .create(self.config.gpu, &cfg.session, entry, cfg.max_batch)
                .await?;
            let profile = self
                .profile_db
                .get(&self.config.gpu_device, &cfg.session.profile_id());
            let executor = Arc::new(ModelExecutor::new(
                model,
                profile,
                cfg.batch,
                cfg.max_batch,
                self.post_queue.clone(),
            ));
            let (duty_tx, duty_rx) = watch::channel(duty_cycle);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let loop_handle = tokio::spawn(Arc::clone(&executor).run_loop(duty_rx, shutdown_rx));
            info!(
                "Loaded model session {} (batch {}, max_batch {}, duty cycle {} us)",
                key,
                cfg.batch,
                cfg.max_batch,
                duty_cycle.as_micros()
            );
            current.insert(
                key,
                ExecutorHandle {
                    executor,
                    duty_tx,
                    shutdown_tx,
                    loop_handle,
                },
            );
        }
        Ok(())
    }

    /// Route one query to the executor hosting its model session. Rejects
    /// queries whose deadline already passed at admission.
    pub async fn enqueue_query(
        &self,
        session_id: &str,
        query_id: u64,
        deadline: Instant,
        payload: &[u8],
    ) -> Result<oneshot::Receiver<TaskReply>> {
        if deadline <= Instant::now() {
            return Err(BackendError::DeadlineMiss(query_id));
        }
        let (executor, model) = {
            let table = self.table.read().await;
            let handle = table
                .get(session_id)
                .ok_or_else(|| BackendError::ModelNotLoaded(session_id.to_string()))?;
            (Arc::clone(&handle.executor), Arc::clone(handle.executor.model()))
        };

        let tensors = model.preprocess(payload).await?;
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let (task, reply_rx) = Task::new(tid, query_id, session_id, deadline, tensors);
        task.record("preprocess");
        executor.add_task(task);
        Ok(reply_rx)
    }

    /// Cheap liveness probe
    pub fn check_alive(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Session ids currently loaded
    pub async fn loaded_sessions(&self) -> Vec<String> {
        self.table.read().await.keys().cloned().collect()
    }

    /// Runtime batch size of one loaded session, if present
    pub async fn session_batch(&self, session_id: &str) -> Option<u32> {
        self.table
            .read()
            .await
            .get(session_id)
            .map(|handle| handle.executor.batch())
    }

    /// Tear down every executor, draining their queues first
    pub async fn shutdown(&self) {
        let mut table = self.table.write().await;
        for (key, handle) in table.drain() {
            info!("Unloading model session {}", key);
            let _ = handle.shutdown_tx.send(true);
            let _ = handle.loop_handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockModelFactory;
    use mux_core::{ModelInstanceConfig, ModelSession, NodeId};

    fn config() -> BackendConfig {
        BackendConfig {
            node_id: NodeId::new("backend-1"),
            gpu: 0,
            gpu_device: "TITAN_X".to_string(),
            gpu_memory: 8 << 30,
            scheduler_addr: "127.0.0.1:10001".to_string(),
            port: 8001,
            rpc_port: 8002,
            model_root: "/tmp/models".into(),
            postprocess_workers: 1,
        }
    }

    fn instance_config(name: &str, sla: u32, batch: u32) -> ModelInstanceConfig {
        ModelInstanceConfig {
            session: ModelSession::new("tensorflow", name, 1, sla),
            batch,
            max_batch: batch.max(8),
            forward_latency_us: 20_000.0,
            memory_usage: 1 << 30,
            throughput: 100.0,
            workload: 100.0,
        }
    }

    fn server() -> Arc<BackendServer> {
        BackendServer::new(
            config(),
            None,
            Arc::new(ProfileDatabase::empty()),
            Arc::new(MockModelFactory),
        )
    }

    #[tokio::test]
    async fn test_update_model_table_reconciles() {
        let server = server();
        let resnet = instance_config("resnet50", 50, 4);
        let vgg = instance_config("vgg16", 100, 2);
        let resnet_id = resnet.session.session_id();
        let vgg_id = vgg.session.session_id();

        server
            .update_model_table(ModelTableConfig {
                duty_cycle_us: 30_000.0,
                instances: vec![resnet.clone(), vgg.clone()],
            })
            .await
            .unwrap();
        let mut sessions = server.loaded_sessions().await;
        sessions.sort();
        assert_eq!(sessions.len(), 2);
        assert_eq!(server.session_batch(&resnet_id).await, Some(4));

        // update one, drop the other
        let mut resnet_bigger = resnet.clone();
        resnet_bigger.batch = 6;
        server
            .update_model_table(ModelTableConfig {
                duty_cycle_us: 30_000.0,
                instances: vec![resnet_bigger],
            })
            .await
            .unwrap();
        assert_eq!(server.loaded_sessions().await, vec![resnet_id.clone()]);
        assert_eq!(server.session_batch(&resnet_id).await, Some(6));
        assert_eq!(server.session_batch(&vgg_id).await, None);
    }

    #[tokio::test]
    async fn test_update_model_table_is_idempotent() {
        let server = server();
        let table = ModelTableConfig {
            duty_cycle_us: 30_000.0,
            instances: vec![instance_config("resnet50", 50, 4)],
        };
        server.update_model_table(table.clone()).await.unwrap();
        server.update_model_table(table).await.unwrap();
        assert_eq!(server.loaded_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_unknown_session_fails() {
        let server = server();
        let result = server
            .enqueue_query(
                "tensorflow:resnet50:1:50",
                1,
                Instant::now() + Duration::from_millis(50),
                b"payload",
            )
            .await;
        assert!(matches!(result, Err(BackendError::ModelNotLoaded(_))));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_expired_deadline() {
        let server = server();
        server
            .update_model_table(ModelTableConfig {
                duty_cycle_us: 10_000.0,
                instances: vec![instance_config("resnet50", 50, 4)],
            })
            .await
            .unwrap();
        let result = server
            .enqueue_query(
                "tensorflow:resnet50:1:50",
                1,
                Instant::now() - Duration::from_millis(1),
                b"payload",
            )
            .await;
        assert!(matches!(result, Err(BackendError::DeadlineMiss(1))));
    }

    #[tokio::test]
    async fn test_enqueue_serves_query_end_to_end() {
        let server = server();
        server
            .update_model_table(ModelTableConfig {
                duty_cycle_us: 5_000.0,
                instances: vec![instance_config("resnet50", 50, 4)],
            })
            .await
            .unwrap();

        let rx = server
            .enqueue_query(
                "tensorflow:resnet50:1:50",
                7,
                Instant::now() + Duration::from_millis(200),
                b"payload",
            )
            .await
            .unwrap();
        let reply = rx.await.unwrap();
        assert_eq!(reply.query_id, 7);
        assert!(reply.status.is_ok());
    }

    #[tokio::test]
    async fn test_teardown_serves_inflight_queries() {
        let server = server();
        server
            .update_model_table(ModelTableConfig {
                // a long duty cycle so the query is still queued when the
                // table update removes its executor
                duty_cycle_us: 60_000_000.0,
                instances: vec![instance_config("resnet50", 50, 4)],
            })
            .await
            .unwrap();

        let rx = server
            .enqueue_query(
                "tensorflow:resnet50:1:50",
                9,
                Instant::now() + Duration::from_secs(5),
                b"payload",
            )
            .await
            .unwrap();

        server
            .update_model_table(ModelTableConfig::empty())
            .await
            .unwrap();
        let reply = rx.await.unwrap();
        assert_eq!(reply.query_id, 9);
    }
}
