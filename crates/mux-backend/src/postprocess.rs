//! The shared postprocess stage
//!
//! Every model executor on a backend hands completed tasks to one
//! process-wide queue; a small worker pool drains it, runs the model's
//! postprocess, and delivers the reply. Keeping postprocess off the
//! executor tick keeps the GPU drain loop free of per-task result work.

use crate::model::ModelInstance;
use crate::task::Task;
use mux_core::CtrlStatus;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One queued unit of postprocess work
pub struct PostprocessItem {
    pub task: Arc<Task>,
    pub model: Arc<dyn ModelInstance>,
}

/// Multi-producer postprocess queue with an attached worker pool
#[derive(Clone)]
pub struct PostprocessQueue {
    tx: mpsc::UnboundedSender<PostprocessItem>,
}

impl PostprocessQueue {
    /// Start `workers` drain workers and return the queue plus their join
    /// handles. The workers exit when every queue clone is dropped.
    pub fn start(workers: usize) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::unbounded_channel::<PostprocessItem>();
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let item = { rx.lock().await.recv().await };
                        match item {
                            Some(item) => run_postprocess(worker_id, item).await,
                            None => break,
                        }
                    }
                    debug!("Postprocess worker {} exiting", worker_id);
                })
            })
            .collect();
        (Self { tx }, handles)
    }

    /// Enqueue a completed task for postprocess
    pub fn push(&self, task: Arc<Task>, model: Arc<dyn ModelInstance>) {
        if self.tx.send(PostprocessItem { task, model }).is_err() {
            warn!("Postprocess queue closed; dropping task");
        }
    }
}

async fn run_postprocess(worker_id: usize, item: PostprocessItem) {
    let PostprocessItem { task, model } = item;
    if let Err(e) = model.postprocess(&task).await {
        warn!(
            "Postprocess worker {} failed task {} (query {}): {}",
            worker_id, task.tid, task.query_id, e
        );
        task.set_error(CtrlStatus::InternalError);
    }
    task.record("postprocess");
    task.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockModelInstance;
    use crate::tensor::{Device, Tensor};
    use mux_core::ModelSession;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_queue_delivers_replies() {
        let (queue, _handles) = PostprocessQueue::start(2);
        let model: Arc<dyn ModelInstance> = Arc::new(MockModelInstance::new(
            ModelSession::new("tensorflow", "resnet50", 1, 50),
            0,
        ));

        let mut receivers = Vec::new();
        for i in 0..4u64 {
            let (task, rx) = Task::new(
                i,
                i,
                "s",
                Instant::now() + Duration::from_secs(1),
                vec![Tensor::zeros(4, Device::Cpu)],
            );
            task.add_output(0, HashMap::new());
            queue.push(task, Arc::clone(&model));
            receivers.push((i, rx));
        }

        for (i, rx) in receivers {
            let reply = rx.await.unwrap();
            assert_eq!(reply.query_id, i);
            assert!(reply.status.is_ok());
        }
    }

    #[tokio::test]
    async fn test_workers_exit_when_queue_drops() {
        let (queue, handles) = PostprocessQueue::start(1);
        drop(queue);
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
