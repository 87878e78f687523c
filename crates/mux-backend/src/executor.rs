//! The per-model batching executor
//!
//! One executor owns the deadline-ordered input queue for one loaded model
//! session. On every duty-cycle tick it drains up to `batch` inputs into a
//! fresh [`BatchTask`], drops inputs whose deadlines the projected batch
//! finish time would miss, runs one forward pass, and demultiplexes the
//! outputs back onto the owning tasks.
//!
//! The deadline check uses the projected finish time for the *chosen*
//! batch size, so the admit/drop decision is consistent with what the GPU
//! will actually execute.

use crate::batch::BatchTask;
use crate::model::ModelInstance;
use crate::postprocess::PostprocessQueue;
use crate::task::{Input, Task, TaskStage};
use crate::tensor::Tensor;
use mux_core::CtrlStatus;
use mux_profile::ModelProfile;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Heap wrapper ordering inputs by earliest deadline first
struct QueuedInput(Input);

impl PartialEq for QueuedInput {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline
    }
}

impl Eq for QueuedInput {}

impl PartialOrd for QueuedInput {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedInput {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops
        // first
        other.0.deadline.cmp(&self.0.deadline)
    }
}

struct QueueState {
    input_queue: BinaryHeap<QueuedInput>,
    processing_tasks: HashMap<u64, Arc<Task>>,
}

/// Counters for one executor
#[derive(Debug, Default)]
pub struct ExecutorStats {
    pub batches_executed: AtomicU64,
    pub inputs_batched: AtomicU64,
    pub inputs_dropped: AtomicU64,
    pub forward_failures: AtomicU64,
}

/// Per-GPU, per-model batching executor
pub struct ModelExecutor {
    model: Arc<dyn ModelInstance>,
    profile: Option<Arc<ModelProfile>>,
    batch: AtomicU32,
    max_batch: u32,
    batch_id: AtomicU64,
    queue: Mutex<QueueState>,
    /// Preallocated GPU input buffer; sized for `max_batch` inputs
    input_array: Tensor,
    post_queue: PostprocessQueue,
    stats: ExecutorStats,
}

impl ModelExecutor {
    pub fn new(
        model: Arc<dyn ModelInstance>,
        profile: Option<Arc<ModelProfile>>,
        batch: u32,
        max_batch: u32,
        post_queue: PostprocessQueue,
    ) -> Self {
        let input_array = model.create_input_array(max_batch);
        Self {
            model,
            profile,
            batch: AtomicU32::new(batch.clamp(1, max_batch)),
            max_batch,
            batch_id: AtomicU64::new(0),
            queue: Mutex::new(QueueState {
                input_queue: BinaryHeap::new(),
                processing_tasks: HashMap::new(),
            }),
            input_array,
            post_queue,
            stats: ExecutorStats::default(),
        }
    }

    /// The model this executor drives
    pub fn model(&self) -> &Arc<dyn ModelInstance> {
        &self.model
    }

    /// Runtime batch size
    pub fn batch(&self) -> u32 {
        self.batch.load(Ordering::Relaxed)
    }

    /// Update the runtime batch size (clamped to `max_batch`)
    pub fn set_batch(&self, batch: u32) {
        self.batch.store(batch.clamp(1, self.max_batch), Ordering::Relaxed);
    }

    pub fn max_batch(&self) -> u32 {
        self.max_batch
    }

    /// Executor counters
    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    /// Inputs currently waiting in the queue
    pub fn pending_inputs(&self) -> usize {
        self.queue.lock().unwrap().input_queue.len()
    }

    /// Admit a task: register it and queue each of its inputs by deadline
    pub fn add_task(&self, task: Arc<Task>) {
        task.set_stage(TaskStage::Exec);
        let inputs = task.take_inputs();
        let mut state = self.queue.lock().unwrap();
        state.processing_tasks.insert(task.tid, task);
        for input in inputs {
            state.input_queue.push(QueuedInput(input));
        }
    }

    /// Drain up to `batch` inputs into one forward pass. Returns the batch
    /// size executed (zero when every queued input was dropped or the
    /// queue was empty).
    pub async fn execute(&self) -> usize {
        let batch_id = self.batch_id.fetch_add(1, Ordering::Relaxed);
        let mut batch_task = BatchTask::new(batch_id, self.max_batch, self.input_array.device());

        let t_collect = Instant::now();
        let completed_by_drop = self.collect_batch(&mut batch_task);
        for task in completed_by_drop {
            self.finish_task(task);
        }
        if batch_task.batch_size() == 0 {
            return 0;
        }
        let memcpy_latency = t_collect.elapsed();

        // Recompute output sizes every call; models with variable output
        // shapes change them between batches
        let output_sizes = self
            .model
            .output_shapes()
            .into_iter()
            .map(|(name, shape)| (name, shape.elements_per_input()))
            .collect();
        batch_task.create_output_arrays(output_sizes);

        let t_forward = Instant::now();
        let forward_ok = match self.model.forward(&mut batch_task).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "{} forward failed for batch {}: {}",
                    self.model.session().session_id(),
                    batch_task.batch_id(),
                    e
                );
                self.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
                for task in batch_task.tasks() {
                    task.set_error(CtrlStatus::InternalError);
                }
                false
            }
        };
        debug!(
            "{} forwards batch {}, size {}, memcpy {} us, forward {} us",
            self.model.session().session_id(),
            batch_task.batch_id(),
            batch_task.batch_size(),
            memcpy_latency.as_micros(),
            t_forward.elapsed().as_micros()
        );

        // Associate outputs back to tasks by position index
        let batch_size = batch_task.batch_size();
        for i in 0..batch_size {
            let input = &batch_task.inputs()[i];
            let task = batch_task.tasks()[i].clone();
            let completed = if forward_ok {
                task.add_output(input.index, batch_task.output_slices(i))
            } else {
                task.add_virtual_output(input.index)
            };
            if completed {
                self.finish_task(task);
            }
        }

        self.stats.batches_executed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .inputs_batched
            .fetch_add(batch_size as u64, Ordering::Relaxed);
        batch_size
    }

    /// Pop inputs in deadline order into the batch, turning unservable
    /// inputs into virtual outputs. Returns tasks completed by a drop;
    /// their postprocess hand-off happens after the lock is released.
    fn collect_batch(&self, batch_task: &mut BatchTask) -> Vec<Arc<Task>> {
        let mut completed = Vec::new();
        let mut state = self.queue.lock().unwrap();

        let batch_size = state
            .input_queue
            .len()
            .min(self.batch.load(Ordering::Relaxed) as usize);
        let finish = self.profile.as_ref().and_then(|profile| {
            profile
                .forward_latency(batch_size as u32)
                .map(|latency_us| Instant::now() + Duration::from_micros(latency_us as u64))
        });

        while batch_task.batch_size() < batch_size && !state.input_queue.is_empty() {
            let QueuedInput(input) = state.input_queue.pop().unwrap();
            let task = match state.processing_tasks.get(&input.tid) {
                Some(task) => task.clone(),
                None => continue,
            };
            task.record("exec");
            let unservable =
                !task.status().is_ok() || finish.map_or(false, |finish| input.deadline < finish);
            if unservable {
                self.stats.inputs_dropped.fetch_add(1, Ordering::Relaxed);
                if task.add_virtual_output(input.index) {
                    state.processing_tasks.remove(&input.tid);
                    completed.push(task);
                }
            } else {
                batch_task.append(input, task);
            }
        }
        completed
    }

    /// Move a completed task out of the executor and into postprocess
    fn finish_task(&self, task: Arc<Task>) {
        self.queue
            .lock()
            .unwrap()
            .processing_tasks
            .remove(&task.tid);
        task.set_stage(TaskStage::Postprocess);
        self.post_queue.push(task, Arc::clone(&self.model));
    }

    /// Tick-driven drain loop. Runs `execute()` every duty cycle until
    /// shutdown, then drains the remaining queue so no admitted task is
    /// lost on teardown.
    pub async fn run_loop(
        self: Arc<Self>,
        mut duty_rx: watch::Receiver<Duration>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(tick_period(*duty_rx.borrow()));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.execute().await;
                }
                changed = duty_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    ticker = tokio::time::interval(tick_period(*duty_rx.borrow()));
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }
        while self.pending_inputs() > 0 {
            self.execute().await;
        }
        debug!(
            "Executor for {} stopped",
            self.model.session().session_id()
        );
    }
}

fn tick_period(duty_cycle: Duration) -> Duration {
    if duty_cycle.is_zero() {
        Duration::from_millis(1)
    } else {
        duty_cycle
    }
}
