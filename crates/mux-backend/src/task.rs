//! The serving unit for one user query
//!
//! A [`Task`] owns one or more inputs that must be forwarded and
//! postprocessed. Tasks are `Arc`-shared between the rpc path that created
//! them, the model executor, and the postprocess pool; per-input output
//! slots fill in as batches complete, and the task signals completion
//! exactly once, when its last slot fills. An input dropped for a missed
//! deadline fills its slot with a *virtual* output so the task can still
//! complete.

use crate::tensor::Tensor;
use mux_core::CtrlStatus;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;

/// Lifecycle stage of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStage {
    Preprocess,
    Exec,
    Postprocess,
    Done,
}

/// Reply delivered to the submitter when a task finishes
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReply {
    pub query_id: u64,
    pub status: CtrlStatus,
}

/// One input of a task, as queued inside a model executor
#[derive(Debug, Clone)]
pub struct Input {
    /// Owning task id
    pub tid: u64,
    /// Position of this input within its task
    pub index: usize,
    /// Absolute deadline inherited from the task
    pub deadline: Instant,
    /// Preprocessed data for this input
    pub data: Tensor,
}

/// Output slot content for one input
#[derive(Debug, Clone)]
pub enum OutputSlot {
    /// Named output tensors produced by a forward pass
    Real(HashMap<String, Tensor>),
    /// Sentinel for an input that was dropped (usually deadline miss)
    Virtual,
}

struct TaskInner {
    stage: TaskStage,
    status: CtrlStatus,
    outputs: Vec<Option<OutputSlot>>,
    filled: usize,
    pending_inputs: Option<Vec<Input>>,
    timer: Vec<(&'static str, Instant)>,
    reply_tx: Option<oneshot::Sender<TaskReply>>,
}

/// One user query in flight
pub struct Task {
    pub tid: u64,
    pub query_id: u64,
    /// Model session this task targets, in `session_id` string form
    pub session_id: String,
    /// Absolute deadline for the whole task
    pub deadline: Instant,
    num_inputs: usize,
    inner: Mutex<TaskInner>,
}

impl Task {
    /// Create a task from preprocessed input tensors. Returns the shared
    /// task and the receiver its reply will arrive on.
    pub fn new(
        tid: u64,
        query_id: u64,
        session_id: impl Into<String>,
        deadline: Instant,
        inputs: Vec<Tensor>,
    ) -> (std::sync::Arc<Self>, oneshot::Receiver<TaskReply>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let num_inputs = inputs.len();
        let pending = inputs
            .into_iter()
            .enumerate()
            .map(|(index, data)| Input {
                tid,
                index,
                deadline,
                data,
            })
            .collect();
        let task = std::sync::Arc::new(Self {
            tid,
            query_id,
            session_id: session_id.into(),
            deadline,
            num_inputs,
            inner: Mutex::new(TaskInner {
                stage: TaskStage::Preprocess,
                status: CtrlStatus::Ok,
                outputs: vec![None; num_inputs],
                filled: 0,
                pending_inputs: Some(pending),
                timer: vec![("created", Instant::now())],
                reply_tx: Some(reply_tx),
            }),
        });
        (task, reply_rx)
    }

    /// Number of inputs this task owns
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Take the inputs for insertion into an executor queue. Yields them
    /// exactly once.
    pub fn take_inputs(&self) -> Vec<Input> {
        self.inner
            .lock()
            .unwrap()
            .pending_inputs
            .take()
            .unwrap_or_default()
    }

    /// Current result status
    pub fn status(&self) -> CtrlStatus {
        self.inner.lock().unwrap().status
    }

    /// Mark the task failed. An already-failed task keeps its first error.
    pub fn set_error(&self, status: CtrlStatus) {
        let mut inner = self.inner.lock().unwrap();
        if inner.status.is_ok() {
            inner.status = status;
        }
    }

    /// Current lifecycle stage
    pub fn stage(&self) -> TaskStage {
        self.inner.lock().unwrap().stage
    }

    pub fn set_stage(&self, stage: TaskStage) {
        self.inner.lock().unwrap().stage = stage;
    }

    /// Record a named instant on the task's stage timer
    pub fn record(&self, label: &'static str) {
        self.inner.lock().unwrap().timer.push((label, Instant::now()));
    }

    /// The most recent instant recorded under `label`
    pub fn recorded(&self, label: &str) -> Option<Instant> {
        self.inner
            .lock()
            .unwrap()
            .timer
            .iter()
            .rev()
            .find(|(l, _)| *l == label)
            .map(|(_, t)| *t)
    }

    /// Fill the output slot for `index` with forward results. Returns true
    /// exactly once, when the last slot fills.
    pub fn add_output(&self, index: usize, outputs: HashMap<String, Tensor>) -> bool {
        self.fill_slot(index, OutputSlot::Real(outputs))
    }

    /// Fill the output slot for `index` with a virtual output. Marks the
    /// task timed out unless it already failed with something else.
    /// Returns true exactly once, when the last slot fills.
    pub fn add_virtual_output(&self, index: usize) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.status.is_ok() {
                inner.status = CtrlStatus::Timeout;
            }
        }
        self.fill_slot(index, OutputSlot::Virtual)
    }

    fn fill_slot(&self, index: usize, slot: OutputSlot) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.outputs[index].is_some() {
            return false;
        }
        inner.outputs[index] = Some(slot);
        inner.filled += 1;
        inner.filled == self.num_inputs
    }

    /// The filled output slot for `index`, if any
    pub fn output(&self, index: usize) -> Option<OutputSlot> {
        self.inner.lock().unwrap().outputs[index].clone()
    }

    /// Deliver the reply and mark the task done. Subsequent calls are
    /// no-ops.
    pub fn finish(&self) {
        let (status, reply_tx) = {
            let mut inner = self.inner.lock().unwrap();
            inner.stage = TaskStage::Done;
            (inner.status, inner.reply_tx.take())
        };
        if let Some(tx) = reply_tx {
            let _ = tx.send(TaskReply {
                query_id: self.query_id,
                status,
            });
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("tid", &self.tid)
            .field("query_id", &self.query_id)
            .field("session_id", &self.session_id)
            .field("num_inputs", &self.num_inputs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Device;
    use std::time::Duration;

    fn make_task(num_inputs: usize) -> (std::sync::Arc<Task>, oneshot::Receiver<TaskReply>) {
        let inputs = (0..num_inputs)
            .map(|_| Tensor::zeros(4, Device::Cpu))
            .collect();
        Task::new(7, 42, "tensorflow:resnet50:1:50", Instant::now() + Duration::from_millis(50), inputs)
    }

    #[test]
    fn test_inputs_taken_once() {
        let (task, _rx) = make_task(3);
        let inputs = task.take_inputs();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[1].index, 1);
        assert_eq!(inputs[1].tid, 7);
        assert!(task.take_inputs().is_empty());
    }

    #[test]
    fn test_completion_on_last_slot() {
        let (task, _rx) = make_task(2);
        assert!(!task.add_output(0, HashMap::new()));
        assert!(task.add_output(1, HashMap::new()));
        assert!(task.status().is_ok());
    }

    #[test]
    fn test_virtual_output_marks_timeout() {
        let (task, _rx) = make_task(2);
        assert!(!task.add_virtual_output(0));
        assert_eq!(task.status(), CtrlStatus::Timeout);
        assert!(matches!(task.output(0), Some(OutputSlot::Virtual)));

        // a real output on the other slot completes the task but the
        // timeout status sticks
        assert!(task.add_output(1, HashMap::new()));
        assert_eq!(task.status(), CtrlStatus::Timeout);
    }

    #[test]
    fn test_virtual_output_keeps_earlier_error() {
        let (task, _rx) = make_task(1);
        task.set_error(CtrlStatus::InternalError);
        task.add_virtual_output(0);
        assert_eq!(task.status(), CtrlStatus::InternalError);
    }

    #[test]
    fn test_double_fill_is_ignored() {
        let (task, _rx) = make_task(2);
        assert!(!task.add_output(0, HashMap::new()));
        assert!(!task.add_output(0, HashMap::new()));
        assert!(task.add_output(1, HashMap::new()));
    }

    #[tokio::test]
    async fn test_finish_delivers_reply_once() {
        let (task, rx) = make_task(1);
        task.add_output(0, HashMap::new());
        task.finish();
        task.finish();
        let reply = rx.await.unwrap();
        assert_eq!(reply.query_id, 42);
        assert!(reply.status.is_ok());
        assert_eq!(task.stage(), TaskStage::Done);
    }

    #[test]
    fn test_timer_records() {
        let (task, _rx) = make_task(1);
        task.record("exec");
        assert!(task.recorded("exec").is_some());
        assert!(task.recorded("created").is_some());
        assert!(task.recorded("post").is_none());
    }
}
