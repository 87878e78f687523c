//! Placement output types
//!
//! A `ModelInstanceConfig` is the scheduler's placement decision for one
//! model session on one backend. A `ModelTableConfig` is the full desired
//! state pushed to a backend: the duty cycle its executors tick at plus
//! every instance config it should host.

use crate::ModelSession;
use serde::{Deserialize, Serialize};

/// Placement decision for one model session on one backend.
///
/// `batch == 0` encodes "placement impossible on this backend".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstanceConfig {
    /// The session being placed
    pub session: ModelSession,

    /// Runtime batch size the executor drains per duty cycle
    pub batch: u32,

    /// Upper bound on batch size allowed by memory and SLA
    pub max_batch: u32,

    /// Profiled forward latency at `batch`, in microseconds
    pub forward_latency_us: f64,

    /// Profiled GPU memory usage at `max_batch`, in bytes
    pub memory_usage: u64,

    /// Throughput this placement sustains, in queries per second
    pub throughput: f64,

    /// Workload the placement was sized for, in queries per second
    pub workload: f64,
}

impl ModelInstanceConfig {
    /// A config that marks placement as impossible
    pub fn infeasible(session: ModelSession) -> Self {
        Self {
            session,
            batch: 0,
            max_batch: 0,
            forward_latency_us: 0.0,
            memory_usage: 0,
            throughput: 0.0,
            workload: 0.0,
        }
    }

    /// Check whether this config represents a feasible placement
    pub fn is_feasible(&self) -> bool {
        self.batch > 0
    }
}

/// Desired model set for one backend, pushed via `UpdateModelTable`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTableConfig {
    /// Period at which each executor runs one batched forward, microseconds
    pub duty_cycle_us: f64,

    /// Every model instance the backend should host
    pub instances: Vec<ModelInstanceConfig>,
}

impl ModelTableConfig {
    /// An empty table (idle backend)
    pub fn empty() -> Self {
        Self {
            duty_cycle_us: 0.0,
            instances: Vec::new(),
        }
    }

    /// Total GPU memory the table requires, in bytes
    pub fn memory_usage(&self) -> u64 {
        self.instances.iter().map(|cfg| cfg.memory_usage).sum()
    }

    /// Total GPU busy time per duty cycle, in microseconds
    pub fn exec_cycle_us(&self) -> f64 {
        self.instances.iter().map(|cfg| cfg.forward_latency_us).sum()
    }
}
