//! # mux-backend
//!
//! The gpumux backend worker. A backend owns one GPU and hosts a model
//! table: one [`ModelExecutor`] per loaded model session. Each executor
//! turns a stream of individual inputs into batched forward passes that
//! respect per-input deadlines, dropping inputs the system can no longer
//! serve on time. Completed batches are demultiplexed back onto their
//! owning tasks and handed to a shared postprocess worker pool.
//!
//! The model table is mutated only by `UpdateModelTable` pushes from the
//! scheduler; the serving path reads it.

use thiserror::Error;

pub mod batch;
pub mod executor;
pub mod model;
pub mod postprocess;
pub mod server;
pub mod service;
pub mod task;
pub mod tensor;

pub use batch::BatchTask;
pub use executor::{ExecutorStats, ModelExecutor};
pub use model::{MockModelFactory, MockModelInstance, ModelFactory, ModelInstance};
pub use postprocess::PostprocessQueue;
pub use server::BackendServer;
pub use service::BackendCtrlService;
pub use task::{Input, Task, TaskReply, TaskStage};
pub use tensor::{Device, Shape, Tensor};

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur on the backend serving path
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Deadline already passed for query {0}")]
    DeadlineMiss(u64),

    #[error("Model execution failed: {0}")]
    Execution(String),

    #[error("Model table error: {0}")]
    ModelTable(String),

    #[error("Core error: {0}")]
    Core(#[from] mux_core::Error),

    #[error("Profile error: {0}")]
    Profile(#[from] mux_profile::ProfileError),
}
