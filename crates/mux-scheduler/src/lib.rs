//! # mux-scheduler
//!
//! The gpumux placement scheduler. A singleton process holding the
//! authoritative placement state: it admits backends and frontends, packs
//! model sessions onto backends using offline profile curves so every
//! backend's cyclic schedule respects each tenant's latency SLA, keeps
//! backend model tables coherent via dirty-flag pushes, and monitors
//! liveness.

use thiserror::Error;

pub mod backend;
pub mod client;
pub mod frontend;
pub mod scheduler;
pub mod service;

pub use backend::BackendHandle;
pub use client::{
    BackendControl, BackendEndpoint, ControlTransport, FrontendControl, GrpcTransport,
    MockTransport,
};
pub use frontend::FrontendHandle;
pub use scheduler::Scheduler;
pub use service::SchedulerCtrlService;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur in the scheduler
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Placement infeasible for {session}: {reason}")]
    PlacementInfeasible { session: String, reason: String },

    #[error("Backend {0} is not idle; multi-tenant packing is not supported")]
    BackendNotIdle(String),

    #[error("Node {0} is not registered")]
    NotRegistered(String),

    #[error("Node {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid workload: {0}")]
    InvalidWorkload(String),

    #[error("Core error: {0}")]
    Core(#[from] mux_core::Error),
}

impl SchedulerError {
    pub(crate) fn placement(session: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PlacementInfeasible {
            session: session.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
