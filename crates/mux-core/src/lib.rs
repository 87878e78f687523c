//! # mux-core
//!
//! Core types, errors, and configuration for gpumux - a GPU inference
//! multiplexer that packs latency-SLA-bound model instances onto a shared
//! pool of GPU backends.
//!
//! This crate provides the foundational data structures shared across all
//! other gpumux components:
//!
//! - Node and model-session identifiers
//! - Placement output types (`ModelInstanceConfig`, `ModelTableConfig`)
//! - Configuration schema and parsing for the two daemons
//! - The static workload descriptor and the model manifest loaders
//! - Error handling types and utilities

pub mod config;
pub mod error;
pub mod instance;
pub mod manifest;
pub mod session;
pub mod types;
pub mod workload;

// Re-export commonly used types at the crate root
pub use config::{BackendConfig, SchedulerConfig};
pub use error::{Error, Result};
pub use instance::{ModelInstanceConfig, ModelTableConfig};
pub use manifest::{ModelEntry, ModelManifest};
pub use session::ModelSession;
pub use types::{CtrlStatus, NodeId, NodeType};
pub use workload::{BackendWorkload, StaticWorkload, WorkloadEntry};
