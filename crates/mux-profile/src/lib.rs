//! # mux-profile
//!
//! Offline-profiled latency and memory curves for gpumux.
//!
//! A [`ModelProfile`] holds the measured forward latency and GPU memory
//! usage of one (gpu device, profile id) pair as a function of batch size,
//! plus scalar pre/postprocess latencies. The [`ProfileDatabase`] is the
//! process-wide read-only collection of profiles, populated once at
//! startup from on-disk profile files and queried without locks.

use thiserror::Error;

pub mod database;
pub mod profile;

pub use database::ProfileDatabase;
pub use profile::{ForwardEntry, LatencyStat, ModelProfile};

/// Result type for profile operations
pub type Result<T> = std::result::Result<T, ProfileError>;

/// Errors that can occur while loading or querying profiles
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Malformed profile at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Profile has no forward measurements")]
    Empty,

    #[error("Duplicate profile for {gpu_device}/{profile_id}")]
    Duplicate {
        gpu_device: String,
        profile_id: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProfileError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}
