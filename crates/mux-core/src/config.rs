//! Configuration for the gpumux daemons
//!
//! Supports YAML files, environment variables with the `GPUMUX_` prefix,
//! and command-line overrides applied by the binaries.

use crate::{NodeId, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the scheduler daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Port the control RPC service listens on
    pub port: u16,

    /// Root directory holding the model manifest and profile files
    pub model_root: PathBuf,

    /// Optional static workload descriptor to pin placements at startup
    pub workload: Option<PathBuf>,

    /// Liveness timeout for registered nodes, in seconds
    pub timeout_s: u64,

    /// Cadence of the control loop that walks backends, in seconds
    pub tick_interval_s: u64,

    /// Per-call timeout for control RPCs, in milliseconds
    pub rpc_timeout_ms: u64,
}

impl SchedulerConfig {
    /// Load from defaults, an optional YAML file, then `GPUMUX_` env vars
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.clone()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GPUMUX")
                .separator("__")
                .try_parsing(true),
        );
        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.model_root.as_os_str().is_empty() {
            return Err(crate::Error::config("Missing model_root"));
        }
        if self.timeout_s == 0 {
            return Err(crate::Error::config("timeout_s must be positive"));
        }
        if self.tick_interval_s == 0 {
            return Err(crate::Error::config("tick_interval_s must be positive"));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            port: 10001,
            model_root: PathBuf::new(),
            workload: None,
            timeout_s: 5,
            tick_interval_s: 2,
            rpc_timeout_ms: 1000,
        }
    }
}

/// Configuration for the backend daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique identifier for this backend
    pub node_id: NodeId,

    /// CUDA device index this backend owns
    pub gpu: u32,

    /// Device name used as the profile database key (e.g. "TITAN_X")
    pub gpu_device: String,

    /// GPU memory available for model instances, in bytes
    pub gpu_memory: u64,

    /// Scheduler control RPC address
    pub scheduler_addr: String,

    /// Port the serving endpoint listens on
    pub port: u16,

    /// Port the control RPC service listens on
    pub rpc_port: u16,

    /// Root directory holding the model manifest and profile files
    pub model_root: PathBuf,

    /// Number of workers draining the shared postprocess queue
    pub postprocess_workers: usize,
}

impl BackendConfig {
    /// Load from defaults, an optional YAML file, then `GPUMUX_` env vars
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.clone()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GPUMUX")
                .separator("__")
                .try_parsing(true),
        );
        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.model_root.as_os_str().is_empty() {
            return Err(crate::Error::config("Missing model_root"));
        }
        if self.gpu_device.is_empty() {
            return Err(crate::Error::config("Missing gpu_device"));
        }
        if self.scheduler_addr.is_empty() {
            return Err(crate::Error::config("Missing scheduler_addr"));
        }
        if self.postprocess_workers == 0 {
            return Err(crate::Error::config("postprocess_workers must be positive"));
        }
        Ok(())
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::generate(),
            gpu: 0,
            gpu_device: String::new(),
            gpu_memory: 0,
            scheduler_addr: String::new(),
            port: 8001,
            rpc_port: 8002,
            model_root: PathBuf::new(),
            postprocess_workers: 2,
        }
    }
}
