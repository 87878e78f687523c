//! Static workload descriptor
//!
//! Operators can pin fixed placements by handing the scheduler a YAML file
//! describing one workload per backend. Backends are matched to workloads
//! in registration order; each workload is a list of model entries with a
//! fixed batch size. The descriptor is assumed to be SLA-feasible; the
//! scheduler does not re-validate it.

use crate::{ModelSession, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One pinned model entry in a static workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadEntry {
    pub framework: String,
    pub model_name: String,
    pub version: u32,
    /// Latency SLA in milliseconds
    pub latency_sla: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,
    /// Pinned batch size
    pub batch: u32,
}

impl WorkloadEntry {
    /// The model session this entry pins
    pub fn session(&self) -> ModelSession {
        let mut session = ModelSession::new(
            self.framework.clone(),
            self.model_name.clone(),
            self.version,
            self.latency_sla,
        );
        if let (Some(h), Some(w)) = (self.image_height, self.image_width) {
            session = session.with_image_size(h, w);
        }
        session
    }
}

/// The model set pinned onto one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendWorkload {
    pub models: Vec<WorkloadEntry>,
}

/// A full static workload descriptor: one entry per expected backend
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticWorkload(pub Vec<BackendWorkload>);

impl StaticWorkload {
    /// Load a workload descriptor from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let workload: Self = serde_yaml::from_str(&contents)?;
        workload.validate()?;
        Ok(workload)
    }

    /// Validate the descriptor
    pub fn validate(&self) -> Result<()> {
        for (i, backend) in self.0.iter().enumerate() {
            if backend.models.is_empty() {
                return Err(crate::Error::config(format!(
                    "Workload {} has no models",
                    i
                )));
            }
            for entry in &backend.models {
                if entry.batch == 0 {
                    return Err(crate::Error::config(format!(
                        "Workload {} pins batch 0 for {}",
                        i,
                        entry.session()
                    )));
                }
                if entry.image_height.is_some() != entry.image_width.is_some() {
                    return Err(crate::Error::config(format!(
                        "Workload {} sets only one image dimension for {}:{}",
                        i, entry.framework, entry.model_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of backend workloads in the descriptor
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the descriptor is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
