//! Model manifest (model database YAML)
//!
//! The manifest enumerates every model a deployment knows how to run:
//! framework, name, version, framework-specific resource paths, whether
//! the network is resizable, default image dimensions, and the class-name
//! file. Backends consult it when instantiating models; the scheduler
//! never reads it.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Manifest file name under the model root
pub const MANIFEST_FILE: &str = "model_db.yml";

/// One known model in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub framework: String,
    pub model_name: String,
    pub version: u32,

    /// Whether the network accepts arbitrary input image sizes
    #[serde(default)]
    pub resizable: bool,

    /// Default input image height, required when `resizable`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,

    /// Default input image width, required when `resizable`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,

    /// File of class names for classification outputs, relative to the
    /// model root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_names: Option<PathBuf>,

    /// Framework-specific resource paths and options, passed through to
    /// the model wrapper untouched
    #[serde(default, flatten)]
    pub resources: HashMap<String, serde_yaml::Value>,
}

/// The full model manifest, indexed by (framework, model_name, version)
#[derive(Debug, Clone, Default)]
pub struct ModelManifest {
    entries: HashMap<(String, String, u32), ModelEntry>,
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    models: Vec<ModelEntry>,
}

impl ModelManifest {
    /// Load the manifest from `<model_root>/model_db.yml`
    pub fn load(model_root: impl AsRef<Path>) -> Result<Self> {
        let root = model_root.as_ref().to_path_buf();
        let path = root.join(MANIFEST_FILE);
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            crate::Error::config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let file: ManifestFile = serde_yaml::from_str(&contents)?;

        let mut entries = HashMap::new();
        for entry in file.models {
            if entry.resizable && (entry.image_height.is_none() || entry.image_width.is_none()) {
                return Err(crate::Error::config(format!(
                    "Resizable model {}:{} is missing default image dimensions",
                    entry.framework, entry.model_name
                )));
            }
            let key = (entry.framework.clone(), entry.model_name.clone(), entry.version);
            if entries.insert(key, entry).is_some() {
                return Err(crate::Error::config(
                    "Duplicate model entry in manifest".to_string(),
                ));
            }
        }
        Ok(Self { entries, root })
    }

    /// Look up a model entry
    pub fn get(&self, framework: &str, model_name: &str, version: u32) -> Option<&ModelEntry> {
        self.entries
            .get(&(framework.to_string(), model_name.to_string(), version))
    }

    /// The model root this manifest was loaded from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of known models
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the manifest is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
