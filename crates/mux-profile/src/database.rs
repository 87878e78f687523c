//! The process-wide profile database
//!
//! Populated once at startup from a directory of profile files and never
//! mutated afterwards, so readers need no locks. The lookup key is the
//! (gpu device, profile id) pair embedded in each file.

use crate::{ModelProfile, ProfileError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directory under the model root that holds profile files
pub const PROFILE_DIR: &str = "profiles";

/// Read-only collection of model profiles
#[derive(Debug, Clone, Default)]
pub struct ProfileDatabase {
    profiles: HashMap<(String, String), Arc<ModelProfile>>,
}

impl ProfileDatabase {
    /// An empty database (useful for tests and profile-less deployments)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every profile file under `<model_root>/profiles`, recursing
    /// into per-device subdirectories. Files that fail to parse are
    /// skipped with a warning; duplicate (device, profile) pairs are an
    /// error.
    pub fn load(model_root: impl AsRef<Path>) -> Result<Self> {
        let dir = model_root.as_ref().join(PROFILE_DIR);
        let mut db = Self::default();
        if !dir.exists() {
            info!("No profile directory at {}", dir.display());
            return Ok(db);
        }
        db.load_dir(&dir)?;
        info!("Loaded {} model profiles from {}", db.len(), dir.display());
        Ok(db)
    }

    fn load_dir(&mut self, dir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.load_dir(&path)?;
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            match contents.parse::<ModelProfile>() {
                Ok(profile) => {
                    debug!(
                        "Profile {} on {} from {}",
                        profile.profile_id,
                        profile.gpu_device,
                        path.display()
                    );
                    self.insert(profile)?;
                }
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }

    /// Insert a parsed profile
    pub fn insert(&mut self, profile: ModelProfile) -> Result<()> {
        let key = (profile.gpu_device.clone(), profile.profile_id.clone());
        if self.profiles.contains_key(&key) {
            return Err(ProfileError::Duplicate {
                gpu_device: key.0,
                profile_id: key.1,
            });
        }
        self.profiles.insert(key, Arc::new(profile));
        Ok(())
    }

    /// Look up the profile for a (gpu device, profile id) pair
    pub fn get(&self, gpu_device: &str, profile_id: &str) -> Option<Arc<ModelProfile>> {
        self.profiles
            .get(&(gpu_device.to_string(), profile_id.to_string()))
            .cloned()
    }

    /// Number of loaded profiles
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Check whether the database is empty
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RESNET: &str = "\
tensorflow:resnet50:1
TITAN_X
Forward latency
batch,latency(us),std(us),memory(B)
1,5000,120,500000000
2,8000,130,600000000
Preprocess latency
mean(us),std(us)
2000,50
Postprocess latency
mean(us),std(us)
1000,20
";

    const VGG_ON_GTX: &str = "\
tensorflow:vgg16:1
GTX_1080
Forward latency
batch,latency(us),std(us),memory(B)
1,9000,200,900000000
Preprocess latency
mean(us),std(us)
2500,60
Postprocess latency
mean(us),std(us)
800,10
";

    fn write_profile(dir: &Path, name: &str, contents: &str) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn test_load_from_directory() {
        let root = tempfile::tempdir().unwrap();
        let profiles = root.path().join(PROFILE_DIR);
        let nested = profiles.join("GTX_1080");
        std::fs::create_dir_all(&nested).unwrap();

        write_profile(&profiles, "resnet50.txt", RESNET);
        write_profile(&nested, "vgg16.txt", VGG_ON_GTX);
        // a malformed file is skipped, not fatal
        write_profile(&profiles, "broken.txt", "not a profile");

        let db = ProfileDatabase::load(root.path()).unwrap();
        assert_eq!(db.len(), 2);

        let resnet = db.get("TITAN_X", "tensorflow:resnet50:1").unwrap();
        assert_eq!(resnet.forward_latency(2), Some(8000.0));

        assert!(db.get("TITAN_X", "tensorflow:vgg16:1").is_none());
        assert!(db.get("GTX_1080", "tensorflow:vgg16:1").is_some());
    }

    #[test]
    fn test_missing_profile_dir_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let db = ProfileDatabase::load(root.path()).unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn test_duplicate_profile_rejected() {
        let mut db = ProfileDatabase::empty();
        db.insert(RESNET.parse().unwrap()).unwrap();
        assert!(matches!(
            db.insert(RESNET.parse().unwrap()),
            Err(ProfileError::Duplicate { .. })
        ));
    }
}
