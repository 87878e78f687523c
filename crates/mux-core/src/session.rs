//! Model session identity
//!
//! A model session names one served model variant: the framework, model
//! name, version, latency SLA, and optionally a fixed input image size for
//! resizable models. Sessions with equal `profile_id` are interchangeable
//! consumers of the same offline profile curve.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of one served model variant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSession {
    /// ML framework the model runs on (e.g. "tensorflow", "caffe")
    pub framework: String,

    /// Model name within the framework (e.g. "resnet50")
    pub model_name: String,

    /// Model version
    pub version: u32,

    /// End-to-end latency target in milliseconds
    pub latency_sla_ms: u32,

    /// Input image height for resizable models; set together with width
    pub image_height: Option<u32>,

    /// Input image width for resizable models; set together with height
    pub image_width: Option<u32>,
}

impl ModelSession {
    /// Create a session without a fixed image size
    pub fn new(
        framework: impl Into<String>,
        model_name: impl Into<String>,
        version: u32,
        latency_sla_ms: u32,
    ) -> Self {
        Self {
            framework: framework.into(),
            model_name: model_name.into(),
            version,
            latency_sla_ms,
            image_height: None,
            image_width: None,
        }
    }

    /// Set a fixed input image size
    pub fn with_image_size(mut self, height: u32, width: u32) -> Self {
        self.image_height = Some(height);
        self.image_width = Some(width);
        self
    }

    /// Canonical key into the profile database. Excludes the SLA: two
    /// sessions that differ only in SLA share one profile curve.
    pub fn profile_id(&self) -> String {
        match (self.image_height, self.image_width) {
            (Some(h), Some(w)) => format!(
                "{}:{}:{}:{}x{}",
                self.framework, self.model_name, self.version, h, w
            ),
            _ => format!("{}:{}:{}", self.framework, self.model_name, self.version),
        }
    }

    /// Full session key, including the SLA. Routing and subscription use
    /// this form.
    pub fn session_id(&self) -> String {
        format!("{}:{}", self.profile_id(), self.latency_sla_ms)
    }
}

impl fmt::Display for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.session_id())
    }
}

impl FromStr for ModelSession {
    type Err = crate::Error;

    /// Parse the `session_id` form:
    /// `framework:model_name:version[:HxW]:latency_sla_ms`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 && parts.len() != 5 {
            return Err(crate::Error::invalid_request(format!(
                "Malformed model session id: {}",
                s
            )));
        }
        let version: u32 = parts[2]
            .parse()
            .map_err(|_| crate::Error::invalid_request(format!("Bad version in: {}", s)))?;
        let sla: u32 = parts[parts.len() - 1]
            .parse()
            .map_err(|_| crate::Error::invalid_request(format!("Bad latency SLA in: {}", s)))?;
        let mut session = ModelSession::new(parts[0], parts[1], version, sla);
        if parts.len() == 5 {
            let (h, w) = parts[3]
                .split_once('x')
                .ok_or_else(|| crate::Error::invalid_request(format!("Bad image size in: {}", s)))?;
            let height: u32 = h
                .parse()
                .map_err(|_| crate::Error::invalid_request(format!("Bad image height in: {}", s)))?;
            let width: u32 = w
                .parse()
                .map_err(|_| crate::Error::invalid_request(format!("Bad image width in: {}", s)))?;
            session = session.with_image_size(height, width);
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_id_excludes_sla() {
        let a = ModelSession::new("tensorflow", "resnet50", 1, 50);
        let b = ModelSession::new("tensorflow", "resnet50", 1, 100);
        assert_eq!(a.profile_id(), b.profile_id());
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn test_profile_id_with_image_size() {
        let sess = ModelSession::new("tensorflow", "ssd", 2, 80).with_image_size(300, 300);
        assert_eq!(sess.profile_id(), "tensorflow:ssd:2:300x300");
        assert_eq!(sess.session_id(), "tensorflow:ssd:2:300x300:80");
    }

    #[test]
    fn test_session_id_round_trip() {
        let sess = ModelSession::new("caffe", "vgg16", 3, 120).with_image_size(224, 224);
        let parsed: ModelSession = sess.session_id().parse().unwrap();
        assert_eq!(parsed, sess);

        let plain = ModelSession::new("tensorflow", "inception", 1, 40);
        let parsed: ModelSession = plain.session_id().parse().unwrap();
        assert_eq!(parsed, plain);
    }

    #[test]
    fn test_malformed_session_id() {
        assert!("tensorflow:resnet50".parse::<ModelSession>().is_err());
        assert!("tensorflow:resnet50:x:50".parse::<ModelSession>().is_err());
        assert!("tensorflow:ssd:2:300by300:80".parse::<ModelSession>().is_err());
    }
}
