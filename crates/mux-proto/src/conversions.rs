//! Conversions between wire types and the `mux-core` data model

use crate::control::v1 as proto;
use crate::{ProtoError, Result};

impl From<mux_core::CtrlStatus> for proto::CtrlStatus {
    fn from(status: mux_core::CtrlStatus) -> Self {
        match status {
            mux_core::CtrlStatus::Ok => proto::CtrlStatus::Ok,
            mux_core::CtrlStatus::Timeout => proto::CtrlStatus::Timeout,
            mux_core::CtrlStatus::ModelNotLoaded => proto::CtrlStatus::ModelNotLoaded,
            mux_core::CtrlStatus::ServerUnreachable => proto::CtrlStatus::ServerUnreachable,
            mux_core::CtrlStatus::InvalidWorkload => proto::CtrlStatus::InvalidWorkload,
            mux_core::CtrlStatus::InternalError => proto::CtrlStatus::InternalError,
        }
    }
}

impl TryFrom<proto::CtrlStatus> for mux_core::CtrlStatus {
    type Error = ProtoError;

    fn try_from(status: proto::CtrlStatus) -> Result<Self> {
        match status {
            proto::CtrlStatus::Ok => Ok(mux_core::CtrlStatus::Ok),
            proto::CtrlStatus::Timeout => Ok(mux_core::CtrlStatus::Timeout),
            proto::CtrlStatus::ModelNotLoaded => Ok(mux_core::CtrlStatus::ModelNotLoaded),
            proto::CtrlStatus::ServerUnreachable => Ok(mux_core::CtrlStatus::ServerUnreachable),
            proto::CtrlStatus::InvalidWorkload => Ok(mux_core::CtrlStatus::InvalidWorkload),
            proto::CtrlStatus::InternalError => Ok(mux_core::CtrlStatus::InternalError),
            proto::CtrlStatus::Unspecified => {
                Err(ProtoError::InvalidData("unspecified ctrl status".to_string()))
            }
        }
    }
}

impl From<mux_core::NodeType> for proto::NodeType {
    fn from(node_type: mux_core::NodeType) -> Self {
        match node_type {
            mux_core::NodeType::Backend => proto::NodeType::Backend,
            mux_core::NodeType::Frontend => proto::NodeType::Frontend,
        }
    }
}

impl TryFrom<proto::NodeType> for mux_core::NodeType {
    type Error = ProtoError;

    fn try_from(node_type: proto::NodeType) -> Result<Self> {
        match node_type {
            proto::NodeType::Backend => Ok(mux_core::NodeType::Backend),
            proto::NodeType::Frontend => Ok(mux_core::NodeType::Frontend),
            proto::NodeType::Unspecified => {
                Err(ProtoError::InvalidData("unspecified node type".to_string()))
            }
        }
    }
}

impl From<mux_core::ModelSession> for proto::ModelSession {
    fn from(session: mux_core::ModelSession) -> Self {
        Self {
            framework: session.framework,
            model_name: session.model_name,
            version: session.version,
            latency_sla_ms: session.latency_sla_ms,
            image_height: session.image_height.unwrap_or(0),
            image_width: session.image_width.unwrap_or(0),
        }
    }
}

impl From<proto::ModelSession> for mux_core::ModelSession {
    fn from(session: proto::ModelSession) -> Self {
        let mut out = mux_core::ModelSession::new(
            session.framework,
            session.model_name,
            session.version,
            session.latency_sla_ms,
        );
        if session.image_height > 0 && session.image_width > 0 {
            out = out.with_image_size(session.image_height, session.image_width);
        }
        out
    }
}

impl From<mux_core::ModelInstanceConfig> for proto::ModelInstanceConfig {
    fn from(config: mux_core::ModelInstanceConfig) -> Self {
        Self {
            model_session: Some(config.session.into()),
            batch: config.batch,
            max_batch: config.max_batch,
            forward_latency_us: config.forward_latency_us,
            memory_usage: config.memory_usage,
            throughput: config.throughput,
            workload: config.workload,
        }
    }
}

impl TryFrom<proto::ModelInstanceConfig> for mux_core::ModelInstanceConfig {
    type Error = ProtoError;

    fn try_from(config: proto::ModelInstanceConfig) -> Result<Self> {
        let session = config
            .model_session
            .ok_or_else(|| ProtoError::InvalidData("missing model session".to_string()))?;
        Ok(Self {
            session: session.into(),
            batch: config.batch,
            max_batch: config.max_batch,
            forward_latency_us: config.forward_latency_us,
            memory_usage: config.memory_usage,
            throughput: config.throughput,
            workload: config.workload,
        })
    }
}

impl From<mux_core::ModelTableConfig> for proto::ModelTableConfig {
    fn from(table: mux_core::ModelTableConfig) -> Self {
        Self {
            duty_cycle_us: table.duty_cycle_us,
            model_instance_config: table.instances.into_iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<proto::ModelTableConfig> for mux_core::ModelTableConfig {
    type Error = ProtoError;

    fn try_from(table: proto::ModelTableConfig) -> Result<Self> {
        let instances = table
            .model_instance_config
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            duty_cycle_us: table.duty_cycle_us,
            instances,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_round_trip() {
        let session = mux_core::ModelSession::new("tensorflow", "ssd", 2, 80)
            .with_image_size(300, 300);
        let wire: proto::ModelSession = session.clone().into();
        let back: mux_core::ModelSession = wire.into();
        assert_eq!(back, session);

        let plain = mux_core::ModelSession::new("caffe", "vgg16", 1, 100);
        let wire: proto::ModelSession = plain.clone().into();
        assert_eq!(wire.image_height, 0);
        let back: mux_core::ModelSession = wire.into();
        assert_eq!(back, plain);
    }

    #[test]
    fn test_instance_config_round_trip() {
        let config = mux_core::ModelInstanceConfig {
            session: mux_core::ModelSession::new("tensorflow", "resnet50", 1, 50),
            batch: 8,
            max_batch: 16,
            forward_latency_us: 20_000.0,
            memory_usage: 1 << 30,
            throughput: 400.0,
            workload: 250.0,
        };
        let wire: proto::ModelInstanceConfig = config.clone().into();
        let back: mux_core::ModelInstanceConfig = wire.try_into().unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_instance_config_requires_session() {
        let wire = proto::ModelInstanceConfig::default();
        assert!(mux_core::ModelInstanceConfig::try_from(wire).is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            mux_core::CtrlStatus::Ok,
            mux_core::CtrlStatus::Timeout,
            mux_core::CtrlStatus::ModelNotLoaded,
            mux_core::CtrlStatus::ServerUnreachable,
            mux_core::CtrlStatus::InvalidWorkload,
            mux_core::CtrlStatus::InternalError,
        ] {
            let wire: proto::CtrlStatus = status.into();
            let back: mux_core::CtrlStatus = wire.try_into().unwrap();
            assert_eq!(back, status);
        }
        assert!(mux_core::CtrlStatus::try_from(proto::CtrlStatus::Unspecified).is_err());
    }
}
