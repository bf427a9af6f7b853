use thiserror::Error;

use super::SessionState;
use crate::audio::format::SourceFormat;
use crate::convert::ConvertError;
use crate::sync::CoordinatorError;
use crate::transport::TransportError;

/// 会话错误
#[derive(Debug, Error)]
pub enum SessionError {
    /// 找不到 transport 支持的格式组合，对当前曲目是致命错误
    #[error("no transport format supports {format}: {reason}")]
    CapabilityMismatch {
        format: SourceFormat,
        reason: &'static str,
    },

    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    #[error("transport error during {phase}: {source}")]
    Transport {
        phase: &'static str,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("producer handle belongs to another session")]
    ForeignProducer,
}

impl From<TransportError> for SessionError {
    fn from(source: TransportError) -> Self {
        Self::Transport {
            phase: "transport call",
            source,
        }
    }
}

impl SessionError {
    pub(crate) fn transport(phase: &'static str) -> impl FnOnce(TransportError) -> Self {
        move |source| Self::Transport { phase, source }
    }
}
