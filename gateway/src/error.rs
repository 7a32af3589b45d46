use std::time::Duration;

use shared_types::{CommandId, MessageType, ResourceIndex};

/// Failures surfaced by the dispatch layer.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Index outside the configured universe. Nothing was started or queued.
    #[error("unknown resource index {index} (gateway has {slots} slots)")]
    UnknownResource { index: ResourceIndex, slots: usize },

    #[error("no reader named '{0}'")]
    UnknownReader(String),

    /// Logged by the dispatcher and never returned; the result channel stays authoritative.
    #[error("worker {index} sent {got} while {expected} was expected for command {command_id}")]
    ProtocolMismatch {
        index: ResourceIndex,
        command_id: CommandId,
        expected: MessageType,
        got: MessageType,
    },

    #[error("worker {index} did not acknowledge command {command_id} within {waited:?}")]
    AckTimeout {
        index: ResourceIndex,
        command_id: CommandId,
        waited: Duration,
    },

    #[error("no result from worker {index} for command {command_id} within {waited:?}")]
    ResultTimeout {
        index: ResourceIndex,
        command_id: CommandId,
        waited: Duration,
    },

    /// The worker accepted the command and then went away without a result.
    #[error("worker {index} exited before delivering a result for command {command_id}")]
    WorkerLost {
        index: ResourceIndex,
        command_id: CommandId,
    },

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("failed to start worker {index}: {source}")]
    WorkerStart {
        index: ResourceIndex,
        #[source]
        source: anyhow::Error,
    },
}

impl DispatchError {
    /// Configuration errors are the caller's fault; everything else is the worker's.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DispatchError::UnknownResource { .. } | DispatchError::UnknownReader(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DispatchError::AckTimeout { .. } | DispatchError::ResultTimeout { .. }
        )
    }
}
