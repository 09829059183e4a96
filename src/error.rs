//! Error types shared by the conductor, the workers and the collaborators.

use crate::message::{ErrorCode, ErrorReply, JobId, WorkerId};

use thiserror::Error;

/// Failures of the transport layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("worker {0} is unreachable")]
    Unreachable(WorkerId),

    #[error("no conductor is listening")]
    NoConductor,

    #[error("request to {worker} timed out after {millis}ms")]
    Timeout { worker: WorkerId, millis: u64 },

    #[error("wire encoding failed: {0}")]
    Encoding(String),
}

/// Main error type of the crate.
#[derive(Error, Debug)]
pub enum PregelError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("invalid algorithm parameters: {0}")]
    InvalidParameters(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("graph error: {0}")]
    Graph(String),

    #[error("algorithm error: {0}")]
    Algorithm(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("superstep mismatch: expected {expected}, got {actual}")]
    SuperstepMismatch { expected: u64, actual: u64 },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("job {job} is in phase {phase}, results are not available")]
    ResultsUnavailable { job: JobId, phase: String },

    #[error("job {0} was canceled")]
    Canceled(JobId),

    #[error("worker {worker} replied with {code}: {message}")]
    Remote {
        worker: WorkerId,
        code: ErrorCode,
        message: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, PregelError>;

impl PregelError {
    /// The wire code a worker uses when it reports this error to the conductor.
    pub fn code(&self) -> ErrorCode {
        match self {
            PregelError::JobNotFound(_) => ErrorCode::UnknownJob,
            PregelError::UnknownAlgorithm(_) | PregelError::InvalidParameters(_) => {
                ErrorCode::BadParameter
            }
            PregelError::Graph(_) => ErrorCode::Io,
            PregelError::Algorithm(_) => ErrorCode::Algorithm,
            PregelError::SuperstepMismatch { .. } => ErrorCode::SuperstepMismatch,
            PregelError::Timeout(_) => ErrorCode::Timeout,
            PregelError::Protocol(_) => ErrorCode::Protocol,
            PregelError::Transport(_) => ErrorCode::Transport,
            PregelError::Canceled(_) => ErrorCode::Canceled,
            _ => ErrorCode::Internal,
        }
    }

    pub fn to_reply(&self) -> ErrorReply {
        ErrorReply {
            code: self.code(),
            message: self.to_string(),
        }
    }

    pub(crate) fn from_reply(worker: WorkerId, reply: ErrorReply) -> Self {
        PregelError::Remote {
            worker,
            code: reply.code,
            message: reply.message,
        }
    }
}

impl From<String> for PregelError {
    fn from(s: String) -> Self {
        PregelError::Algorithm(s)
    }
}

impl From<&str> for PregelError {
    fn from(s: &str) -> Self {
        PregelError::Algorithm(s.to_string())
    }
}
