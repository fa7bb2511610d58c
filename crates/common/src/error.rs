//! Error types for the arca orchestrator
//!
//! Every error carries a coarse [`ErrorKind`] and, where one exists, the
//! repository object it concerns, so that failures can be folded into a
//! report as audit records instead of aborting a run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

use crate::types::{ObjectKind, ObjectRef};

/// Lifecycle hook that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStage {
    BeforeExecute,
    AfterExecute,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::BeforeExecute => f.write_str("before_execute"),
            HookStage::AfterExecute => f.write_str("after_execute"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ArcaError {
    #[error("Invalid orchestrator method '{0}'")]
    InvalidOrchestratorMethod(String),

    #[error("No plugin was found with the id '{0}'")]
    PluginNotFound(String),

    #[error("Invalid plugin parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid object selector: {0}")]
    InvalidSelector(String),

    #[error("Plugin hook {stage} failed: {message}")]
    Hook { stage: HookStage, message: String },

    #[error("Execution error: {message}")]
    Execution {
        message: String,
        object: Option<ObjectRef>,
    },

    #[error("Worker pool unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Malformed worker result: {0}")]
    MalformedResult(String),

    #[error("{kind} with id '{id}' was not found")]
    NotFound { kind: ObjectKind, id: String },

    #[error("Job with id '{0}' was not found")]
    JobNotFound(String),

    #[error("Invalid job state transition: {0}")]
    InvalidTransition(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Object source error: {0}")]
    Source(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for arca operations
pub type ArcaResult<T> = Result<T, ArcaError>;

/// Coarse classification recorded in report items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Hook,
    Worker,
    Timeout,
    Malformed,
    NotFound,
    Cancelled,
    Source,
    Storage,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Hook => "hook",
            ErrorKind::Worker => "worker",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Malformed => "malformed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Source => "source",
            ErrorKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ArcaError {
    /// Build an execution error for a specific object.
    pub fn execution_for(object: ObjectRef, message: impl Into<String>) -> Self {
        ArcaError::Execution {
            message: message.into(),
            object: Some(object),
        }
    }

    pub fn hook(stage: HookStage, message: impl Into<String>) -> Self {
        ArcaError::Hook {
            stage,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArcaError::InvalidOrchestratorMethod(_)
            | ArcaError::PluginNotFound(_)
            | ArcaError::InvalidParameter(_)
            | ArcaError::InvalidSelector(_)
            | ArcaError::InvalidTransition(_)
            | ArcaError::Config(_) => ErrorKind::Validation,
            ArcaError::Hook { .. } => ErrorKind::Hook,
            ArcaError::Execution { .. } | ArcaError::WorkerUnavailable(_) => ErrorKind::Worker,
            ArcaError::Timeout(_) => ErrorKind::Timeout,
            ArcaError::MalformedResult(_) => ErrorKind::Malformed,
            ArcaError::NotFound { .. } | ArcaError::JobNotFound(_) => ErrorKind::NotFound,
            ArcaError::Cancelled => ErrorKind::Cancelled,
            ArcaError::Source(_) | ArcaError::Io(_) => ErrorKind::Source,
            ArcaError::Storage(_) | ArcaError::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// The repository object this error is about, if any.
    #[must_use]
    pub fn object_ref(&self) -> Option<ObjectRef> {
        match self {
            ArcaError::NotFound { kind, id } => Some(ObjectRef::new(*kind, id.clone())),
            ArcaError::Execution { object, .. } => object.clone(),
            _ => None,
        }
    }

    /// Validation errors are fatal and raised before any dispatch.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_carries_object_ref() {
        let err = ArcaError::NotFound {
            kind: ObjectKind::Aip,
            id: "aip-1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.object_ref(), Some(ObjectRef::new(ObjectKind::Aip, "aip-1")));
        assert_eq!(err.to_string(), "aip with id 'aip-1' was not found");
    }

    #[test]
    fn validation_classification() {
        assert!(ArcaError::PluginNotFound("x".into()).is_validation());
        assert!(ArcaError::InvalidOrchestratorMethod("x".into()).is_validation());
        assert!(!ArcaError::hook(HookStage::BeforeExecute, "boom").is_validation());
        assert!(!ArcaError::Cancelled.is_validation());
    }
}
