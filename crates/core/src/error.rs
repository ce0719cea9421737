//! Closed failure taxonomy for the creation pipeline.
//!
//! Every fallible step returns exactly one of these variants; the
//! orchestrator is the only place they are turned into a caller-facing
//! response. String matching on messages is never required.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// Devfile source could not be fetched (repository unreachable, missing
    /// file).
    #[error("devfile could not be loaded: {details}")]
    DevfileLoadFailed { details: String },

    /// Source fetched but is not valid YAML.
    #[error("devfile YAML could not be parsed: {details}")]
    DevfileYamlParseFailed { details: String },

    /// Request params or required devfile top-level fields are missing or
    /// malformed.
    #[error("invalid request: {}", .violations.join("; "))]
    ParamsValidationFailed { violations: Vec<String> },

    #[error("devfile restrictions failed: {}", .violations.join("; "))]
    PreFlattenValidationFailed { violations: Vec<String> },

    #[error("flattened devfile restrictions failed: {}", .violations.join("; "))]
    PostFlattenValidationFailed { violations: Vec<String> },

    /// Unresolved or cyclic parent references, or a merge that cannot be
    /// reconciled deterministically.
    #[error("devfile flatten failed: {details}")]
    DevfileFlattenFailed { details: String },

    /// Constraint or quota violation while persisting the workspace.
    #[error("workspace create failed: {details}")]
    WorkspaceCreateFailed { details: String },
}

impl PipelineError {
    /// Caller-facing reason code. The match is exhaustive: a new variant
    /// without a classification is a compile error, not a silent default.
    pub fn reason(&self) -> ErrorReason {
        match self {
            PipelineError::WorkspaceCreateFailed { .. } => ErrorReason::Conflict,
            PipelineError::DevfileLoadFailed { .. }
            | PipelineError::DevfileYamlParseFailed { .. }
            | PipelineError::ParamsValidationFailed { .. }
            | PipelineError::PreFlattenValidationFailed { .. }
            | PipelineError::PostFlattenValidationFailed { .. }
            | PipelineError::DevfileFlattenFailed { .. } => ErrorReason::BadRequest,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    BadRequest,
    Conflict,
}

impl ErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorReason::BadRequest => "bad_request",
            ErrorReason::Conflict => "conflict",
        }
    }
}

/// Uniform outcome shape the pipeline hands back to its caller. Raw stack
/// traces never cross this boundary; violation details ride in `message`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineResponse<T> {
    Success { payload: T },
    Error { message: String, reason: ErrorReason },
}

impl<T> PipelineResponse<T> {
    pub fn from_error(err: PipelineError) -> Self {
        PipelineResponse::Error { reason: err.reason(), message: err.to_string() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PipelineResponse::Success { .. })
    }
}
