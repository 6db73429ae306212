//! Core error type for the MESH orchestration core.
//!
//! `MeshError` is returned by the registry, the graph builder and the
//! orchestrator. Per-step failures are never thrown; they are recorded on the
//! step result as an [`ErrorDetail`]. When the `axum` feature is enabled the
//! error also implements `IntoResponse` so protocol adapters can return it
//! directly from handlers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeshError {
    #[error("Invalid agent record: {0}")]
    InvalidRecord(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Step '{step}' has invalid loop bound {max_iterations} (must be >= 1)")]
    InvalidLoopBound { step: String, max_iterations: u32 },

    #[error("Invalid parameters for step '{step}': {reason}")]
    InvalidParameters { step: String, reason: String },

    #[error("All candidates exhausted for step '{step}' after {attempts} attempt(s){}", error_suffix(.last_error))]
    AllCandidatesExhausted {
        step: String,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("Workflow run '{run_id}' timed out after {timeout_ms}ms")]
    WorkflowTimedOut { run_id: String, timeout_ms: u64 },

    #[error("Step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(": {}", e))
        .unwrap_or_default()
}

impl MeshError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            MeshError::InvalidRecord(_) => "INVALID_RECORD",
            MeshError::NotFound(_) => "NOT_FOUND",
            MeshError::EmptyWorkflow(_) => "EMPTY_WORKFLOW",
            MeshError::DuplicateStep(_) => "DUPLICATE_STEP",
            MeshError::UnknownDependency { .. } => "UNKNOWN_DEPENDENCY",
            MeshError::CyclicDependency(_) => "CYCLIC_DEPENDENCY",
            MeshError::InvalidLoopBound { .. } => "INVALID_LOOP_BOUND",
            MeshError::InvalidParameters { .. } => "INVALID_PARAMETERS",
            MeshError::AllCandidatesExhausted { .. } => "ALL_CANDIDATES_EXHAUSTED",
            MeshError::WorkflowTimedOut { .. } => "WORKFLOW_TIMED_OUT",
            MeshError::StepFailed { .. } => "STEP_FAILED",
            MeshError::Conflict(_) => "CONFLICT",
            MeshError::Cancelled(_) => "CANCELLED",
            MeshError::Config(_) => "CONFIG",
            MeshError::Internal(_) => "INTERNAL",
        }
    }

    /// True for errors raised while compiling a workflow definition.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            MeshError::EmptyWorkflow(_)
                | MeshError::DuplicateStep(_)
                | MeshError::UnknownDependency { .. }
                | MeshError::CyclicDependency(_)
                | MeshError::InvalidLoopBound { .. }
                | MeshError::InvalidParameters { .. }
        )
    }
}

/// Serializable view of an error, recorded on step results and run snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl From<&MeshError> for ErrorDetail {
    fn from(err: &MeshError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<MeshError> for ErrorDetail {
    fn from(err: MeshError) -> Self {
        ErrorDetail::from(&err)
    }
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for MeshError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            MeshError::NotFound(_) => StatusCode::NOT_FOUND,
            MeshError::InvalidRecord(_) | MeshError::Config(_) => StatusCode::BAD_REQUEST,
            e if e.is_compile_error() => StatusCode::UNPROCESSABLE_ENTITY,
            MeshError::WorkflowTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            MeshError::AllCandidatesExhausted { .. } => StatusCode::BAD_GATEWAY,
            MeshError::Conflict(_) | MeshError::Cancelled(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string(), "code": self.code() });
        (status, axum::Json(body)).into_response()
    }
}
