use thiserror::Error;

/// Classified failures of a sandbox operation.
///
/// A submission that crashes, loops forever or prints the wrong answer is
/// *not* an error: those outcomes live inside `ExecutionResult`. Only the
/// three kinds below leave the normal response path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    /// Malformed request: unsupported language, empty or oversized code,
    /// out-of-range counters.
    #[error("validation error: {0}")]
    Validation(String),

    /// Pre-Check rejected the source. Carries the rule description only.
    #[error("Security violation: blocked pattern detected ({0})")]
    SecurityViolation(String),

    /// The sandbox could not start an execution context at all.
    #[error("sandbox engine unavailable: {0}")]
    EngineUnavailable(String),
}

impl SandboxError {
    /// Stable machine-readable code used by the HTTP layer.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::Validation(_) => "VALIDATION_ERROR",
            SandboxError::SecurityViolation(_) => "SECURITY_VIOLATION",
            SandboxError::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
        }
    }
}
