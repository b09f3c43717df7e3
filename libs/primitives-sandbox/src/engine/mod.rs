/// Execution Engine - Isolated Code Execution
///
/// **Core Responsibility:**
/// Run one submission against one stdin with hard limits and return the raw
/// `ExecutionResult`.
///
/// **Architectural Boundary:**
/// - The engine knows HOW to execute (local process group or Docker container)
/// - It does NOT judge correctness or scores
/// - A misbehaving submission (crash, infinite loop, compile error, memory
///   blow-up) is a normal `ExecutionResult`; only failure to create an
///   execution context at all is `SandboxError::EngineUnavailable`
///
/// **Isolation per call:**
/// Every call gets its own scratch directory or container. Nothing mutable is
/// shared between concurrent calls except the concurrency semaphore.
pub mod docker;
pub mod output;
#[cfg(target_os = "linux")]
pub mod process;

use crate::languages::LanguageConfigManager;
use async_trait::async_trait;
use primitives_common::config::{Backend, SandboxConfig};
use primitives_common::types::{ExecutionResult, Language};
use primitives_common::SandboxError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Hard limits applied to a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Wall-clock limit for the program itself.
    pub timeout: Duration,
    /// Wall-clock limit for the compile step of compiled languages.
    pub compile_timeout: Duration,
    pub memory_limit_mb: u64,
    /// Per stream.
    pub max_output_bytes: usize,
}

impl ExecutionLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.default_timeout_ms),
            compile_timeout: Duration::from_millis(config.compile_timeout_ms),
            memory_limit_mb: config.memory_limit_mb,
            max_output_bytes: config.max_output_bytes,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

/// One call into the engine.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: Language,
    pub code: String,
    pub stdin: String,
    pub limits: ExecutionLimits,
    /// Cancelling terminates the execution context immediately.
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(language: Language, code: impl Into<String>, stdin: impl Into<String>, limits: ExecutionLimits) -> Self {
        Self {
            language,
            code: code.into(),
            stdin: stdin.into(),
            limits,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError>;

    /// Backend name for logs and health output.
    fn name(&self) -> &'static str;
}

/// Build the engine selected by `config.backend`.
pub fn create_engine(
    config: &SandboxConfig,
    languages: Arc<LanguageConfigManager>,
) -> Result<Arc<dyn ExecutionEngine>, SandboxError> {
    match config.backend {
        #[cfg(target_os = "linux")]
        Backend::Process => Ok(Arc::new(process::ProcessEngine::new(config, languages))),
        #[cfg(not(target_os = "linux"))]
        Backend::Process => Err(SandboxError::EngineUnavailable(
            "process backend requires a linux host".to_string(),
        )),
        Backend::Docker => Ok(Arc::new(docker::DockerEngine::connect(config, languages)?)),
    }
}

/// Memory ceiling for one run: the per-language recipe may only lower the
/// configured limit.
pub(crate) fn effective_memory_mb(limits: &ExecutionLimits, recipe_mb: u32) -> u64 {
    if recipe_mb == 0 {
        limits.memory_limit_mb
    } else {
        limits.memory_limit_mb.min(u64::from(recipe_mb))
    }
}

/// Runtime messages that mean the program hit a memory ceiling rather than
/// failing on its own.
pub(crate) fn reports_resource_exhaustion(stderr: &str) -> bool {
    const MARKERS: &[&str] = &[
        "MemoryError",
        "JavaScript heap out of memory",
        "out of memory",
        "Cannot allocate memory",
        "allocation failed",
    ];
    MARKERS.iter().any(|marker| stderr.contains(marker))
}

#[cfg(test)]
pub(crate) mod fake {
    //! Engine double that never spawns anything.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Responder = dyn Fn(&ExecutionRequest) -> Result<ExecutionResult, SandboxError> + Send + Sync;

    pub struct FakeEngine {
        calls: AtomicUsize,
        responder: Box<Responder>,
        delay: Box<dyn Fn(&ExecutionRequest) -> Duration + Send + Sync>,
    }

    impl FakeEngine {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&ExecutionRequest) -> Result<ExecutionResult, SandboxError> + Send + Sync + 'static,
        {
            Self {
                calls: AtomicUsize::new(0),
                responder: Box::new(responder),
                delay: Box::new(|_| Duration::ZERO),
            }
        }

        /// Echo stdin back as stdout, exit 0.
        pub fn echo() -> Self {
            Self::new(|req| Ok(ok_output(&req.stdin)))
        }

        pub fn with_delay<D>(mut self, delay: D) -> Self
        where
            D: Fn(&ExecutionRequest) -> Duration + Send + Sync + 'static,
        {
            self.delay = Box::new(delay);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub fn ok_output(stdout: &str) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.to_string(),
            exit_code: Some(0),
            duration_ms: 1,
            ..Default::default()
        }
    }

    #[async_trait]
    impl ExecutionEngine for FakeEngine {
        async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = (self.delay)(&request);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = request.cancel.cancelled() => {
                        return Ok(ExecutionResult { cancelled: true, ..Default::default() });
                    }
                }
            }
            (self.responder)(&request)
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_from_config() {
        let config = SandboxConfig {
            default_timeout_ms: 1234,
            max_output_bytes: 99,
            ..Default::default()
        };
        let limits = ExecutionLimits::from_config(&config);
        assert_eq!(limits.timeout, Duration::from_millis(1234));
        assert_eq!(limits.max_output_bytes, 99);

        let limits = limits.with_timeout(Duration::from_millis(10));
        assert_eq!(limits.timeout, Duration::from_millis(10));
    }

    #[test]
    fn test_effective_memory_only_lowers() {
        let limits = ExecutionLimits {
            memory_limit_mb: 256,
            ..Default::default()
        };
        assert_eq!(effective_memory_mb(&limits, 128), 128);
        assert_eq!(effective_memory_mb(&limits, 512), 256);
        assert_eq!(effective_memory_mb(&limits, 0), 256);
    }

    #[test]
    fn test_resource_markers() {
        assert!(reports_resource_exhaustion("Traceback...\nMemoryError"));
        assert!(reports_resource_exhaustion(
            "FATAL ERROR: Reached heap limit Allocation failed - JavaScript heap out of memory"
        ));
        assert!(reports_resource_exhaustion("fatal error: runtime: out of memory"));
        assert!(reports_resource_exhaustion("RangeError: Array buffer allocation failed"));
        assert!(!reports_resource_exhaustion("ZeroDivisionError: division by zero"));
    }
}
