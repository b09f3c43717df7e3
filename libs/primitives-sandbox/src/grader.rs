/// Grading Orchestrator - Run, Test and Submit
///
/// **Pipeline:**
/// - Run: validate → Pre-Check → one engine call → run response
/// - Test: validate → Pre-Check → Test Runner → counts + overall error type
/// - Submit: validate → Pre-Check → Test Runner → Scorer
///
/// A Pre-Check rejection returns the operation's normal response with
/// `securityViolation` set. The engine is never touched in that case.
/// Only `Validation` and `EngineUnavailable` leave as errors.
use crate::engine::{create_engine, ExecutionEngine, ExecutionLimits, ExecutionRequest};
use crate::languages::LanguageConfigManager;
use crate::precheck::PreCheck;
use crate::runner::{is_syntax_failure, TestRunner};
use crate::scorer;
use primitives_common::config::SandboxConfig;
use primitives_common::types::{
    ErrorType, ExecutionResult, FailureKind, Language, RunRequest, RunResponse, Submission, SubmitRequest,
    SubmitResponse, TestCase, TestCaseInput, TestRequest, TestResponse, TestResult,
};
use primitives_common::SandboxError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub const MAX_HINTS: u32 = 10;
pub const MAX_TIME_SPENT_SECONDS: u32 = 86_400;
pub const SECURITY_FEEDBACK: &str = "Security check failed";

pub struct Grader {
    precheck: PreCheck,
    engine: Arc<dyn ExecutionEngine>,
    runner: TestRunner,
    limits: ExecutionLimits,
    config: SandboxConfig,
    languages: Vec<Language>,
}

impl Grader {
    pub fn new(config: &SandboxConfig, precheck: PreCheck, engine: Arc<dyn ExecutionEngine>) -> Self {
        let limits = ExecutionLimits::from_config(config);
        let languages = Language::ALL
            .iter()
            .copied()
            .filter(|l| precheck.registry().supports(*l))
            .collect();

        Self {
            runner: TestRunner::new(engine.clone(), limits, config.max_parallel_tests),
            precheck,
            engine,
            limits,
            config: config.clone(),
            languages,
        }
    }

    /// Wire up language recipes, policy rules and the configured backend.
    pub fn from_config(config: &SandboxConfig) -> anyhow::Result<Self> {
        let manager = Arc::new(LanguageConfigManager::resolve(config)?);
        let registry = Arc::new(manager.policy_registry()?);
        let engine = create_engine(config, manager)?;
        let precheck = PreCheck::new(registry, config.max_code_bytes);
        Ok(Self::new(config, precheck, engine))
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn languages(&self) -> &[Language] {
        &self.languages
    }

    pub fn precheck(&self) -> &PreCheck {
        &self.precheck
    }

    #[instrument(skip_all, fields(operation = "run", language = %request.language))]
    pub async fn run(&self, request: RunRequest, cancel: CancellationToken) -> Result<RunResponse, SandboxError> {
        let language = parse_language(&request.language)?;
        let stdin = request.input.unwrap_or_default();
        self.check_input_size(&stdin, "input")?;

        let submission = Submission::new(request.code, language).with_stdin(stdin);
        if let Some(description) = self.screen(&submission)? {
            return Ok(RunResponse {
                success: false,
                error: Some(SandboxError::SecurityViolation(description.clone()).to_string()),
                error_type: Some(ErrorType::Syntax),
                security_violation: Some(description),
                ..Default::default()
            });
        }

        let Submission { code, language, stdin } = submission;
        let execution = ExecutionRequest::new(language, code, stdin.unwrap_or_default(), self.limits)
            .with_cancel(cancel);
        let result = self.engine.execute(execution).await?;

        info!(
            language = %language,
            execution_ms = result.duration_ms,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            "Run finished"
        );
        Ok(run_response(result, self.limits.timeout))
    }

    #[instrument(skip_all, fields(operation = "test", language = %request.language))]
    pub async fn test(&self, request: TestRequest, cancel: CancellationToken) -> Result<TestResponse, SandboxError> {
        let language = parse_language(&request.language)?;
        let cases = self.prepare_cases(request.test_cases)?;

        let submission = Submission::new(request.code, language);
        if let Some(description) = self.screen(&submission)? {
            return Ok(TestResponse {
                success: false,
                error_type: Some(ErrorType::Syntax),
                security_violation: Some(description),
                ..Default::default()
            });
        }

        let started = Instant::now();
        let results = self.runner.run_all(&submission.code, language, &cases, &cancel).await?;
        let passed = results.iter().filter(|r| r.passed).count() as u32;
        let failed = results.len() as u32 - passed;

        info!(language = %language, passed, failed, "Test finished");
        Ok(TestResponse {
            success: failed == 0,
            passed,
            failed,
            error_type: overall_error_type(&results),
            results,
            execution_time_ms: elapsed_ms(started),
            security_violation: None,
        })
    }

    #[instrument(skip_all, fields(operation = "submit", language = %request.language))]
    pub async fn submit(
        &self,
        request: SubmitRequest,
        cancel: CancellationToken,
    ) -> Result<SubmitResponse, SandboxError> {
        let language = parse_language(&request.language)?;
        if request.hints_used > MAX_HINTS {
            return Err(SandboxError::Validation(format!("hintsUsed must be at most {}", MAX_HINTS)));
        }
        if request.time_spent_seconds > MAX_TIME_SPENT_SECONDS {
            return Err(SandboxError::Validation(format!(
                "timeSpentSeconds must be at most {}",
                MAX_TIME_SPENT_SECONDS
            )));
        }
        let cases = self.prepare_cases(request.test_cases)?;

        let submission = Submission::new(request.code, language);
        if let Some(description) = self.screen(&submission)? {
            return Ok(SubmitResponse {
                success: false,
                feedback: SECURITY_FEEDBACK.to_string(),
                error_type: Some(ErrorType::Syntax),
                security_violation: Some(description),
                ..Default::default()
            });
        }

        let results = self.runner.run_all(&submission.code, language, &cases, &cancel).await?;
        let passed = results.iter().filter(|r| r.passed).count() as u32;
        let breakdown = scorer::score(
            passed,
            results.len() as u32,
            request.hints_used,
            request.time_spent_seconds,
            request.expected_minutes,
        );

        info!(
            language = %language,
            passed,
            total = results.len(),
            score = breakdown.score,
            xp = breakdown.xp_earned,
            "Submit graded"
        );
        Ok(SubmitResponse {
            success: true,
            score: breakdown.score,
            passed: breakdown.passed,
            error_type: overall_error_type(&results),
            test_results: results,
            xp_earned: breakdown.xp_earned,
            feedback: breakdown.feedback,
            security_violation: None,
        })
    }

    /// `Ok(Some(description))` when the policy rejects the code.
    fn screen(&self, submission: &Submission) -> Result<Option<String>, SandboxError> {
        match self.precheck.validate(submission) {
            Ok(()) => Ok(None),
            Err(SandboxError::SecurityViolation(description)) => Ok(Some(description)),
            Err(other) => Err(other),
        }
    }

    fn check_input_size(&self, input: &str, field: &str) -> Result<(), SandboxError> {
        if input.len() > self.config.max_input_bytes {
            return Err(SandboxError::Validation(format!(
                "{} exceeds maximum size of {} bytes",
                field, self.config.max_input_bytes
            )));
        }
        Ok(())
    }

    fn prepare_cases(&self, inputs: Vec<TestCaseInput>) -> Result<Vec<TestCase>, SandboxError> {
        if inputs.len() > self.config.max_test_cases {
            return Err(SandboxError::Validation(format!(
                "at most {} test cases are allowed",
                self.config.max_test_cases
            )));
        }

        let mut cases = Vec::with_capacity(inputs.len());
        for input in inputs {
            if input.id.trim().is_empty() {
                return Err(SandboxError::Validation("test case id must not be empty".to_string()));
            }
            if let Some(timeout) = input.timeout {
                if timeout == 0 || timeout > self.config.max_timeout_ms {
                    return Err(SandboxError::Validation(format!(
                        "test case {} timeout must be between 1 and {} ms",
                        input.id, self.config.max_timeout_ms
                    )));
                }
            }
            let case = input.into_test_case();
            self.check_input_size(&case.input, "test case input")?;
            cases.push(case);
        }
        Ok(cases)
    }
}

fn parse_language(name: &str) -> Result<Language, SandboxError> {
    Language::parse(name).ok_or_else(|| SandboxError::Validation(format!("unsupported language: {}", name)))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Shape one execution as a Run response.
pub fn run_response(result: ExecutionResult, timeout: Duration) -> RunResponse {
    let success = result.succeeded();

    let error_type = if success {
        None
    } else if result.timed_out {
        Some(ErrorType::Timeout)
    } else if is_syntax_failure(&result) {
        Some(ErrorType::Syntax)
    } else {
        Some(ErrorType::Runtime)
    };

    let error = if success {
        None
    } else if result.timed_out {
        Some(format!("Execution timed out after {} ms", timeout.as_millis()))
    } else if result.resource_exceeded {
        Some("Memory or resource limit exceeded".to_string())
    } else if result.cancelled {
        Some("Execution cancelled".to_string())
    } else if !result.stderr.trim().is_empty() {
        Some(result.stderr.clone())
    } else {
        Some(match (result.exit_code, result.signal) {
            (_, Some(signal)) => format!("Process terminated by signal {}", signal),
            (Some(code), None) => format!("Process exited with code {}", code),
            (None, None) => "Execution failed".to_string(),
        })
    };

    RunResponse {
        success,
        output: result.stdout,
        error,
        error_type,
        execution_time_ms: result.duration_ms,
        timed_out: result.timed_out,
        exit_code: result.exit_code,
        security_violation: None,
    }
}

/// Overall failure mode of a test batch: syntax > timeout > runtime >
/// edge-case (hidden mismatch) > logic (visible mismatch).
pub fn overall_error_type(results: &[TestResult]) -> Option<ErrorType> {
    let any = |kinds: &[FailureKind], hidden_only: bool| {
        results
            .iter()
            .any(|r| r.failure.map_or(false, |k| kinds.contains(&k)) && (r.hidden || !hidden_only))
    };

    if any(&[FailureKind::Syntax], false) {
        Some(ErrorType::Syntax)
    } else if any(&[FailureKind::Timeout], false) {
        Some(ErrorType::Timeout)
    } else if any(&[FailureKind::Runtime, FailureKind::ResourceExceeded], false) {
        Some(ErrorType::Runtime)
    } else if any(&[FailureKind::Mismatch], true) {
        Some(ErrorType::EdgeCase)
    } else if any(&[FailureKind::Mismatch], false) {
        Some(ErrorType::Logic)
    } else {
        None
    }
}
