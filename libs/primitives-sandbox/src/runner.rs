/// Test Runner - one engine call per test case, judged against expectations
///
/// **Core Responsibility:**
/// Run the submission once per `TestCase` with the case input as stdin and
/// compare stdout against the expected output.
///
/// **Normalization Rules (all languages):**
/// - `\r\n` is treated as `\n`
/// - Trailing whitespace on each line: ignored
/// - Trailing newlines at end of output: ignored
/// - Leading whitespace and internal spacing: significant
/// - Case: significant
///
/// **Guarantees:**
/// - Exactly one `TestResult` per `TestCase`, in input order
/// - A crash or timeout in one case never stops the others
/// - Hidden cases never echo their expected or actual output
use crate::engine::{ExecutionEngine, ExecutionLimits, ExecutionRequest};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use primitives_common::types::{ExecutionResult, FailureKind, Language, TestCase, TestResult};
use primitives_common::SandboxError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_SUMMARY_CHARS: usize = 200;

/// Normalize program output for comparison.
pub fn normalize_output(output: &str) -> String {
    let unified = output.replace("\r\n", "\n");
    let lines: Vec<&str> = unified.split('\n').map(str::trim_end).collect();
    lines.join("\n").trim_end_matches('\n').to_string()
}

pub fn outputs_match(expected: &str, actual: &str) -> bool {
    normalize_output(expected) == normalize_output(actual)
}

/// The line of stderr most likely to explain a failure.
pub fn summarize_stderr(stderr: &str) -> String {
    let line = stderr
        .lines()
        .map(str::trim)
        .find(|l| {
            l.contains("Error") || l.contains("error:") || l.contains("Exception") || l.starts_with("panic:")
        })
        .or_else(|| stderr.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("");

    if line.chars().count() > MAX_SUMMARY_CHARS {
        let cut: String = line.chars().take(MAX_SUMMARY_CHARS).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

/// Interpreter-reported syntax problems, as opposed to runtime failures.
pub fn is_syntax_failure(result: &ExecutionResult) -> bool {
    if result.compilation_failed {
        return true;
    }
    !result.succeeded()
        && ["SyntaxError", "IndentationError", "TabError"]
            .iter()
            .any(|marker| result.stderr.contains(marker))
}

/// Classify a finished execution. `None` means the program ran cleanly and
/// its output decides the verdict.
pub fn classify_failure(result: &ExecutionResult) -> Option<FailureKind> {
    if is_syntax_failure(result) {
        Some(FailureKind::Syntax)
    } else if result.timed_out {
        Some(FailureKind::Timeout)
    } else if result.resource_exceeded {
        Some(FailureKind::ResourceExceeded)
    } else if !result.succeeded() {
        Some(FailureKind::Runtime)
    } else {
        None
    }
}

fn failure_message(kind: FailureKind, result: &ExecutionResult, timeout: Duration) -> String {
    match kind {
        FailureKind::Syntax if result.compilation_failed => {
            format!("Compilation failed: {}", summarize_stderr(&result.stderr))
        }
        FailureKind::Syntax => format!("Syntax error: {}", summarize_stderr(&result.stderr)),
        FailureKind::Timeout => format!("Execution timed out after {} ms", timeout.as_millis()),
        FailureKind::ResourceExceeded => "Memory or resource limit exceeded".to_string(),
        FailureKind::Runtime if result.cancelled => "Execution cancelled".to_string(),
        FailureKind::Runtime => {
            let summary = summarize_stderr(&result.stderr);
            if !summary.is_empty() {
                format!("Runtime error: {}", summary)
            } else if let Some(signal) = result.signal {
                format!("Runtime error: terminated by signal {}", signal)
            } else {
                format!("Runtime error: exited with code {}", result.exit_code.unwrap_or(-1))
            }
        }
        FailureKind::Mismatch => "Output did not match expected".to_string(),
    }
}

/// Judge one execution against its test case.
pub fn evaluate_case(case: &TestCase, result: &ExecutionResult, timeout: Duration) -> TestResult {
    let failure = classify_failure(result).or_else(|| {
        if outputs_match(&case.expected_output, &result.stdout) {
            None
        } else {
            Some(FailureKind::Mismatch)
        }
    });
    let passed = failure.is_none();

    let message = match failure {
        None => "Test passed".to_string(),
        Some(_) if case.hidden => "Hidden test failed".to_string(),
        Some(kind) => failure_message(kind, result, timeout),
    };

    let (expected, actual) = if case.hidden {
        (None, None)
    } else {
        (Some(case.expected_output.clone()), Some(normalize_output(&result.stdout)))
    };

    TestResult {
        id: case.id.clone(),
        name: case.name.clone(),
        passed,
        expected,
        actual,
        message,
        hidden: case.hidden,
        failure,
    }
}

#[derive(Clone)]
pub struct TestRunner {
    engine: Arc<dyn ExecutionEngine>,
    limits: ExecutionLimits,
    max_parallel: usize,
}

impl TestRunner {
    pub fn new(engine: Arc<dyn ExecutionEngine>, limits: ExecutionLimits, max_parallel: usize) -> Self {
        Self {
            engine,
            limits,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run every case. Cases run up to `max_parallel` at a time; results come
    /// back in input order. Only `EngineUnavailable` aborts the batch.
    pub async fn run_all(
        &self,
        code: &str,
        language: Language,
        cases: &[TestCase],
        cancel: &CancellationToken,
    ) -> Result<Vec<TestResult>, SandboxError> {
        let runs: Vec<_> = cases.iter().map(|case| self.run_case(code, language, case, cancel)).collect();

        let results: Vec<TestResult> = stream::iter(runs).buffered(self.max_parallel).try_collect().await?;

        debug!(
            language = %language,
            total = results.len(),
            passed = results.iter().filter(|r| r.passed).count(),
            "Test cases evaluated"
        );
        Ok(results)
    }

    async fn run_case(
        &self,
        code: &str,
        language: Language,
        case: &TestCase,
        cancel: &CancellationToken,
    ) -> Result<TestResult, SandboxError> {
        let timeout = case
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.limits.timeout);

        let request = ExecutionRequest::new(language, code, case.input.clone(), self.limits.with_timeout(timeout))
            .with_cancel(cancel.child_token());

        let result = self.engine.execute(request).await?;
        Ok(evaluate_case(case, &result, timeout))
    }
}
