use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Languages the sandbox knows how to run. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    Python,
    Go,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::JavaScript, Language::Python, Language::Go];

    /// Parse the wire name of a language. Anything outside the closed set is `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "javascript" => Some(Language::JavaScript),
            "python" => Some(Language::Python),
            "go" => Some(Language::Go),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Go => "go",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Learner-facing failure taxonomy carried as `errorType` on every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorType {
    Syntax,
    Runtime,
    Logic,
    Timeout,
    EdgeCase,
}

/// A piece of learner code plus its target language.
#[derive(Debug, Clone)]
pub struct Submission {
    pub code: String,
    pub language: Language,
    pub stdin: Option<String>,
}

impl Submission {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Test case as consumed by the sandbox. Input and expected output are
/// already rendered to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub id: String,
    pub name: String,
    pub input: String,
    pub expected_output: String,
    pub hidden: bool,
    pub timeout_ms: Option<u64>,
}

/// Output of one isolated run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub resource_exceeded: bool,
    pub compilation_failed: bool,
    pub cancelled: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// True when the program ran to completion and exited with status 0.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
            && !self.timed_out
            && !self.resource_exceeded
            && !self.compilation_failed
            && !self.cancelled
    }
}

/// Why a single test case did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Syntax,
    Timeout,
    Runtime,
    ResourceExceeded,
    Mismatch,
}

/// Per-case verdict. Serialized as one entry of `results` / `testResults`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: String,
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    pub message: String,
    pub hidden: bool,
    #[serde(skip)]
    pub failure: Option<FailureKind>,
}

/// Result of scoring one submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub score: u32,
    pub xp_earned: u32,
    pub passed: bool,
    pub feedback: String,
}

// ---------------------------------------------------------------------------
// Wire contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub input: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_violation: Option<String>,
}

/// Test case as it arrives from the content store. `input` and `expected`
/// may be any JSON value.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestCaseInput {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub expected: Value,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl TestCaseInput {
    pub fn into_test_case(self) -> TestCase {
        TestCase {
            name: if self.name.is_empty() {
                self.id.clone()
            } else {
                self.name
            },
            id: self.id,
            input: value_to_text(&self.input),
            expected_output: value_to_text(&self.expected),
            hidden: self.hidden,
            timeout_ms: self.timeout,
        }
    }
}

/// Render a JSON test value as program text: strings verbatim, `null` as
/// nothing, everything else as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub test_cases: Vec<TestCaseInput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResponse {
    pub success: bool,
    pub passed: u32,
    pub failed: u32,
    pub results: Vec<TestResult>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_violation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub test_cases: Vec<TestCaseInput>,
    #[serde(default)]
    pub hints_used: u32,
    #[serde(default)]
    pub time_spent_seconds: u32,
    #[serde(default)]
    pub expected_minutes: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub score: u32,
    pub passed: bool,
    pub test_results: Vec<TestResult>,
    pub xp_earned: u32,
    pub feedback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_violation: Option<String>,
}
