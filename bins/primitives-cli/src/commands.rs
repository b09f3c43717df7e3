// CLI commands: drive the grader locally and print wire-shaped JSON
use anyhow::{bail, Context, Result};
use primitives_common::config::{Backend, SandboxConfig};
use primitives_common::types::{Language, RunRequest, Submission, SubmitRequest, TestCaseInput, TestRequest};
use primitives_common::SandboxError;
use primitives_sandbox::{Grader, LanguageConfigManager, PreCheck, Verdict};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Cases file: either a bare array or an object with `testCases`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CasesFile {
    List(Vec<TestCaseInput>),
    Wrapped {
        #[serde(rename = "testCases")]
        test_cases: Vec<TestCaseInput>,
    },
}

pub fn load_config(backend: Option<Backend>) -> Result<SandboxConfig> {
    let mut config = SandboxConfig::from_env().map_err(anyhow::Error::msg)?;
    if let Some(backend) = backend {
        config.backend = backend;
    }
    Ok(config)
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read source file {}", path.display()))
}

pub fn load_cases(path: &Path) -> Result<Vec<TestCaseInput>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read test cases {}", path.display()))?;
    parse_cases(&content).with_context(|| format!("Failed to parse test cases {}", path.display()))
}

fn parse_cases(content: &str) -> Result<Vec<TestCaseInput>> {
    Ok(match serde_json::from_str::<CasesFile>(content)? {
        CasesFile::List(cases) => cases,
        CasesFile::Wrapped { test_cases } => test_cases,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Token cancelled on Ctrl-C so a runaway program is killed, not orphaned.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

pub async fn run(
    config: &SandboxConfig,
    language: &str,
    file: &Path,
    input: Option<String>,
    input_file: Option<&Path>,
) -> Result<()> {
    let input = match (input, input_file) {
        (Some(text), _) => Some(text),
        (None, Some(path)) => Some(
            fs::read_to_string(path).with_context(|| format!("Failed to read input file {}", path.display()))?,
        ),
        (None, None) => None,
    };

    let grader = Grader::from_config(config)?;
    let request = RunRequest {
        code: read_source(file)?,
        language: language.to_string(),
        input,
    };
    let response = grader.run(request, interrupt_token()).await?;
    print_json(&response)
}

pub async fn test(config: &SandboxConfig, language: &str, file: &Path, cases: &Path) -> Result<()> {
    let grader = Grader::from_config(config)?;
    let request = TestRequest {
        code: read_source(file)?,
        language: language.to_string(),
        test_cases: load_cases(cases)?,
    };
    let response = grader.test(request, interrupt_token()).await?;
    print_json(&response)
}

#[allow(clippy::too_many_arguments)]
pub async fn submit(
    config: &SandboxConfig,
    language: &str,
    file: &Path,
    cases: &Path,
    hints_used: u32,
    time_spent_seconds: u32,
    expected_minutes: u32,
) -> Result<()> {
    let grader = Grader::from_config(config)?;
    let request = SubmitRequest {
        code: read_source(file)?,
        language: language.to_string(),
        test_cases: load_cases(cases)?,
        hints_used,
        time_spent_seconds,
        expected_minutes,
    };
    let response = grader.submit(request, interrupt_token()).await?;
    print_json(&response)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckReport {
    allowed: bool,
    language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn check(config: &SandboxConfig, language: &str, file: &Path) -> Result<()> {
    let Some(lang) = Language::parse(language) else {
        bail!("unsupported language: {}", language);
    };
    let code = read_source(file)?;

    let manager = LanguageConfigManager::resolve(config)?;
    let precheck = PreCheck::new(Arc::new(manager.policy_registry()?), config.max_code_bytes);
    print_json(&check_report(&precheck, Submission::new(code, lang)))
}

fn check_report(precheck: &PreCheck, submission: Submission) -> CheckReport {
    let language = submission.language.to_string();
    match precheck.validate(&submission) {
        Ok(()) => CheckReport {
            allowed: true,
            language,
            rule_id: None,
            error: None,
        },
        Err(err) => {
            let rule_id = match (&err, precheck.registry().check(&submission.code, submission.language)) {
                (SandboxError::SecurityViolation(_), Verdict::Blocked(rule)) => Some(rule.id.clone()),
                _ => None,
            };
            CheckReport {
                allowed: false,
                language,
                rule_id,
                error: Some(err.to_string()),
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct LanguageSummary {
    name: String,
    version: String,
    image: String,
    command: String,
    compiled: bool,
    memory_limit_mb: u32,
    cpu_limit: f32,
    rules: usize,
}

pub fn languages(config: &SandboxConfig) -> Result<()> {
    let manager = LanguageConfigManager::resolve(config)?;
    let registry = manager.policy_registry()?;

    let mut summaries = Vec::new();
    for language in manager.languages() {
        let recipe = manager.get_config(&language)?;
        let mut command = vec![recipe.execution.command.clone()];
        command.extend(recipe.execution.args.iter().cloned());
        summaries.push(LanguageSummary {
            name: recipe.name.clone(),
            version: recipe.version.clone(),
            image: recipe.image.clone(),
            command: command.join(" "),
            compiled: recipe.execution.compile.is_some(),
            memory_limit_mb: recipe.memory_limit_mb,
            cpu_limit: recipe.cpu_limit,
            rules: registry.rules_for(language).len(),
        });
    }

    print_json(&summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitives_sandbox::PolicyRegistry;
    use std::io::Write;

    #[test]
    fn test_parse_cases_accepts_both_shapes() {
        let list = r#"[{ "id": "1", "input": "2", "expected": "4" }]"#;
        assert_eq!(parse_cases(list).unwrap().len(), 1);

        let wrapped = r#"{ "testCases": [
            { "id": "1", "input": "2", "expected": "4" },
            { "id": "2", "input": 3, "expected": 6, "hidden": true }
        ] }"#;
        let cases = parse_cases(wrapped).unwrap();
        assert_eq!(cases.len(), 2);
        assert!(cases[1].hidden);
    }

    #[test]
    fn test_load_cases_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();
        let err = load_cases(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse test cases"));
    }

    #[test]
    fn test_check_report_names_rule() {
        let precheck = PreCheck::new(Arc::new(PolicyRegistry::builtin().unwrap()), 1024);

        let report = check_report(&precheck, Submission::new("import socket", Language::Python));
        assert!(!report.allowed);
        assert_eq!(report.rule_id.as_deref(), Some("py-network"));

        let report = check_report(&precheck, Submission::new("print(1)", Language::Python));
        assert!(report.allowed);
        assert!(report.error.is_none());
    }

    #[test]
    fn test_backend_override() {
        let config = load_config(Some(Backend::Docker)).unwrap();
        assert_eq!(config.backend, Backend::Docker);
    }
}
