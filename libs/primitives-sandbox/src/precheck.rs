// Static Pre-Check: shape checks plus policy rules, before anything runs.

use crate::policy::{PolicyRegistry, Verdict};
use primitives_common::types::Submission;
use primitives_common::SandboxError;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PreCheck {
    registry: Arc<PolicyRegistry>,
    max_code_bytes: usize,
}

impl PreCheck {
    pub fn new(registry: Arc<PolicyRegistry>, max_code_bytes: usize) -> Self {
        Self {
            registry,
            max_code_bytes,
        }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Reject a submission that must not reach the execution engine.
    ///
    /// Shape problems are `Validation`; a policy hit is `SecurityViolation`
    /// carrying the rule description, never its pattern.
    pub fn validate(&self, submission: &Submission) -> Result<(), SandboxError> {
        if submission.code.trim().is_empty() {
            return Err(SandboxError::Validation("code must not be empty".to_string()));
        }

        if submission.code.len() > self.max_code_bytes {
            return Err(SandboxError::Validation(format!(
                "code exceeds maximum size of {} bytes",
                self.max_code_bytes
            )));
        }

        match self.registry.check(&submission.code, submission.language) {
            Verdict::Allowed => {
                debug!(
                    language = %submission.language,
                    code_bytes = submission.code.len(),
                    "Pre-check passed"
                );
                Ok(())
            }
            Verdict::Blocked(rule) => {
                warn!(
                    language = %submission.language,
                    rule_id = %rule.id,
                    "Submission rejected by policy"
                );
                Err(SandboxError::SecurityViolation(rule.description.clone()))
            }
            Verdict::UnknownLanguage => Err(SandboxError::Validation(format!(
                "unsupported language: {}",
                submission.language
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitives_common::types::Language;

    fn precheck() -> PreCheck {
        PreCheck::new(Arc::new(PolicyRegistry::builtin().unwrap()), 64 * 1024)
    }

    #[test]
    fn test_accepts_clean_code() {
        let submission = Submission::new("print(int(input()) * 2)", Language::Python);
        assert!(precheck().validate(&submission).is_ok());
    }

    #[test]
    fn test_rejects_empty_code() {
        let submission = Submission::new("   \n\t", Language::JavaScript);
        assert!(matches!(
            precheck().validate(&submission),
            Err(SandboxError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_code() {
        let check = PreCheck::new(Arc::new(PolicyRegistry::builtin().unwrap()), 16);
        let submission = Submission::new("console.log('a long line of code');", Language::JavaScript);
        let err = check.validate(&submission).unwrap_err();
        assert!(matches!(err, SandboxError::Validation(ref m) if m.contains("16 bytes")));
    }

    #[test]
    fn test_code_at_limit_is_accepted() {
        let code = "print(1)";
        let check = PreCheck::new(Arc::new(PolicyRegistry::builtin().unwrap()), code.len());
        assert!(check.validate(&Submission::new(code, Language::Python)).is_ok());
    }

    #[test]
    fn test_security_violation_carries_description_not_pattern() {
        let submission = Submission::new("eval('2 + 2')", Language::JavaScript);
        let err = precheck().validate(&submission).unwrap_err();
        assert_eq!(
            err,
            SandboxError::SecurityViolation("dynamic code evaluation".to_string())
        );
        let message = err.to_string();
        assert!(!message.contains("\\b"));
        assert!(!message.contains("eval"));
    }

    #[test]
    fn test_disabled_language_is_validation_error() {
        let check = PreCheck::new(
            Arc::new(PolicyRegistry::builtin_for(&[Language::Python]).unwrap()),
            1024,
        );
        let err = check
            .validate(&Submission::new("package main", Language::Go))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Validation(ref m) if m.contains("go")));
    }
}
