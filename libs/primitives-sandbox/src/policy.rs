/// Language Policy Registry
///
/// Per-language, ordered list of forbidden source constructs. The first
/// matching rule in registration order is the one reported.
///
/// The registry is built once at startup and only read afterwards, so it is
/// shared behind an `Arc` without locking.
///
/// Pattern matching over source text is a tripwire, not the isolation
/// boundary. The execution engine is what actually contains the program.
use primitives_common::types::Language;
use regex::Regex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub language: Language,
    pub id: String,
    pub description: String,
    pattern: Regex,
}

impl PolicyRule {
    pub fn new(
        language: Language,
        id: impl Into<String>,
        pattern: &str,
        description: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            language,
            id: id.into(),
            description: description.into(),
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn matches(&self, code: &str) -> bool {
        self.pattern.is_match(code)
    }
}

/// Outcome of a policy check.
#[derive(Debug, Clone, Copy)]
pub enum Verdict<'a> {
    Allowed,
    Blocked(&'a PolicyRule),
    /// No rule set is registered for the language. Treated as a rejection.
    UnknownLanguage,
}

impl Verdict<'_> {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    rules: HashMap<Language, Vec<PolicyRule>>,
}

const DYNAMIC_EVAL: &str = "dynamic code evaluation";
const MODULE_LOADING: &str = "module loading";
const NETWORK: &str = "network access";
const FILESYSTEM: &str = "filesystem access";
const PROCESS: &str = "process and operating system access";
const INTERNALS: &str = "interpreter internals";

/// (id, pattern, description) in registration order.
const JAVASCRIPT_RULES: &[(&str, &str, &str)] = &[
    ("js-eval", r"\beval\s*\(", DYNAMIC_EVAL),
    ("js-function-ctor", r"\bFunction\s*\(", DYNAMIC_EVAL),
    ("js-require", r"\brequire\s*\(", MODULE_LOADING),
    ("js-import", r#"\bimport\s*[\s(\{*'"`]"#, MODULE_LOADING),
    ("js-fetch", r"\bfetch\s*\(", NETWORK),
    ("js-xhr", r"\bXMLHttpRequest\b", NETWORK),
    ("js-websocket", r"\bWebSocket\b", NETWORK),
    ("js-process", r"\bprocess\s*[.\[]", PROCESS),
    ("js-module-paths", r"\b__dirname\b|\b__filename\b", FILESYSTEM),
    ("js-constructor-chain", r#"\bconstructor\s*\.\s*constructor\b|\[\s*['"`]constructor['"`]\s*\]"#, DYNAMIC_EVAL),
    ("js-global-object", r"\bglobalThis\b|\bglobal\s*[.\[]", INTERNALS),
    ("js-child-process", r"\bchild_process\b", PROCESS),
];

const PYTHON_RULES: &[(&str, &str, &str)] = &[
    ("py-os", r"(?m)(?:^|;)[ \t]*(?:import|from)[ \t]+[\w \t,.]*?\bos\b", PROCESS),
    ("py-subprocess", r"(?m)(?:^|;)[ \t]*(?:import|from)[ \t]+[\w \t,.]*?\b(?:subprocess|pty|signal|multiprocessing)\b", PROCESS),
    ("py-sys", r"(?m)(?:^|;)[ \t]*(?:import|from)[ \t]+[\w \t,.]*?\b(?:sys|ctypes|importlib|builtins|gc|inspect)\b", INTERNALS),
    ("py-network", r"(?m)(?:^|;)[ \t]*(?:import|from)[ \t]+[\w \t,.]*?\b(?:socket|urllib|http|requests|ftplib|smtplib|ssl|asyncio)\b", NETWORK),
    ("py-filesystem", r"(?m)(?:^|;)[ \t]*(?:import|from)[ \t]+[\w \t,.]*?\b(?:shutil|pathlib|tempfile|glob|io)\b", FILESYSTEM),
    ("py-exec", r"\bexec\s*\(", DYNAMIC_EVAL),
    ("py-eval", r"\beval\s*\(", DYNAMIC_EVAL),
    ("py-open", r"\bopen\s*\(", FILESYSTEM),
    ("py-dunder-import", r"\b__import__\b", MODULE_LOADING),
    ("py-compile", r"\bcompile\s*\(", DYNAMIC_EVAL),
    ("py-dunder-internals", r"\b__(?:builtins|subclasses|globals|code|loader|spec)__\b", INTERNALS),
];

const GO_RULES: &[(&str, &str, &str)] = &[
    ("go-os", r#""os(?:/exec|/signal|/user)?""#, PROCESS),
    ("go-net", r#""net(?:/[\w/.]*)?""#, NETWORK),
    ("go-filesystem", r#""(?:io/ioutil|io/fs|path/filepath|embed)""#, FILESYSTEM),
    ("go-syscall", r#""(?:syscall|golang\.org/x/sys[\w/.]*)""#, PROCESS),
    ("go-unsafe", r#""(?:unsafe|plugin|runtime/debug|reflect)""#, INTERNALS),
];

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in rule sets for every language.
    pub fn builtin() -> Result<Self, regex::Error> {
        Self::builtin_for(&Language::ALL)
    }

    /// Registry with built-in rules for the given languages only. Languages
    /// left out are rejected by `check`.
    pub fn builtin_for(languages: &[Language]) -> Result<Self, regex::Error> {
        let mut registry = Self::new();
        for language in languages {
            registry.enable(*language);
            let table = match language {
                Language::JavaScript => JAVASCRIPT_RULES,
                Language::Python => PYTHON_RULES,
                Language::Go => GO_RULES,
            };
            for (id, pattern, description) in table {
                registry.register(PolicyRule::new(*language, *id, pattern, *description)?);
            }
        }
        Ok(registry)
    }

    /// Mark a language as supported even if it has no rules.
    pub fn enable(&mut self, language: Language) {
        self.rules.entry(language).or_default();
    }

    /// Append a rule after the ones already registered for its language.
    pub fn register(&mut self, rule: PolicyRule) {
        self.rules.entry(rule.language).or_default().push(rule);
    }

    pub fn rules_for(&self, language: Language) -> &[PolicyRule] {
        self.rules.get(&language).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn supports(&self, language: Language) -> bool {
        self.rules.contains_key(&language)
    }

    pub fn check(&self, code: &str, language: Language) -> Verdict<'_> {
        let Some(rules) = self.rules.get(&language) else {
            return Verdict::UnknownLanguage;
        };

        rules
            .iter()
            .find(|rule| rule.matches(code))
            .map(Verdict::Blocked)
            .unwrap_or(Verdict::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked_id(registry: &PolicyRegistry, code: &str, language: Language) -> Option<String> {
        match registry.check(code, language) {
            Verdict::Blocked(rule) => Some(rule.id.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_allows_plain_programs() {
        let registry = PolicyRegistry::builtin().unwrap();

        let js = "const nums = [1, 2, 3];\nconsole.log(nums.map(function (n) { return n * 2; }));";
        assert!(registry.check(js, Language::JavaScript).is_allowed());

        let py = "n = int(input())\nprint(sum(range(n + 1)))";
        assert!(registry.check(py, Language::Python).is_allowed());

        let go = "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tvar n int\n\tfmt.Scan(&n)\n\tfmt.Println(n * 2)\n}";
        assert!(registry.check(go, Language::Go).is_allowed());
    }

    #[test]
    fn test_blocks_javascript_constructs() {
        let registry = PolicyRegistry::builtin().unwrap();
        let cases = [
            ("eval('1+1')", "js-eval"),
            ("new Function('return 1')()", "js-function-ctor"),
            ("const fs = require('fs')", "js-require"),
            ("import fs from 'fs'", "js-import"),
            ("import('fs').then(x => x)", "js-import"),
            ("fetch('http://example.com')", "js-fetch"),
            ("process.exit(1)", "js-process"),
            ("console.log(__dirname)", "js-module-paths"),
            ("(() => {}).constructor.constructor('return this')()", "js-constructor-chain"),
            ("globalThis.x = 1", "js-global-object"),
        ];
        for (code, expected) in cases {
            assert_eq!(
                blocked_id(&registry, code, Language::JavaScript).as_deref(),
                Some(expected),
                "code: {}",
                code
            );
        }
    }

    #[test]
    fn test_blocks_python_constructs() {
        let registry = PolicyRegistry::builtin().unwrap();
        let cases = [
            ("import os\nprint(os.getcwd())", "py-os"),
            ("import math, os", "py-os"),
            ("from os import path", "py-os"),
            ("x = 1; import subprocess", "py-subprocess"),
            ("import sys", "py-sys"),
            ("import socket", "py-network"),
            ("exec('print(1)')", "py-exec"),
            ("eval('1')", "py-eval"),
            ("open('/etc/passwd').read()", "py-open"),
            ("__import__('os')", "py-dunder-import"),
            ("().__class__.__subclasses__()", "py-dunder-internals"),
        ];
        for (code, expected) in cases {
            assert_eq!(
                blocked_id(&registry, code, Language::Python).as_deref(),
                Some(expected),
                "code: {}",
                code
            );
        }
    }

    #[test]
    fn test_blocks_go_imports_in_blocks() {
        let registry = PolicyRegistry::builtin().unwrap();
        let code = "package main\n\nimport (\n\t\"fmt\"\n\t\"os\"\n)\n\nfunc main() { fmt.Println(os.Args) }";
        assert_eq!(blocked_id(&registry, code, Language::Go).as_deref(), Some("go-os"));

        let code = "package main\nimport \"net/http\"\nfunc main() { http.Get(\"x\") }";
        assert_eq!(blocked_id(&registry, code, Language::Go).as_deref(), Some("go-net"));
    }

    #[test]
    fn test_first_match_wins_in_registration_order() {
        let registry = PolicyRegistry::builtin().unwrap();
        // Both eval and require match; eval is registered first.
        let code = "require('fs'); eval('x')";
        assert_eq!(
            blocked_id(&registry, code, Language::JavaScript).as_deref(),
            Some("js-eval")
        );

        let code = "require('vm').constructor.constructor('return 1')()";
        assert_eq!(
            blocked_id(&registry, code, Language::JavaScript).as_deref(),
            Some("js-require")
        );

        let code = "globalThis.child_process";
        assert_eq!(
            blocked_id(&registry, code, Language::JavaScript).as_deref(),
            Some("js-global-object")
        );

        let code = "src = open('main.py').read()\ncode = compile(src, 'x', 'exec')";
        assert_eq!(blocked_id(&registry, code, Language::Python).as_deref(), Some("py-open"));

        let code = "f = __import__; g = compile('1', 'x', 'eval')";
        assert_eq!(
            blocked_id(&registry, code, Language::Python).as_deref(),
            Some("py-dunder-import")
        );
    }

    #[test]
    fn test_custom_rule_appends_after_builtin() {
        let mut registry = PolicyRegistry::builtin_for(&[Language::Python]).unwrap();
        registry.register(
            PolicyRule::new(Language::Python, "py-custom", r"\bwhile\s+True\b", "unbounded loop").unwrap(),
        );
        assert_eq!(
            blocked_id(&registry, "while True:\n    pass", Language::Python).as_deref(),
            Some("py-custom")
        );
        assert_eq!(registry.rules_for(Language::Python).last().unwrap().id, "py-custom");
    }

    #[test]
    fn test_unknown_language_fails_closed() {
        let registry = PolicyRegistry::builtin_for(&[Language::Python]).unwrap();
        assert!(matches!(
            registry.check("console.log(1)", Language::JavaScript),
            Verdict::UnknownLanguage
        ));
        assert!(!registry.check("", Language::Go).is_allowed());

        let empty = PolicyRegistry::new();
        assert!(!empty.check("print(1)", Language::Python).is_allowed());
    }

    #[test]
    fn test_enabled_language_without_rules_is_allowed() {
        let mut registry = PolicyRegistry::new();
        registry.enable(Language::Go);
        assert!(registry.supports(Language::Go));
        assert!(registry.check("package main", Language::Go).is_allowed());
    }
}
