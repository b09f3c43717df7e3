// Language execution recipes, loaded from config/languages.json
use crate::policy::{PolicyRegistry, PolicyRule};
use anyhow::{bail, Context, Result};
use primitives_common::config::SandboxConfig;
use primitives_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config/languages.json";

/// Loaded with `--require` ahead of learner JavaScript. Module loading is
/// blocked for learners, so stdin is exposed as `input`, `readInput()` and a
/// line cursor `readLine()`.
const JS_PRELUDE: &str = "'use strict';(()=>{let d='';try{d=require('fs').readFileSync(0,'utf8');}catch(_){}const l=d.split(/\\r?\\n/);let i=0;globalThis.input=d;globalThis.readInput=()=>d;globalThis.readLine=()=>(i<l.length?l[i++]:undefined);})();\n";

/// One program invocation. Arguments may contain `{source}`, `{binary}`,
/// `{dir}` and `{memory_mb}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub file_extension: String,
    /// Compile step for compiled languages; its failure is reported as a
    /// failed run, not an engine error.
    #[serde(default)]
    pub compile: Option<CommandSpec>,
    /// Extra environment for both phases. Values accept placeholders.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraRule {
    pub id: String,
    pub pattern: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    pub execution: LanguageExecution,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    /// Process backend only: writable memory allowed on top of the memory
    /// ceiling for runtime overhead such as thread stacks.
    #[serde(default)]
    pub memory_headroom_mb: u32,
    #[serde(default)]
    pub blocked_patterns: Vec<ExtraRule>,
}

impl LanguageConfig {
    pub fn language(&self) -> Option<Language> {
        Language::parse(&self.name)
    }

    pub fn source_file_name(&self) -> String {
        format!("main.{}", self.execution.file_extension.trim_start_matches('.'))
    }

    /// Files written next to the source before anything runs.
    pub fn support_files(&self) -> Vec<(&'static str, &'static str)> {
        match self.language() {
            Some(Language::JavaScript) => vec![("prelude.js", JS_PRELUDE)],
            _ => Vec::new(),
        }
    }

    pub fn run_command(&self) -> CommandSpec {
        CommandSpec {
            command: self.execution.command.clone(),
            args: self.execution.args.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            let Some(language) = lang.language() else {
                bail!("Unknown language '{}' (expected javascript, python or go)", lang.name);
            };
            if configs.insert(language, lang).is_some() {
                bail!("Language '{}' is configured more than once", language);
            }
        }

        if configs.is_empty() {
            bail!("No languages configured");
        }

        Ok(Self { configs })
    }

    /// Explicit path if configured, else the default file if present, else
    /// the built-in table.
    pub fn resolve(config: &SandboxConfig) -> Result<Self> {
        if let Some(path) = &config.languages_config {
            let manager = Self::load(path)?;
            info!(path = %path.display(), languages = ?manager.list_languages(), "Loaded language configurations");
            return Ok(manager);
        }

        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            let manager = Self::load(default_path)?;
            info!(path = DEFAULT_CONFIG_PATH, languages = ?manager.list_languages(), "Loaded language configurations");
            return Ok(manager);
        }

        warn!("No languages.json found, using built-in language recipes");
        Ok(Self::builtin())
    }

    /// Built-in recipes for node, python3 and go.
    pub fn builtin() -> Self {
        let mut configs = HashMap::new();

        configs.insert(
            Language::JavaScript,
            LanguageConfig {
                name: "javascript".to_string(),
                version: "20".to_string(),
                image: "node:20-alpine".to_string(),
                execution: LanguageExecution {
                    command: "node".to_string(),
                    args: vec![
                        "--disallow-code-generation-from-strings".to_string(),
                        "--max-old-space-size={memory_mb}".to_string(),
                        "--require".to_string(),
                        "{dir}/prelude.js".to_string(),
                        "{source}".to_string(),
                    ],
                    file_extension: "js".to_string(),
                    compile: None,
                    env: BTreeMap::new(),
                },
                memory_limit_mb: 256,
                cpu_limit: 0.5,
                memory_headroom_mb: 128,
                blocked_patterns: Vec::new(),
            },
        );

        configs.insert(
            Language::Python,
            LanguageConfig {
                name: "python".to_string(),
                version: "3.12".to_string(),
                image: "python:3.12-alpine".to_string(),
                execution: LanguageExecution {
                    command: "python3".to_string(),
                    args: vec!["-I".to_string(), "-B".to_string(), "-u".to_string(), "{source}".to_string()],
                    file_extension: "py".to_string(),
                    compile: None,
                    env: BTreeMap::new(),
                },
                memory_limit_mb: 256,
                cpu_limit: 0.5,
                memory_headroom_mb: 0,
                blocked_patterns: Vec::new(),
            },
        );

        let mut go_env = BTreeMap::new();
        go_env.insert("GOCACHE".to_string(), "{dir}/.gocache".to_string());
        go_env.insert("GOPATH".to_string(), "{dir}/.gopath".to_string());
        go_env.insert("GOTOOLCHAIN".to_string(), "local".to_string());
        go_env.insert("GO111MODULE".to_string(), "off".to_string());
        go_env.insert("CGO_ENABLED".to_string(), "0".to_string());
        go_env.insert("GOMEMLIMIT".to_string(), "{memory_mb}MiB".to_string());

        configs.insert(
            Language::Go,
            LanguageConfig {
                name: "go".to_string(),
                version: "1.22".to_string(),
                image: "golang:1.22-alpine".to_string(),
                execution: LanguageExecution {
                    command: "{binary}".to_string(),
                    args: Vec::new(),
                    file_extension: "go".to_string(),
                    compile: Some(CommandSpec {
                        command: "go".to_string(),
                        args: vec![
                            "build".to_string(),
                            "-o".to_string(),
                            "{binary}".to_string(),
                            "{source}".to_string(),
                        ],
                    }),
                    env: go_env,
                },
                memory_limit_mb: 512,
                cpu_limit: 1.0,
                memory_headroom_mb: 64,
                blocked_patterns: Vec::new(),
            },
        );

        Self { configs }
    }

    /// Replace or add the recipe for one language.
    pub fn with_config(mut self, config: LanguageConfig) -> Result<Self> {
        let Some(language) = config.language() else {
            bail!("Unknown language '{}'", config.name);
        };
        self.configs.insert(language, config);
        Ok(self)
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    /// Configured languages, sorted.
    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.configs.keys().copied().collect();
        languages.sort();
        languages
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        self.languages().iter().map(|l| l.to_string()).collect()
    }

    /// Policy registry for the configured languages: built-in rules first,
    /// then any `blocked_patterns` from the config file.
    pub fn policy_registry(&self) -> Result<PolicyRegistry> {
        let languages = self.languages();
        let mut registry = PolicyRegistry::builtin_for(&languages)?;

        for language in languages {
            let config = self.get_config(&language)?;
            for extra in &config.blocked_patterns {
                let rule = PolicyRule::new(language, &extra.id, &extra.pattern, &extra.description)
                    .with_context(|| format!("Invalid blocked pattern '{}' for {}", extra.id, language))?;
                registry.register(rule);
            }
        }

        Ok(registry)
    }
}

/// Substitute recipe placeholders.
pub fn render_template(template: &str, vars: &TemplateVars<'_>) -> String {
    template
        .replace("{source}", vars.source)
        .replace("{binary}", vars.binary)
        .replace("{dir}", vars.dir)
        .replace("{memory_mb}", &vars.memory_mb.to_string())
}

#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub source: &'a str,
    pub binary: &'a str,
    pub dir: &'a str,
    pub memory_mb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "languages": [
            {
                "name": "python",
                "version": "3.12",
                "image": "python:3.12-alpine",
                "execution": { "command": "python3", "args": ["{source}"], "file_extension": ".py" },
                "memory_limit_mb": 128,
                "cpu_limit": 0.25,
                "blocked_patterns": [
                    { "id": "py-while-true", "pattern": "while\\s+True", "description": "unbounded loop" }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_builtin_covers_all_languages() {
        let manager = LanguageConfigManager::builtin();
        assert_eq!(manager.languages(), Language::ALL.to_vec());
        let go = manager.get_config(&Language::Go).unwrap();
        assert!(go.execution.compile.is_some());
        assert_eq!(go.source_file_name(), "main.go");
        assert!(go.support_files().is_empty());

        let js = manager.get_config(&Language::JavaScript).unwrap();
        let files = js.support_files();
        assert_eq!(files[0].0, "prelude.js");
        assert!(files[0].1.contains("readLine"));
        assert!(js.execution.args.iter().any(|a| a == "{dir}/prelude.js"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let manager = LanguageConfigManager::load(file.path()).unwrap();
        assert_eq!(manager.list_languages(), vec!["python".to_string()]);
        let python = manager.get_config(&Language::Python).unwrap();
        assert_eq!(python.memory_limit_mb, 128);
        assert_eq!(python.memory_headroom_mb, 0);
        assert_eq!(python.image, "python:3.12-alpine");
        assert_eq!(python.source_file_name(), "main.py");
        assert!(manager.get_config(&Language::Go).is_err());
    }

    #[test]
    fn test_shipped_config_matches_builtin() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        let shipped = LanguageConfigManager::load(&path).unwrap();
        let builtin = LanguageConfigManager::builtin();

        assert_eq!(shipped.languages(), builtin.languages());
        for language in builtin.languages() {
            assert_eq!(
                shipped.get_config(&language).unwrap(),
                builtin.get_config(&language).unwrap(),
                "recipe drift for {}",
                language
            );
        }
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = LanguageConfigManager::load(Path::new("/nonexistent/languages.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_unknown_language_rejected() {
        let json = r#"{ "languages": [ {
            "name": "cobol", "version": "1", "image": "x",
            "execution": { "command": "cobc", "file_extension": "cob" },
            "memory_limit_mb": 64, "cpu_limit": 0.1
        } ] }"#;
        let err = LanguageConfigManager::from_json(json).unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn test_policy_registry_includes_extra_rules() {
        let manager = LanguageConfigManager::from_json(SAMPLE).unwrap();
        let registry = manager.policy_registry().unwrap();

        assert!(registry.supports(Language::Python));
        assert!(!registry.supports(Language::JavaScript));
        assert_eq!(registry.rules_for(Language::Python).last().unwrap().id, "py-while-true");
        assert!(!registry.check("while True:\n  pass", Language::Python).is_allowed());
    }

    #[test]
    fn test_render_template() {
        let vars = TemplateVars {
            source: "/tmp/x/main.go",
            binary: "/tmp/x/main",
            dir: "/tmp/x",
            memory_mb: 256,
        };
        assert_eq!(render_template("{dir}/.gocache", &vars), "/tmp/x/.gocache");
        assert_eq!(
            render_template("--max-old-space-size={memory_mb}", &vars),
            "--max-old-space-size=256"
        );
        assert_eq!(render_template("{binary}", &vars), "/tmp/x/main");
    }
}
