// Sandbox configuration, read from the environment at process start.

use std::path::PathBuf;
use std::str::FromStr;

/// Which execution backend runs untrusted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Local subprocess per call (Linux) with rlimits, whole-tree kill and
    /// an optional network namespace.
    Process,
    /// Throwaway Docker container per call.
    Docker,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Backend::Process),
            "docker" => Ok(Backend::Docker),
            other => Err(format!("unknown sandbox backend '{}' (expected process|docker)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: Backend,
    pub default_timeout_ms: u64,
    pub compile_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
    pub max_output_bytes: usize,
    pub max_test_cases: usize,
    pub max_concurrency: usize,
    pub max_parallel_tests: usize,
    pub memory_limit_mb: u64,
    pub isolate_network: bool,
    pub languages_config: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Process,
            default_timeout_ms: 5000,
            compile_timeout_ms: 15000,
            max_timeout_ms: 30000,
            max_code_bytes: 64 * 1024,
            max_input_bytes: 64 * 1024,
            max_output_bytes: 64 * 1024,
            max_test_cases: 50,
            max_concurrency: 8,
            max_parallel_tests: 4,
            memory_limit_mb: 256,
            isolate_network: true,
            languages_config: None,
        }
    }
}

impl SandboxConfig {
    /// Build the config from `SANDBOX_*` variables. Unset variables keep
    /// their default; values that do not parse are an error.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but with an injectable lookup, so tests never
    /// touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            backend: parse_var(&lookup, "SANDBOX_BACKEND", defaults.backend)?,
            default_timeout_ms: parse_var(&lookup, "SANDBOX_TIMEOUT_MS", defaults.default_timeout_ms)?,
            compile_timeout_ms: parse_var(
                &lookup,
                "SANDBOX_COMPILE_TIMEOUT_MS",
                defaults.compile_timeout_ms,
            )?,
            max_timeout_ms: parse_var(&lookup, "SANDBOX_MAX_TIMEOUT_MS", defaults.max_timeout_ms)?,
            max_code_bytes: parse_var(&lookup, "SANDBOX_MAX_CODE_BYTES", defaults.max_code_bytes)?,
            max_input_bytes: parse_var(&lookup, "SANDBOX_MAX_INPUT_BYTES", defaults.max_input_bytes)?,
            max_output_bytes: parse_var(
                &lookup,
                "SANDBOX_MAX_OUTPUT_BYTES",
                defaults.max_output_bytes,
            )?,
            max_test_cases: parse_var(&lookup, "SANDBOX_MAX_TEST_CASES", defaults.max_test_cases)?,
            max_concurrency: parse_var(&lookup, "SANDBOX_MAX_CONCURRENCY", defaults.max_concurrency)?
                .max(1),
            max_parallel_tests: parse_var(
                &lookup,
                "SANDBOX_MAX_PARALLEL_TESTS",
                defaults.max_parallel_tests,
            )?
            .max(1),
            memory_limit_mb: parse_var(&lookup, "SANDBOX_MEMORY_MB", defaults.memory_limit_mb)?,
            isolate_network: parse_var(&lookup, "SANDBOX_ISOLATE_NETWORK", defaults.isolate_network)?,
            languages_config: lookup("SANDBOX_LANGUAGES_CONFIG")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, String>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| format!("invalid value for {}: '{}' ({})", key, raw, e)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = SandboxConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.backend, Backend::Process);
        assert_eq!(config.default_timeout_ms, 5000);
        assert_eq!(config.max_code_bytes, 65536);
        assert_eq!(config.max_output_bytes, 65536);
        assert!(config.isolate_network);
        assert!(config.languages_config.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = SandboxConfig::from_lookup(lookup_from(&[
            ("SANDBOX_BACKEND", "docker"),
            ("SANDBOX_TIMEOUT_MS", "1000"),
            ("SANDBOX_ISOLATE_NETWORK", "false"),
            ("SANDBOX_LANGUAGES_CONFIG", "config/languages.json"),
        ]))
        .unwrap();
        assert_eq!(config.backend, Backend::Docker);
        assert_eq!(config.default_timeout_ms, 1000);
        assert!(!config.isolate_network);
        assert_eq!(config.languages_config, Some(PathBuf::from("config/languages.json")));
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let err = SandboxConfig::from_lookup(lookup_from(&[("SANDBOX_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(err.contains("SANDBOX_TIMEOUT_MS"));

        let err = SandboxConfig::from_lookup(lookup_from(&[("SANDBOX_BACKEND", "vm")])).unwrap_err();
        assert!(err.contains("unknown sandbox backend"));
    }

    #[test]
    fn test_concurrency_floor_is_one() {
        let config =
            SandboxConfig::from_lookup(lookup_from(&[("SANDBOX_MAX_CONCURRENCY", "0")])).unwrap();
        assert_eq!(config.max_concurrency, 1);
    }
}
