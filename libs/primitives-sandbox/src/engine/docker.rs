/// Docker Engine - one throwaway container per execution
///
/// **Container Rules:**
/// 1. Pulls the language image if it is not cached
/// 2. Creates the container locked down:
///    - Network disabled
///    - Memory ceiling with swap equal to memory (no swap)
///    - CPU quota and pids limit
///    - Read-only root filesystem, size-limited tmpfs scratch at /sandbox
///    - All capabilities dropped, no-new-privileges, unprivileged user
/// 3. Injects source and stdin as base64 environment variables
/// 4. Streams stdout/stderr into bounded buffers
/// 5. Kills the container on timeout or cancellation
/// 6. Removes the container through a drop guard
///
/// A compile failure inside the container exits with `COMPILE_FAILED_EXIT`.
use super::output::BoundedBuffer;
use super::{effective_memory_mb, reports_resource_exhaustion, ExecutionEngine, ExecutionRequest};
use crate::languages::{render_template, LanguageConfig, LanguageConfigManager, TemplateVars};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use primitives_common::config::SandboxConfig;
use primitives_common::types::ExecutionResult;
use primitives_common::SandboxError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const SCRATCH_DIR: &str = "/sandbox";
const SCRATCH_TMPFS: &str = "rw,exec,nosuid,size=64m,mode=1777";
const SANDBOX_USER: &str = "65534:65534";
const PIDS_LIMIT: i64 = 64;
pub const COMPILE_FAILED_EXIT: i64 = 201;

/// Container cleanup guard - guarantees container removal on drop,
/// including when the execution future is cancelled mid-flight.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl ContainerGuard {
    fn new(docker: &Docker, container_id: String) -> Self {
        Self {
            docker: docker.clone(),
            container_id,
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        // Drop cannot await; hand removal to the runtime if there is one.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let options = RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };
                if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                    warn!(container_id = %container_id, error = %e, "Failed to remove container");
                }
            });
        }
    }
}

pub struct DockerEngine {
    docker: Docker,
    languages: Arc<LanguageConfigManager>,
    permits: Arc<Semaphore>,
}

impl DockerEngine {
    /// Connect to the local Docker daemon. Does not contact it yet.
    pub fn connect(config: &SandboxConfig, languages: Arc<LanguageConfigManager>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::EngineUnavailable(format!("failed to connect to Docker daemon: {}", e)))?;

        Ok(Self {
            docker,
            languages,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        })
    }

    /// Ensure the image is available, pulling it when missing.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::EngineUnavailable(format!("failed to pull image '{}': {}", image, e)))?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn run_container(
        &self,
        recipe: &LanguageConfig,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        let memory_mb = effective_memory_mb(&request.limits, recipe.memory_limit_mb);
        self.ensure_image(&recipe.image).await?;

        let container_name = format!("sandbox-{}", uuid::Uuid::new_v4());
        let config = Config {
            image: Some(recipe.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), build_script(recipe, memory_mb)]),
            env: Some(container_env(recipe, request, memory_mb)),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(SCRATCH_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(host_config(recipe, memory_mb)),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::EngineUnavailable(format!("failed to create container: {}", e)))?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let started = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::EngineUnavailable(format!("failed to start container: {}", e)))?;

        let limit = request.limits.max_output_bytes;
        let mut stdout = BoundedBuffer::new(limit);
        let mut stderr = BoundedBuffer::new(limit);

        let collect = async {
            let mut logs = self.docker.logs(
                &container_id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            let mut wait = self.docker.wait_container(
                &container_id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            match wait.next().await {
                Some(Ok(response)) => Some(response.status_code),
                // Non-zero exits come back as this error variant.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to wait for container");
                    None
                }
                None => None,
            }
        };

        let mut timed_out = false;
        let mut cancelled = false;
        let exit_code = tokio::select! {
            code = collect => code,
            _ = tokio::time::sleep(request.limits.timeout + compile_allowance(recipe, request)) => {
                timed_out = true;
                None
            }
            _ = request.cancel.cancelled() => {
                cancelled = true;
                None
            }
        };

        if timed_out || cancelled {
            if let Err(e) = self
                .docker
                .kill_container(&container_id, None::<KillContainerOptions<String>>)
                .await
            {
                warn!(container_id = %container_id, error = %e, "Failed to kill container");
            }
        }

        let oom_killed = match self.docker.inspect_container(&container_id, None).await {
            Ok(details) => details.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(_) => false,
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let (stdout_text, stdout_truncated) = stdout.to_text();
        let (stderr_text, stderr_truncated) = stderr.to_text();

        let compilation_failed = recipe.execution.compile.is_some() && exit_code == Some(COMPILE_FAILED_EXIT);
        let exit_code = exit_code.map(|c| i32::try_from(c).unwrap_or(i32::MAX));
        let resource_exceeded = !timed_out
            && !cancelled
            && (oom_killed || (exit_code != Some(0) && reports_resource_exhaustion(&stderr_text)));

        Ok(ExecutionResult {
            stdout: stdout_text,
            stderr: stderr_text,
            exit_code,
            signal: exit_code.filter(|c| *c > 128 && *c < 160).map(|c| c - 128),
            duration_ms,
            timed_out,
            resource_exceeded,
            compilation_failed,
            cancelled,
            stdout_truncated,
            stderr_truncated,
        })
    }
}

#[async_trait]
impl ExecutionEngine for DockerEngine {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let recipe = self
            .languages
            .get_config(&request.language)
            .map_err(|e| SandboxError::Validation(e.to_string()))?;

        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit
                .map_err(|_| SandboxError::EngineUnavailable("execution pool is closed".to_string()))?,
            _ = request.cancel.cancelled() => {
                return Ok(ExecutionResult { cancelled: true, ..Default::default() });
            }
        };

        let result = self.run_container(recipe, &request).await?;
        debug!(
            language = %request.language,
            duration_ms = result.duration_ms,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            "Container execution finished"
        );
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

/// The compile step runs inside the same container, so its budget is added
/// to the wall clock rather than timed separately.
fn compile_allowance(recipe: &LanguageConfig, request: &ExecutionRequest) -> std::time::Duration {
    if recipe.execution.compile.is_some() {
        request.limits.compile_timeout
    } else {
        std::time::Duration::ZERO
    }
}

fn template_vars<'a>(source: &'a str, memory_mb: u64) -> TemplateVars<'a> {
    TemplateVars {
        source,
        binary: "/sandbox/main",
        dir: SCRATCH_DIR,
        memory_mb,
    }
}

fn container_env(recipe: &LanguageConfig, request: &ExecutionRequest, memory_mb: u64) -> Vec<String> {
    let source = format!("{}/{}", SCRATCH_DIR, recipe.source_file_name());
    let vars = template_vars(&source, memory_mb);

    let mut env = vec![
        format!("SOURCE_CODE={}", general_purpose::STANDARD.encode(&request.code)),
        format!("SANDBOX_STDIN={}", general_purpose::STANDARD.encode(&request.stdin)),
        format!("HOME={}", SCRATCH_DIR),
        format!("TMPDIR={}", SCRATCH_DIR),
    ];
    for (index, (_, content)) in recipe.support_files().iter().enumerate() {
        env.push(format!("SUPPORT_FILE_{}={}", index, general_purpose::STANDARD.encode(content)));
    }
    for (key, value) in &recipe.execution.env {
        env.push(format!("{}={}", key, render_template(value, &vars)));
    }
    env
}

/// Shell script run as the container command.
fn build_script(recipe: &LanguageConfig, memory_mb: u64) -> String {
    let source = format!("{}/{}", SCRATCH_DIR, recipe.source_file_name());
    let vars = template_vars(&source, memory_mb);

    let mut script = format!("printf '%s' \"$SOURCE_CODE\" | base64 -d > {}", shell_quote(&source));
    for (index, (name, _)) in recipe.support_files().iter().enumerate() {
        script.push_str(&format!(
            "\nprintf '%s' \"$SUPPORT_FILE_{}\" | base64 -d > {}",
            index,
            shell_quote(&format!("{}/{}", SCRATCH_DIR, name))
        ));
    }

    if let Some(compile) = &recipe.execution.compile {
        let mut line = vec![shell_quote(&render_template(&compile.command, &vars))];
        line.extend(compile.args.iter().map(|a| shell_quote(&render_template(a, &vars))));
        script.push_str(&format!(
            "\n{} > /sandbox/.compile.log 2>&1 || {{ cat /sandbox/.compile.log >&2; exit {}; }}",
            line.join(" "),
            COMPILE_FAILED_EXIT
        ));
    }

    let mut run = vec![shell_quote(&render_template(&recipe.execution.command, &vars))];
    run.extend(recipe.execution.args.iter().map(|a| shell_quote(&render_template(a, &vars))));
    script.push_str(&format!("\nprintf '%s' \"$SANDBOX_STDIN\" | base64 -d | {}", run.join(" ")));
    script
}

fn host_config(recipe: &LanguageConfig, memory_mb: u64) -> HostConfig {
    let memory_bytes = i64::try_from(memory_mb * 1024 * 1024).unwrap_or(i64::MAX);
    let mut tmpfs = HashMap::new();
    tmpfs.insert(SCRATCH_DIR.to_string(), SCRATCH_TMPFS.to_string());

    HostConfig {
        memory: Some(memory_bytes),
        memory_swap: Some(memory_bytes),
        nano_cpus: Some((f64::from(recipe.cpu_limit) * 1_000_000_000.0) as i64),
        pids_limit: Some(PIDS_LIMIT),
        readonly_rootfs: Some(true),
        tmpfs: Some(tmpfs),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        network_mode: Some("none".to_string()),
        ..Default::default()
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionLimits;
    use primitives_common::types::Language;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_script_for_compiled_language() {
        let manager = LanguageConfigManager::builtin();
        let go = manager.get_config(&Language::Go).unwrap();
        let script = build_script(go, 256);

        assert!(script.contains("base64 -d > '/sandbox/main.go'"));
        assert!(script.contains("'go' 'build' '-o' '/sandbox/main' '/sandbox/main.go'"));
        assert!(script.contains(&format!("exit {}", COMPILE_FAILED_EXIT)));
        assert!(script.ends_with("| base64 -d | '/sandbox/main'"));
    }

    #[test]
    fn test_script_writes_javascript_prelude() {
        let manager = LanguageConfigManager::builtin();
        let js = manager.get_config(&Language::JavaScript).unwrap();
        let script = build_script(js, 128);

        assert!(script.contains("\"$SUPPORT_FILE_0\" | base64 -d > '/sandbox/prelude.js'"));
        assert!(script.contains("'--max-old-space-size=128'"));
        assert!(!script.contains("exit 201"));
    }

    #[test]
    fn test_container_env_encodes_payloads() {
        let manager = LanguageConfigManager::builtin();
        let py = manager.get_config(&Language::Python).unwrap();
        let request = ExecutionRequest::new(Language::Python, "print(1)", "5\n", ExecutionLimits::default());

        let env = container_env(py, &request, 256);
        assert!(env.contains(&format!("SOURCE_CODE={}", general_purpose::STANDARD.encode("print(1)"))));
        assert!(env.contains(&format!("SANDBOX_STDIN={}", general_purpose::STANDARD.encode("5\n"))));
        assert!(env.iter().all(|e| !e.contains("print(1)")));
    }

    #[test]
    fn test_host_config_is_locked_down() {
        let manager = LanguageConfigManager::builtin();
        let py = manager.get_config(&Language::Python).unwrap();
        let host = host_config(py, 128);

        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory, host.memory_swap);
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert!(host.tmpfs.unwrap().contains_key("/sandbox"));
    }
}
