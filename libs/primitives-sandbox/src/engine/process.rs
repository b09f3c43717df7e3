/// Process Engine - local subprocess backend
///
/// **Per-call isolation:**
/// - Fresh `tempfile` scratch directory used as cwd, HOME and TMPDIR
/// - Environment cleared except PATH and the recipe's own variables
/// - A supervisor forked between fork and exec stays behind as the program's
///   subreaper, so everything the program starts (`setsid` included) stays in
///   one process tree; the whole tree is killed when the run ends
/// - rlimits on CPU seconds, open files, file size and writable memory
///   (`RLIMIT_DATA` = memory ceiling + recipe headroom)
/// - Optional user + network namespace so the child sees no network
/// - `PR_SET_NO_NEW_PRIVS`
///
/// Compiled languages run their compile step in the same scratch directory
/// under `compile_timeout`; a failed build is a normal result.
use super::output;
use super::{effective_memory_mb, reports_resource_exhaustion, ExecutionEngine, ExecutionRequest};
use crate::languages::{render_template, CommandSpec, LanguageConfig, LanguageConfigManager, TemplateVars};
use async_trait::async_trait;
use primitives_common::config::SandboxConfig;
use primitives_common::types::ExecutionResult;
use primitives_common::SandboxError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// One shared window, after the tree is killed, for the exit status, the
/// supervisor and both output readers.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Each round of the stop sweep catches processes forked during the last.
const SWEEP_ROUNDS: usize = 8;

/// Upper fd bound for kernels without `close_range`.
const FALLBACK_MAX_FD: libc::c_uint = 4096;

const MIB: u64 = 1024 * 1024;

const RUN_MAX_FILES: u64 = 128;
const COMPILE_MAX_FILES: u64 = 1024;
const RUN_MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;
const COMPILE_MAX_FILE_BYTES: u64 = 256 * 1024 * 1024;

pub struct ProcessEngine {
    languages: Arc<LanguageConfigManager>,
    permits: Arc<Semaphore>,
    isolate_network: bool,
    path: String,
}

impl ProcessEngine {
    pub fn new(config: &SandboxConfig, languages: Arc<LanguageConfigManager>) -> Self {
        Self {
            languages,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            isolate_network: config.isolate_network,
            path: std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string()),
        }
    }

    async fn run_in_scratch(
        &self,
        recipe: &LanguageConfig,
        request: &ExecutionRequest,
        dir: &Path,
    ) -> Result<ExecutionResult, SandboxError> {
        let started = Instant::now();
        let memory_mb = effective_memory_mb(&request.limits, recipe.memory_limit_mb);

        let dir_str = dir.to_string_lossy().into_owned();
        let source = dir.join(recipe.source_file_name());
        let source_str = source.to_string_lossy().into_owned();
        let binary_str = dir.join("main").to_string_lossy().into_owned();
        let vars = TemplateVars {
            source: &source_str,
            binary: &binary_str,
            dir: &dir_str,
            memory_mb,
        };

        tokio::fs::write(&source, &request.code)
            .await
            .map_err(|e| SandboxError::EngineUnavailable(format!("failed to write source: {}", e)))?;
        for (name, content) in recipe.support_files() {
            tokio::fs::write(dir.join(name), content)
                .await
                .map_err(|e| SandboxError::EngineUnavailable(format!("failed to write {}: {}", name, e)))?;
        }

        let env: BTreeMap<String, String> = recipe
            .execution
            .env
            .iter()
            .map(|(k, v)| (k.clone(), render_template(v, &vars)))
            .collect();

        if let Some(compile) = &recipe.execution.compile {
            let plan = PhasePlan {
                timeout: request.limits.compile_timeout,
                max_output_bytes: request.limits.max_output_bytes,
                rlimits: Rlimits {
                    cpu_seconds: cpu_seconds_for(request.limits.compile_timeout) * 4,
                    max_files: COMPILE_MAX_FILES,
                    max_file_bytes: COMPILE_MAX_FILE_BYTES,
                    data_bytes: None,
                    isolate_network: self.isolate_network,
                },
            };
            let phase = self
                .run_phase(compile, &vars, &env, dir, None, &plan, &request.cancel)
                .await?;

            if phase.cancelled {
                return Ok(ExecutionResult {
                    cancelled: true,
                    duration_ms: elapsed_ms(started),
                    ..Default::default()
                });
            }

            if phase.timed_out || !phase.status.map(|s| s.success()).unwrap_or(false) {
                let mut diagnostics = phase.stderr;
                if !phase.stdout.is_empty() {
                    diagnostics = format!("{}{}", phase.stdout, diagnostics);
                }
                if phase.timed_out {
                    diagnostics.push_str(&format!(
                        "\ncompilation timed out after {} ms",
                        request.limits.compile_timeout.as_millis()
                    ));
                }
                debug!(language = %request.language, "Compilation failed");
                return Ok(ExecutionResult {
                    stderr: diagnostics,
                    exit_code: Some(phase.status.and_then(|s| s.code()).filter(|c| *c != 0).unwrap_or(1)),
                    duration_ms: elapsed_ms(started),
                    compilation_failed: true,
                    stderr_truncated: phase.stderr_truncated,
                    ..Default::default()
                });
            }
        }

        let run = recipe.run_command();
        let plan = PhasePlan {
            timeout: request.limits.timeout,
            max_output_bytes: request.limits.max_output_bytes,
            rlimits: Rlimits {
                cpu_seconds: cpu_seconds_for(request.limits.timeout),
                max_files: RUN_MAX_FILES,
                max_file_bytes: RUN_MAX_FILE_BYTES,
                data_bytes: Some((memory_mb + u64::from(recipe.memory_headroom_mb)) * MIB),
                isolate_network: self.isolate_network,
            },
        };
        let phase = self
            .run_phase(&run, &vars, &env, dir, Some(request.stdin.as_bytes()), &plan, &request.cancel)
            .await?;

        let signal = phase.status.and_then(|s| s.signal());
        let resource_exceeded = !phase.timed_out
            && !phase.cancelled
            && (matches!(signal, Some(libc::SIGXCPU) | Some(libc::SIGXFSZ))
                || (signal == Some(libc::SIGKILL) && !phase.killed_by_engine)
                || (!phase.status.map(|s| s.success()).unwrap_or(true)
                    && reports_resource_exhaustion(&phase.stderr)));

        Ok(ExecutionResult {
            stdout: phase.stdout,
            stderr: phase.stderr,
            exit_code: phase.status.and_then(|s| s.code()),
            signal,
            duration_ms: elapsed_ms(started),
            timed_out: phase.timed_out,
            resource_exceeded,
            compilation_failed: false,
            cancelled: phase.cancelled,
            stdout_truncated: phase.stdout_truncated,
            stderr_truncated: phase.stderr_truncated,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phase(
        &self,
        spec: &CommandSpec,
        vars: &TemplateVars<'_>,
        env: &BTreeMap<String, String>,
        dir: &Path,
        stdin: Option<&[u8]>,
        plan: &PhasePlan,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, SandboxError> {
        let program = render_template(&spec.command, vars);
        let args: Vec<String> = spec.args.iter().map(|a| render_template(a, vars)).collect();

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(dir)
            .env_clear()
            .env("PATH", &self.path)
            .env("HOME", dir)
            .env("TMPDIR", dir)
            .env("LANG", "C.UTF-8")
            .envs(env)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let (status_read, status_write) = status_pipe()
            .map_err(|e| SandboxError::EngineUnavailable(format!("failed to create status pipe: {}", e)))?;
        let status_fd = status_write.as_raw_fd();
        let rlimits = plan.rlimits;
        // SAFETY: the closure only issues async-signal-safe syscalls.
        unsafe {
            command.pre_exec(move || {
                apply_restrictions(&rlimits)?;
                fork_supervisor(status_fd)
            });
        }

        let spawned = command.spawn();
        drop(status_write);
        let mut child = spawned.map_err(|e| {
            warn!(program = %program, error = %e, "Failed to spawn sandboxed process");
            SandboxError::EngineUnavailable(format!("failed to start '{}': {}", program, e))
        })?;

        let mut tree = ProcessTreeGuard::new(child.id());
        let mut exit_status = tokio::task::spawn_blocking(move || read_exit_status(status_read));

        if let (Some(mut pipe), Some(bytes)) = (child.stdin.take(), stdin) {
            let bytes = bytes.to_vec();
            tokio::spawn(async move {
                // A program that never reads stdin closes the pipe; that is fine.
                let _ = pipe.write_all(&bytes).await;
                let _ = pipe.shutdown().await;
            });
        }

        let stdout_buf = output::shared(plan.max_output_bytes);
        let stderr_buf = output::shared(plan.max_output_bytes);
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(tokio::spawn(output::read_bounded(pipe, stdout_buf.clone())));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(tokio::spawn(output::read_bounded(pipe, stderr_buf.clone())));
        }

        let mut timed_out = false;
        let mut cancelled = false;
        // Outer `Some` once the status pipe has been read to the end.
        let reported: Option<Option<ExitStatus>> = tokio::select! {
            status = &mut exit_status => Some(status.ok().flatten()),
            _ = tokio::time::sleep(plan.timeout) => {
                timed_out = true;
                None
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                None
            }
        };

        // Whatever is left of the tree dies either way.
        tree.kill();
        let deadline = tokio::time::Instant::now() + DRAIN_GRACE;

        let status = match reported {
            Some(status) => status,
            None => tokio::time::timeout_at(deadline, exit_status)
                .await
                .ok()
                .and_then(|joined| joined.ok())
                .flatten(),
        };

        match tokio::time::timeout_at(deadline, child.wait()).await {
            // Reaped: the pid may be reused from here on.
            Ok(Ok(_)) => tree.disarm(),
            Ok(Err(e)) => debug!(error = %e, "Failed to wait for supervisor"),
            Err(_) => {
                debug!("Supervisor still running after tree kill");
                let _ = child.start_kill();
            }
        }

        for reader in readers {
            if tokio::time::timeout_at(deadline, reader).await.is_err() {
                debug!("Output reader still open after tree kill");
            }
        }

        let (stdout, stdout_truncated) = output::snapshot(&stdout_buf);
        let (stderr, stderr_truncated) = output::snapshot(&stderr_buf);

        Ok(PhaseOutcome {
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            status,
            timed_out,
            cancelled,
            killed_by_engine: timed_out || cancelled,
        })
    }
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
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

        let scratch = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir()
            .map_err(|e| SandboxError::EngineUnavailable(format!("failed to create scratch directory: {}", e)))?;

        let result = self.run_in_scratch(recipe, &request, scratch.path()).await;

        if let Err(e) = scratch.close() {
            warn!(error = %e, "Failed to remove scratch directory");
        }

        if let Ok(result) = &result {
            debug!(
                language = %request.language,
                duration_ms = result.duration_ms,
                exit_code = ?result.exit_code,
                timed_out = result.timed_out,
                "Process execution finished"
            );
        }
        result
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

struct PhasePlan {
    timeout: Duration,
    max_output_bytes: usize,
    rlimits: Rlimits,
}

#[derive(Debug, Clone, Copy)]
struct Rlimits {
    cpu_seconds: u64,
    max_files: u64,
    max_file_bytes: u64,
    /// RLIMIT_DATA; covers heap and private writable mappings.
    data_bytes: Option<u64>,
    isolate_network: bool,
}

struct PhaseOutcome {
    stdout: String,
    stderr: String,
    stdout_truncated: bool,
    stderr_truncated: bool,
    status: Option<ExitStatus>,
    timed_out: bool,
    cancelled: bool,
    killed_by_engine: bool,
}

/// SIGKILLs everything under the supervisor when dropped or asked to.
struct ProcessTreeGuard {
    supervisor: Option<libc::pid_t>,
}

impl ProcessTreeGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            supervisor: pid.and_then(|p| libc::pid_t::try_from(p).ok()).filter(|p| *p > 0),
        }
    }

    fn disarm(&mut self) {
        self.supervisor = None;
    }

    fn kill(&self) {
        let Some(supervisor) = self.supervisor else {
            return;
        };
        if kill_descendants(supervisor) == 0 {
            // Nothing visible in /proc; the program shares the supervisor's group.
            unsafe {
                libc::killpg(supervisor, libc::SIGKILL);
            }
        }
    }
}

impl Drop for ProcessTreeGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Parent pid from the contents of `/proc/<pid>/stat`.
fn parse_ppid(stat: &str) -> Option<libc::pid_t> {
    // comm may itself contain spaces and parentheses
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// Descendants of `root` currently listed in /proc.
fn descendants(root: libc::pid_t) -> Vec<libc::pid_t> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut children: HashMap<libc::pid_t, Vec<libc::pid_t>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<libc::pid_t>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_ppid(&stat) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut pending = vec![root];
    while let Some(pid) = pending.pop() {
        if let Some(kids) = children.get(&pid) {
            found.extend_from_slice(kids);
            pending.extend_from_slice(kids);
        }
    }
    found
}

/// SIGSTOPs the tree under `root` until no new process shows up, then
/// SIGKILLs all of it. Returns how many processes were signalled.
fn kill_descendants(root: libc::pid_t) -> usize {
    let mut stopped: HashSet<libc::pid_t> = HashSet::new();
    for _ in 0..SWEEP_ROUNDS {
        let fresh: Vec<libc::pid_t> = descendants(root)
            .into_iter()
            .filter(|pid| !stopped.contains(pid))
            .collect();
        if fresh.is_empty() {
            break;
        }
        for pid in fresh {
            unsafe {
                libc::kill(pid, libc::SIGSTOP);
            }
            stopped.insert(pid);
        }
    }

    for pid in &stopped {
        unsafe {
            libc::kill(*pid, libc::SIGKILL);
        }
    }
    stopped.len()
}

/// Close-on-exec pipe carrying the program's raw wait status.
fn status_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 just returned both descriptors and nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// `None` when the supervisor went away without reporting.
fn read_exit_status(pipe: OwnedFd) -> Option<ExitStatus> {
    let mut bytes = [0u8; 4];
    File::from(pipe).read_exact(&mut bytes).ok()?;
    Some(ExitStatus::from_raw(i32::from_ne_bytes(bytes)))
}

fn cpu_seconds_for(timeout: Duration) -> u64 {
    timeout.as_secs() + 2
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

fn set_rlimit(resource: Resource, value: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Runs in the child between fork and exec.
fn apply_restrictions(limits: &Rlimits) -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }

    set_rlimit(libc::RLIMIT_CPU, limits.cpu_seconds)?;
    set_rlimit(libc::RLIMIT_NOFILE, limits.max_files)?;
    set_rlimit(libc::RLIMIT_FSIZE, limits.max_file_bytes)?;
    if let Some(bytes) = limits.data_bytes {
        set_rlimit(libc::RLIMIT_DATA, bytes)?;
    }

    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if limits.isolate_network && unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Runs in the child between fork and exec, after `apply_restrictions`.
/// Forks once more: the new process returns and execs the program, this one
/// never returns and supervises it.
fn fork_supervisor(status_fd: RawFd) -> io::Result<()> {
    let supervisor = unsafe { libc::getpid() };
    let program = unsafe { libc::fork() };
    if program < 0 {
        return Err(io::Error::last_os_error());
    }
    if program > 0 {
        // SAFETY: single-threaded child of fork; only async-signal-safe calls follow.
        unsafe { supervise(program, status_fd) }
    }

    unsafe {
        libc::close(status_fd);
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0);
        if libc::getppid() != supervisor {
            libc::_exit(1);
        }
    }
    Ok(())
}

/// Reaps `program`, reports its wait status through `status_fd`, then keeps
/// reaping orphans re-parented here until none are left.
unsafe fn supervise(program: libc::pid_t, status_fd: RawFd) -> ! {
    libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
    libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    close_fds_except(status_fd);

    let mut status: libc::c_int = 0;
    loop {
        let reaped = libc::waitpid(program, &mut status, 0);
        if reaped == program {
            break;
        }
        if reaped < 0 && !interrupted() {
            libc::_exit(1);
        }
    }

    let bytes = status.to_ne_bytes();
    libc::write(status_fd, bytes.as_ptr().cast(), bytes.len());
    libc::close(status_fd);

    while libc::waitpid(-1, std::ptr::null_mut(), 0) > 0 || interrupted() {}
    libc::_exit(0)
}

fn interrupted() -> bool {
    io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
}

/// Drops every inherited descriptor (pipes, std's exec-error pipe, sockets)
/// except the status pipe.
unsafe fn close_fds_except(keep: RawFd) {
    let keep = keep as libc::c_uint;
    if keep > 0 {
        close_range(0, keep - 1);
    }
    close_range(keep + 1, libc::c_uint::MAX);
}

unsafe fn close_range(first: libc::c_uint, last: libc::c_uint) {
    if libc::syscall(libc::SYS_close_range, first, last, 0 as libc::c_uint) != 0 {
        for fd in first..=last.min(FALLBACK_MAX_FD) {
            libc::close(fd as libc::c_int);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_budget_exceeds_wall_clock() {
        assert_eq!(cpu_seconds_for(Duration::from_millis(5000)), 7);
        assert_eq!(cpu_seconds_for(Duration::from_millis(500)), 2);
    }

    #[test]
    fn test_guard_without_pid_is_inert() {
        let guard = ProcessTreeGuard::new(None);
        assert!(guard.supervisor.is_none());
        drop(guard);
        assert!(ProcessTreeGuard::new(Some(0)).supervisor.is_none());
    }

    #[test]
    fn test_parse_ppid_survives_odd_command_names() {
        assert_eq!(parse_ppid("4242 (sh) S 17 4242 4242 0 -1"), Some(17));
        assert_eq!(parse_ppid("4243 (a) b (c)) R 99 4243 4243 0 -1"), Some(99));
        assert_eq!(parse_ppid("garbage"), None);
    }

    #[test]
    fn test_descendants_of_current_process_include_spawned_child() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let me = libc::pid_t::try_from(std::process::id()).unwrap();
        let child_pid = libc::pid_t::try_from(child.id()).unwrap();

        assert!(descendants(me).contains(&child_pid));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_status_pipe_round_trips_wait_status() {
        let (read, write) = status_pipe().unwrap();
        let raw: i32 = 3 << 8;
        let written = unsafe { libc::write(write.as_raw_fd(), raw.to_ne_bytes().as_ptr().cast(), 4) };
        assert_eq!(written, 4);
        drop(write);

        let status = read_exit_status(read).unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn test_status_pipe_closed_early_reports_nothing() {
        let (read, write) = status_pipe().unwrap();
        drop(write);
        assert!(read_exit_status(read).is_none());
    }
}
