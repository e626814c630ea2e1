//! Container driver: one fresh, single-use container per call.
//!
//! Talks to the runtime through its CLI (`docker` or a compatible binary).
//! Lifecycle is `create` → `start --attach --interactive` (code on stdin) →
//! `rm -f`. The container never outlives the call: teardown runs on every
//! path, and [`ContainerHandle`] removes it on drop if the async teardown was
//! skipped by cancellation.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ContainerConfig;
use crate::outcome::ExecutionOutcome;
use crate::policy::SecurityPolicy;

use super::process::{probe, run_with_deadline};
use super::{CapabilityGap, IsolationLevel, SandboxDriver, CONTAINER_DRIVER};

/// Budget for `create` and `rm`.
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Runtime-reserved exit codes: daemon error, command not executable, not found.
/// The program inside can exit with these too, so they are only a hint.
const RUNTIME_EXIT_CODES: std::ops::RangeInclusive<i32> = 125..=127;
/// `.State.StartedAt` of a container that never ran.
const NEVER_STARTED: &str = "0001-01-01T00:00:00Z";
const STATE_FORMAT: &str = "{{.State.StartedAt}}|{{.State.Error}}";

/// Ephemeral-container driver.
#[derive(Debug, Clone)]
pub struct ContainerDriver {
    config: ContainerConfig,
}

impl ContainerDriver {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Arguments for `<runtime> create`, derived from the policy.
    pub fn create_args(&self, name: &str, policy: &SecurityPolicy) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name.into(),
            "--interactive".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--user".into(),
            "65534:65534".into(),
            "--pids-limit".into(),
            self.config.pids_limit.to_string(),
            "--workdir".into(),
            "/tmp".into(),
        ];

        if policy.allow_network() {
            // Values are read from the runtime CLI's own environment, so they
            // never appear in argv.
            for var in policy.passthrough_env() {
                args.push("--env".into());
                args.push(var.clone());
            }
        } else {
            args.push("--network".into());
            args.push("none".into());
        }

        if !policy.allow_filesystem_write() {
            args.push("--read-only".into());
            args.push("--tmpfs".into());
            args.push("/tmp:rw,noexec,nosuid,size=64m".into());
        }

        if let Some(bytes) = policy.memory_limit_bytes() {
            args.push("--memory".into());
            args.push(format!("{bytes}b"));
            args.push("--memory-swap".into());
            args.push(format!("{bytes}b"));
        }
        if let Some(cpus) = policy.cpu_limit() {
            args.push("--cpus".into());
            args.push(format!("{cpus}"));
        }

        args.push(self.config.image.clone());
        args.extend(["python3", "-I", "-B", "-u", "-"].map(String::from));
        args
    }

    async fn create(&self, policy: &SecurityPolicy) -> Result<ContainerHandle, String> {
        let name = format!("anvil-{}", Uuid::new_v4().simple());
        let args = self.create_args(&name, policy);
        let output = runtime_output(&self.config.runtime, &args).await?;
        if !output.status.success() {
            return Err(format!(
                "{} create failed: {}",
                self.config.runtime,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        debug!(driver = CONTAINER_DRIVER, container = %name, "container created");
        Ok(ContainerHandle {
            runtime: self.config.runtime.clone(),
            name,
            removed: false,
        })
    }
}

impl Default for ContainerDriver {
    fn default() -> Self {
        Self::new(ContainerConfig::default())
    }
}

/// Owns one created container until it is removed.
#[derive(Debug)]
struct ContainerHandle {
    runtime: String,
    name: String,
    removed: bool,
}

impl ContainerHandle {
    /// `StartedAt|Error` from `inspect`, or `None` when inspect failed.
    async fn state(&self) -> Option<String> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            STATE_FORMAT.to_string(),
            self.name.clone(),
        ];
        let output = runtime_output(&self.runtime, &args).await.ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn destroy(mut self) {
        let args = ["rm".to_string(), "-f".to_string(), self.name.clone()];
        match runtime_output(&self.runtime, &args).await {
            Ok(output) if output.status.success() => {
                self.removed = true;
                debug!(driver = CONTAINER_DRIVER, container = %self.name, "container removed");
            }
            Ok(output) => warn!(
                driver = CONTAINER_DRIVER,
                container = %self.name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "container removal failed"
            ),
            Err(err) => warn!(
                driver = CONTAINER_DRIVER,
                container = %self.name,
                error = %err,
                "container removal failed"
            ),
        }
        // On failure, Drop gets one more attempt.
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let runtime = self.runtime.clone();
        let name = std::mem::take(&mut self.name);
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                let status = Command::new(&runtime)
                    .args(["rm", "-f", name.as_str()])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                if let Err(err) = status {
                    warn!(container = %name, error = %err, "container cleanup on drop failed");
                }
            });
            return;
        }
        // No runtime to hand the removal to; block instead.
        let status = std::process::Command::new(&runtime)
            .args(["rm", "-f", name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(err) = status {
            warn!(container = %name, error = %err, "container cleanup on drop failed");
        }
    }
}

async fn runtime_output(runtime: &str, args: &[String]) -> Result<std::process::Output, String> {
    let mut command = Command::new(runtime);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match tokio::time::timeout(LIFECYCLE_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(format!("failed to run {runtime}: {err}")),
        Err(_) => Err(format!(
            "{runtime} {} did not finish within {}s",
            args.first().map(String::as_str).unwrap_or_default(),
            LIFECYCLE_TIMEOUT.as_secs()
        )),
    }
}

fn is_runtime_exit_code(code: Option<i32>) -> bool {
    code.is_some_and(|c| RUNTIME_EXIT_CODES.contains(&c))
}

/// Whether the runtime, not the program, failed: inspect itself failed, the
/// runtime recorded an error, or the container never started.
fn start_failed(state: Option<&str>) -> bool {
    let Some(state) = state else {
        return true;
    };
    let (started_at, error) = state.split_once('|').unwrap_or((state, ""));
    let started_at = started_at.trim();
    !error.trim().is_empty() || started_at.is_empty() || started_at == NEVER_STARTED
}

#[async_trait]
impl SandboxDriver for ContainerDriver {
    fn name(&self) -> &str {
        CONTAINER_DRIVER
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Container
    }

    async fn is_available(&self) -> bool {
        probe(
            &self.config.runtime,
            &["info"],
            Duration::from_millis(self.config.probe_timeout_ms),
        )
        .await
    }

    /// Every policy knob maps onto a `create` flag.
    fn check_policy(&self, _policy: &SecurityPolicy) -> Result<(), CapabilityGap> {
        Ok(())
    }

    async fn execute(&self, code: &str, policy: &SecurityPolicy) -> ExecutionOutcome {
        if let Err(gap) = self.check_policy(policy) {
            return ExecutionOutcome::infrastructure(gap.to_string(), Duration::ZERO);
        }

        let handle = match self.create(policy).await {
            Ok(handle) => handle,
            Err(message) => return ExecutionOutcome::infrastructure(message, Duration::ZERO),
        };

        let mut command = Command::new(&self.config.runtime);
        command.args(["start", "--attach", "--interactive", handle.name.as_str()]);
        let run = run_with_deadline(
            command,
            Some(code.as_bytes()),
            policy.timeout(),
            policy.max_output_bytes(),
        )
        .await;

        let runtime_failed = match &run {
            Ok(run) if !run.timed_out && is_runtime_exit_code(run.exit_code()) => {
                start_failed(handle.state().await.as_deref())
            }
            _ => false,
        };

        // Stops the container too when the attached client was killed on timeout.
        handle.destroy().await;

        match run {
            Ok(run) if runtime_failed => {
                ExecutionOutcome::infrastructure(
                    format!(
                        "{} start failed (exit {}): {}",
                        self.config.runtime,
                        run.exit_code().unwrap_or_default(),
                        run.stderr.trim()
                    ),
                    run.duration,
                )
            }
            Ok(run) => run.into_outcome(policy.timeout()),
            Err(err) => ExecutionOutcome::infrastructure(
                format!("failed to run {}: {err}", self.config.runtime),
                Duration::ZERO,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::ExitStatus;

    fn driver() -> ContainerDriver {
        ContainerDriver::new(ContainerConfig {
            runtime: "docker".into(),
            image: "python:3.12-slim".into(),
            pids_limit: 64,
            probe_timeout_ms: 500,
        })
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_create_args_lock_down_by_default() {
        let policy = SecurityPolicy::default();
        let args = driver().create_args("anvil-test", &policy);

        assert!(has_pair(&args, "--network", "none"));
        assert!(has_pair(&args, "--cap-drop", "ALL"));
        assert!(has_pair(&args, "--pids-limit", "64"));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(!args.iter().any(|a| a == "-v" || a == "--volume" || a == "--mount"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_create_args_apply_resource_limits() {
        let policy = SecurityPolicy::builder()
            .memory_limit_bytes(128 * 1024 * 1024)
            .cpu_limit(0.5)
            .build()
            .unwrap();
        let args = driver().create_args("anvil-test", &policy);

        assert!(has_pair(&args, "--memory", "134217728b"));
        assert!(has_pair(&args, "--memory-swap", "134217728b"));
        assert!(has_pair(&args, "--cpus", "0.5"));
    }

    #[test]
    fn test_create_args_with_network_and_writes() {
        let policy = SecurityPolicy::builder()
            .allow_network(true)
            .allow_filesystem_write(true)
            .passthrough_env("OPENAI_API_KEY")
            .build()
            .unwrap();
        let args = driver().create_args("anvil-test", &policy);

        assert!(!args.contains(&"none".to_string()));
        assert!(!args.contains(&"--read-only".to_string()));
        assert!(has_pair(&args, "--env", "OPENAI_API_KEY"));
    }

    #[test]
    fn test_passthrough_env_dropped_without_network() {
        let policy = SecurityPolicy::builder()
            .passthrough_env("OPENAI_API_KEY")
            .build()
            .unwrap();
        let args = driver().create_args("anvil-test", &policy);
        assert!(!args.contains(&"OPENAI_API_KEY".to_string()));
    }

    #[test]
    fn test_runtime_exit_codes() {
        assert!(is_runtime_exit_code(Some(125)));
        assert!(is_runtime_exit_code(Some(127)));
        assert!(!is_runtime_exit_code(Some(1)));
        assert!(!is_runtime_exit_code(None));
    }

    #[test]
    fn test_start_failed_reads_container_state() {
        assert!(start_failed(None));
        assert!(start_failed(Some("0001-01-01T00:00:00Z|")));
        assert!(start_failed(Some(
            "2026-01-02T03:04:05.6Z|OCI runtime exec failed: python3: not found"
        )));
        assert!(!start_failed(Some("2026-01-02T03:04:05.6Z|")));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_unavailable() {
        let driver = ContainerDriver::new(ContainerConfig {
            runtime: "anvil-no-such-runtime".into(),
            ..ContainerConfig::default()
        });
        assert!(!driver.is_available().await);
    }

    #[tokio::test]
    async fn test_missing_runtime_is_infrastructure_error() {
        let driver = ContainerDriver::new(ContainerConfig {
            runtime: "anvil-no-such-runtime".into(),
            ..ContainerConfig::default()
        });
        let outcome = driver
            .execute("print('x')", &SecurityPolicy::default())
            .await;
        assert_eq!(outcome.exit_status, ExitStatus::InfrastructureError);
    }

    /// A shell script standing in for the runtime CLI. Every invocation's
    /// argv is appended to `calls.log`; `start` runs `start_body` after
    /// consuming stdin, and `inspect` prints `state`.
    #[cfg(unix)]
    struct FakeRuntime {
        dir: tempfile::TempDir,
    }

    #[cfg(unix)]
    impl FakeRuntime {
        fn new(start_body: &str, state: &str) -> Self {
            use std::os::unix::fs::PermissionsExt;

            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("calls.log");
            let script = format!(
                "#!/bin/sh\n\
                 echo \"$*\" >> '{log}'\n\
                 case \"$1\" in\n\
                 start) cat > /dev/null; {start_body} ;;\n\
                 inspect) echo '{state}' ;;\n\
                 esac\n\
                 exit 0\n",
                log = log.display(),
            );
            let path = dir.path().join("fake-runtime");
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            Self { dir }
        }

        fn driver(&self) -> ContainerDriver {
            ContainerDriver::new(ContainerConfig {
                runtime: self.dir.path().join("fake-runtime").display().to_string(),
                ..ContainerConfig::default()
            })
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.dir.path().join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn removed(&self) -> bool {
            self.calls().iter().any(|c| c.starts_with("rm -f anvil-"))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_container_removed_after_success() {
        let runtime = FakeRuntime::new("echo ok; exit 0", "2026-01-02T03:04:05Z|");
        let outcome = runtime
            .driver()
            .execute("print('ok')", &SecurityPolicy::default())
            .await;

        assert_eq!(outcome.exit_status, ExitStatus::Success);
        assert_eq!(outcome.stdout_tail, "ok\n");
        assert!(runtime.removed(), "{:?}", runtime.calls());
        assert!(!runtime.calls().iter().any(|c| c.starts_with("inspect")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_container_removed_after_timeout() {
        let runtime = FakeRuntime::new("sleep 30", "2026-01-02T03:04:05Z|");
        let policy = SecurityPolicy::builder()
            .timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let outcome = runtime.driver().execute("while True: pass", &policy).await;

        assert_eq!(outcome.exit_status, ExitStatus::TimedOut);
        assert!(runtime.removed(), "{:?}", runtime.calls());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_start_is_infrastructure_and_removed() {
        let runtime = FakeRuntime::new(
            "echo 'exec: \"python3\": executable file not found' >&2; exit 127",
            "0001-01-01T00:00:00Z|exec: python3: executable file not found",
        );
        let outcome = runtime
            .driver()
            .execute("print('ok')", &SecurityPolicy::default())
            .await;

        assert_eq!(outcome.exit_status, ExitStatus::InfrastructureError);
        assert!(outcome.error_message.unwrap().contains("start failed (exit 127)"));
        let calls = runtime.calls();
        let inspected = calls.iter().position(|c| c.starts_with("inspect")).unwrap();
        let removed = calls.iter().position(|c| c.starts_with("rm -f anvil-")).unwrap();
        assert!(inspected < removed, "{calls:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_handle_removes_without_blocking() {
        let runtime = FakeRuntime::new("exit 0", "");
        let handle = ContainerHandle {
            runtime: runtime.driver().config().runtime.clone(),
            name: "anvil-dropped".into(),
            removed: false,
        };
        drop(handle);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !runtime.removed() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(runtime.calls(), vec!["rm -f anvil-dropped".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_dropped_handle_outside_runtime_removes_inline() {
        let runtime = FakeRuntime::new("exit 0", "");
        drop(ContainerHandle {
            runtime: runtime.driver().config().runtime.clone(),
            name: "anvil-inline".into(),
            removed: false,
        });
        assert_eq!(runtime.calls(), vec!["rm -f anvil-inline".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_exit_125_is_runtime_error() {
        let runtime = FakeRuntime::new("exit 125", "2026-01-02T03:04:05Z|");
        let outcome = runtime
            .driver()
            .execute("import sys; sys.exit(125)", &SecurityPolicy::default())
            .await;

        assert_eq!(outcome.exit_status, ExitStatus::RuntimeError);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("process exited with status 125")
        );
        assert!(runtime.removed(), "{:?}", runtime.calls());
    }
}
