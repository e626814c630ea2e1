//! Local driver: runs candidate code in a restricted host subprocess.
//!
//! This is the weakest isolation level and the last-resort fallback. It
//! provides a throwaway working directory, a scrubbed environment, a
//! no-network namespace when network access is denied, and a hard wall-clock
//! kill of the whole process group. It cannot cap memory or CPU; policies
//! asking for either are refused as a [`CapabilityGap`].

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::config::LocalConfig;
use crate::outcome::ExecutionOutcome;
use crate::policy::SecurityPolicy;

use super::process::{probe, run_with_deadline};
use super::{CapabilityGap, IsolationLevel, SandboxDriver, LOCAL_DRIVER};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Restricted-subprocess driver.
#[derive(Debug)]
pub struct LocalDriver {
    config: LocalConfig,
    /// Whether an unprivileged network namespace can be created; probed once.
    netns: OnceCell<bool>,
}

impl LocalDriver {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            netns: OnceCell::new(),
        }
    }

    /// Can this host give the child an empty network namespace?
    pub async fn network_isolation_supported(&self) -> bool {
        *self
            .netns
            .get_or_init(|| async {
                let supported = probe(
                    &self.config.unshare,
                    &["--net", "--map-root-user", "true"],
                    PROBE_TIMEOUT,
                )
                .await;
                if !supported {
                    warn!(
                        driver = LOCAL_DRIVER,
                        "network namespaces unavailable; network-denied runs will be refused"
                    );
                }
                supported
            })
            .await
    }

    fn command(&self, script: &Path, isolate_network: bool) -> Command {
        let mut command = if isolate_network {
            let mut c = Command::new(&self.config.unshare);
            c.args(["--net", "--map-root-user", "--"])
                .arg(&self.config.python);
            c
        } else {
            Command::new(&self.config.python)
        };
        // -I: ignore PYTHON* env and user site, -B: no .pyc, -u: unbuffered.
        command.args(["-I", "-B", "-u"]).arg(script);
        command
    }

    fn child_env(&self, workdir: &Path, policy: &SecurityPolicy) -> Vec<(String, String)> {
        let workdir = workdir.to_string_lossy().into_owned();
        let mut env = vec![
            ("PATH".to_string(), SAFE_PATH.to_string()),
            ("HOME".to_string(), workdir.clone()),
            ("TMPDIR".to_string(), workdir),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ];
        if policy.allow_network() {
            for name in policy.passthrough_env() {
                if let Ok(value) = std::env::var(name) {
                    env.push((name.clone(), value));
                }
            }
        }
        env
    }
}

impl Default for LocalDriver {
    fn default() -> Self {
        Self::new(LocalConfig::default())
    }
}

#[async_trait]
impl SandboxDriver for LocalDriver {
    fn name(&self) -> &str {
        LOCAL_DRIVER
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Process
    }

    async fn is_available(&self) -> bool {
        probe(&self.config.python, &["--version"], PROBE_TIMEOUT).await
    }

    fn check_policy(&self, policy: &SecurityPolicy) -> Result<(), CapabilityGap> {
        if policy.memory_limit_bytes().is_some() {
            return Err(CapabilityGap::new(LOCAL_DRIVER, "memory_limit_bytes"));
        }
        if policy.cpu_limit().is_some() {
            return Err(CapabilityGap::new(LOCAL_DRIVER, "cpu_limit"));
        }
        Ok(())
    }

    async fn execute(&self, code: &str, policy: &SecurityPolicy) -> ExecutionOutcome {
        let prep = Instant::now();
        if let Err(gap) = self.check_policy(policy) {
            return ExecutionOutcome::infrastructure(gap.to_string(), prep.elapsed());
        }

        let isolate_network = !policy.allow_network();
        if isolate_network && !self.network_isolation_supported().await {
            let gap = CapabilityGap::new(
                LOCAL_DRIVER,
                "allow_network=false (no network namespace available)",
            );
            return ExecutionOutcome::infrastructure(gap.to_string(), prep.elapsed());
        }

        // Removed on drop, including the timeout path.
        let workdir = match tempfile::Builder::new().prefix("anvil-local-").tempdir() {
            Ok(dir) => dir,
            Err(err) => {
                return ExecutionOutcome::infrastructure(
                    format!("failed to create scratch directory: {err}"),
                    prep.elapsed(),
                )
            }
        };
        let script = workdir.path().join("main.py");
        if let Err(err) = tokio::fs::write(&script, code).await {
            return ExecutionOutcome::infrastructure(
                format!("failed to stage candidate code: {err}"),
                prep.elapsed(),
            );
        }

        let mut command = self.command(&script, isolate_network);
        command
            .current_dir(workdir.path())
            .env_clear()
            .envs(self.child_env(workdir.path(), policy));

        debug!(
            driver = LOCAL_DRIVER,
            isolate_network,
            timeout_ms = policy.timeout().as_millis() as u64,
            "spawning candidate"
        );
        match run_with_deadline(command, None, policy.timeout(), policy.max_output_bytes()).await
        {
            Ok(run) => run.into_outcome(policy.timeout()),
            Err(err) => ExecutionOutcome::infrastructure(
                format!("failed to spawn {}: {err}", self.config.python),
                Duration::ZERO,
            ),
        }
    }
}
