//! Remote driver: an ephemeral cloud sandbox session per call.
//!
//! Speaks a Daytona-style HTTP API: create a sandbox, wait for it to start,
//! run one shell command through the toolbox process endpoint, then delete
//! the sandbox. The session is deleted on every path; [`RemoteSession`]
//! schedules a delete on drop if the call was cancelled mid-flight.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RemoteConfig;
use crate::error::SandboxResult;
use crate::outcome::{tail_of, ExecutionOutcome};
use crate::policy::SecurityPolicy;

use super::{CapabilityGap, IsolationLevel, SandboxDriver, REMOTE_DRIVER};

/// Exit code of coreutils `timeout` when the deadline fired.
const TIMEOUT_EXIT_CODE: i64 = 124;
/// 128 + SIGKILL: `timeout` escalated because TERM was ignored.
const KILLED_EXIT_CODE: i64 = 137;
/// Where the staged program lives inside the remote sandbox.
const REMOTE_SCRIPT_PATH: &str = "/tmp/main.py";
/// Extra time allowed on top of the policy timeout for the execute round-trip.
const EXECUTE_GRACE: Duration = Duration::from_secs(10);
const START_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize)]
struct CreateSandboxRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    labels: Labels,
    /// Cut all outbound traffic from the sandbox.
    #[serde(rename = "networkBlockAll")]
    network_block_all: bool,
}

#[derive(Debug, Serialize)]
struct Labels {
    #[serde(rename = "anvil.ephemeral")]
    ephemeral: &'static str,
}

#[derive(Debug, Deserialize)]
struct SandboxInfo {
    id: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest {
    command: String,
    timeout: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    exit_code: i64,
    #[serde(default)]
    result: String,
}

/// Remote cloud sandbox driver.
#[derive(Debug, Clone)]
pub struct RemoteDriver {
    config: RemoteConfig,
    http: reqwest::Client,
}

impl RemoteDriver {
    /// Build a driver; rejects an unusable configuration up front.
    pub fn new(config: RemoteConfig) -> SandboxResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("anvil-sandbox/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url, path.trim_start_matches('/'))
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    async fn create_session(&self, policy: &SecurityPolicy) -> Result<RemoteSession, String> {
        let body = CreateSandboxRequest {
            target: self.config.target.as_deref(),
            labels: Labels { ephemeral: "true" },
            network_block_all: !policy.allow_network(),
        };
        let response = self
            .http
            .post(self.url("sandbox"))
            .bearer_auth(&self.config.api_key)
            .timeout(self.request_timeout())
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("sandbox create request failed: {e}"))?;
        let info: SandboxInfo = decode(response, "sandbox create").await?;
        debug!(driver = REMOTE_DRIVER, sandbox = %info.id, "sandbox created");

        let session = RemoteSession {
            driver: self.clone(),
            id: info.id,
            deleted: false,
        };
        if info.state.as_deref() != Some("started") {
            self.wait_started(&session.id).await?;
        }
        Ok(session)
    }

    async fn wait_started(&self, id: &str) -> Result<(), String> {
        let deadline = Instant::now() + self.request_timeout();
        loop {
            let response = self
                .http
                .get(self.url(&format!("sandbox/{id}")))
                .bearer_auth(&self.config.api_key)
                .timeout(self.request_timeout())
                .send()
                .await
                .map_err(|e| format!("sandbox status request failed: {e}"))?;
            let info: SandboxInfo = decode(response, "sandbox status").await?;
            match info.state.as_deref() {
                Some("started") => return Ok(()),
                Some(state @ ("error" | "build_failed" | "destroyed")) => {
                    return Err(format!("sandbox {id} entered state {state}"))
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(format!(
                    "sandbox {id} not started within {}ms",
                    self.config.request_timeout_ms
                ));
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
    }

    async fn run(&self, id: &str, code: &str, policy: &SecurityPolicy) -> ExecutionOutcome {
        let limit = policy.timeout();
        let body = ExecuteRequest {
            command: remote_command(code, limit),
            timeout: limit.as_millis().div_ceil(1000) as u64 + EXECUTE_GRACE.as_secs(),
        };
        let request = self
            .http
            .post(self.url(&format!("toolbox/{id}/toolbox/process/execute")))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send();

        let started = Instant::now();
        let response = match tokio::time::timeout(limit + EXECUTE_GRACE, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return ExecutionOutcome::infrastructure(
                    format!("execute request failed: {err}"),
                    started.elapsed(),
                )
            }
            Err(_elapsed) => {
                return ExecutionOutcome::timed_out(String::new(), limit, started.elapsed())
            }
        };
        let executed: ExecuteResponse = match decode(response, "execute").await {
            Ok(body) => body,
            Err(message) => return ExecutionOutcome::infrastructure(message, started.elapsed()),
        };
        let duration = started.elapsed();

        let output = tail_of(&executed.result, policy.max_output_bytes());
        match executed.exit_code {
            0 => ExecutionOutcome::success(output, duration),
            TIMEOUT_EXIT_CODE => ExecutionOutcome::timed_out(output, limit, duration),
            KILLED_EXIT_CODE if duration >= limit => {
                ExecutionOutcome::timed_out(output, limit, duration)
            }
            code => {
                let message = last_line(&executed.result)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("process exited with status {code}"));
                ExecutionOutcome::runtime_error(output, message, duration)
            }
        }
    }

    async fn delete_session(&self, id: &str) -> Result<(), String> {
        let response = self
            .http
            .delete(self.url(&format!("sandbox/{id}?force=true")))
            .bearer_auth(&self.config.api_key)
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(|e| format!("sandbox delete request failed: {e}"))?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(format!("sandbox delete returned HTTP {status}"))
        }
    }
}

/// One provisioned remote sandbox; deleted exactly once.
struct RemoteSession {
    driver: RemoteDriver,
    id: String,
    deleted: bool,
}

impl RemoteSession {
    async fn close(mut self) {
        match self.driver.delete_session(&self.id).await {
            Ok(()) => {
                self.deleted = true;
                debug!(driver = REMOTE_DRIVER, sandbox = %self.id, "sandbox deleted");
            }
            Err(err) => warn!(driver = REMOTE_DRIVER, sandbox = %self.id, error = %err, "sandbox delete failed"),
        }
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if self.deleted {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(sandbox = %self.id, "no runtime available to delete sandbox");
            return;
        };
        let driver = self.driver.clone();
        let id = std::mem::take(&mut self.id);
        runtime.spawn(async move {
            if let Err(err) = driver.delete_session(&id).await {
                warn!(driver = REMOTE_DRIVER, sandbox = %id, error = %err, "sandbox cleanup on drop failed");
            }
        });
    }
}

/// Shell command that stages `code` and runs it under a hard deadline.
///
/// `timeout` sends TERM first so an expired run exits 124; KILL follows a
/// second later for programs that ignore TERM.
fn remote_command(code: &str, limit: Duration) -> String {
    staged_command(code, limit, REMOTE_SCRIPT_PATH)
}

fn staged_command(code: &str, limit: Duration, script: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(code.as_bytes());
    format!(
        "timeout -k 1s {} sh -c 'echo {encoded} | base64 -d > {script} && exec python3 -I {script}'",
        deadline_arg(limit)
    )
}

/// Millisecond-precision duration argument for `timeout`, never zero.
fn deadline_arg(limit: Duration) -> String {
    let millis = limit.as_millis().max(1);
    format!("{}.{:03}s", millis / 1000, millis % 1000)
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|line| !line.is_empty())
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T, String> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!(
            "{what} returned HTTP {status}: {}",
            tail_of(body.trim(), 512)
        ));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| format!("{what} returned an undecodable body: {e}"))
}

#[async_trait]
impl SandboxDriver for RemoteDriver {
    fn name(&self) -> &str {
        REMOTE_DRIVER
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::RemoteVm
    }

    /// Credentials are configured; no network round-trip.
    async fn is_available(&self) -> bool {
        self.config.validate().is_ok()
    }

    fn check_policy(&self, policy: &SecurityPolicy) -> Result<(), CapabilityGap> {
        if policy.memory_limit_bytes().is_some() {
            return Err(CapabilityGap::new(REMOTE_DRIVER, "memory_limit_bytes"));
        }
        if policy.cpu_limit().is_some() {
            return Err(CapabilityGap::new(REMOTE_DRIVER, "cpu_limit"));
        }
        Ok(())
    }

    async fn execute(&self, code: &str, policy: &SecurityPolicy) -> ExecutionOutcome {
        if let Err(gap) = self.check_policy(policy) {
            return ExecutionOutcome::infrastructure(gap.to_string(), Duration::ZERO);
        }
        let session = match self.create_session(policy).await {
            Ok(session) => session,
            Err(message) => return ExecutionOutcome::infrastructure(message, Duration::ZERO),
        };
        let outcome = self.run(&session.id, code, policy).await;
        session.close().await;
        outcome
    }
}
