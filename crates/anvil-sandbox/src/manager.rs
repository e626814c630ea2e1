//! Sandbox manager: driver selection and the verify pipeline.
//!
//! The driver is chosen once, at construction, and never changes:
//!
//! 1. the container driver, when preferred and available;
//! 2. otherwise the remote driver, when configured and available;
//! 3. otherwise the local driver.
//!
//! `verify` runs static analysis first and only executes clean code. An
//! infrastructure failure from a non-local driver is retried once on the
//! local driver, when that one is available.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::analyzer::analyze;
use crate::config::EngineConfig;
use crate::driver::{
    ContainerDriver, IsolationLevel, LocalDriver, RemoteDriver, SandboxDriver,
};
use crate::error::{SandboxError, SandboxResult};
use crate::metrics::METRICS;
use crate::obs::{self, VerifySpan};
use crate::outcome::{ExecutionOutcome, ExitStatus};
use crate::policy::SecurityPolicy;
use crate::result::VerificationResult;

/// The drivers a manager may choose from.
#[derive(Clone)]
pub struct DriverSet {
    pub container: Option<Arc<dyn SandboxDriver>>,
    pub remote: Option<Arc<dyn SandboxDriver>>,
    pub local: Arc<dyn SandboxDriver>,
}

impl DriverSet {
    /// Only the local driver.
    pub fn local_only(local: Arc<dyn SandboxDriver>) -> Self {
        Self {
            container: None,
            remote: None,
            local,
        }
    }

    /// Build the real drivers. The remote driver is present only when the
    /// configuration carries credentials.
    pub fn from_config(config: &EngineConfig) -> SandboxResult<Self> {
        let remote = match &config.remote {
            Some(remote) => Some(Arc::new(RemoteDriver::new(remote.clone())?) as Arc<dyn SandboxDriver>),
            None => None,
        };
        Ok(Self {
            container: Some(Arc::new(ContainerDriver::new(config.container.clone()))),
            remote,
            local: Arc::new(LocalDriver::new(config.local.clone())),
        })
    }
}

/// What `get_status` reports about the cached selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub active_driver: String,
    pub isolation: IsolationLevel,
    /// Whether an infrastructure failure can be retried locally.
    pub fallback_available: bool,
}

/// Orchestrates static analysis and sandboxed execution.
///
/// Holds no mutable state after construction; share it freely (e.g. behind
/// an `Arc`) across concurrent `verify` calls.
pub struct SandboxManager {
    policy: SecurityPolicy,
    active: Arc<dyn SandboxDriver>,
    fallback: Option<Arc<dyn SandboxDriver>>,
}

impl SandboxManager {
    /// Build the real drivers from the environment and select one.
    pub async fn new(policy: SecurityPolicy, prefer_primary_driver: bool) -> SandboxResult<Self> {
        Self::from_config(&EngineConfig::from_env(), policy, prefer_primary_driver).await
    }

    pub async fn from_config(
        config: &EngineConfig,
        policy: SecurityPolicy,
        prefer_primary_driver: bool,
    ) -> SandboxResult<Self> {
        policy.validate()?;
        let drivers = DriverSet::from_config(config)?;
        Self::with_drivers(policy, prefer_primary_driver, drivers).await
    }

    /// Select among caller-supplied drivers.
    pub async fn with_drivers(
        policy: SecurityPolicy,
        prefer_primary_driver: bool,
        drivers: DriverSet,
    ) -> SandboxResult<Self> {
        policy.validate()?;

        let mut active = None;
        if prefer_primary_driver {
            if let Some(container) = drivers.container.as_ref() {
                if container.is_available().await {
                    active = Some(container.clone());
                }
            }
        }
        if active.is_none() {
            if let Some(remote) = drivers.remote.as_ref() {
                if remote.is_available().await {
                    active = Some(remote.clone());
                }
            }
        }

        let (active, fallback) = match active {
            Some(primary) => {
                let fallback = drivers
                    .local
                    .is_available()
                    .await
                    .then(|| drivers.local.clone());
                (primary, fallback)
            }
            None => (drivers.local.clone(), None),
        };

        if let Err(gap) = active.check_policy(&policy) {
            warn!(driver = %active.name(), error = %gap, "selected driver cannot enforce policy; runs will fail");
        }
        obs::emit_driver_selected(active.name(), prefer_primary_driver, fallback.is_some());

        Ok(Self {
            policy,
            active,
            fallback,
        })
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn get_status(&self) -> SandboxStatus {
        SandboxStatus {
            active_driver: self.active.name().to_string(),
            isolation: self.active.isolation(),
            fallback_available: self.fallback.is_some(),
        }
    }

    /// Verify `code` against the manager's policy.
    ///
    /// Never fails: every problem is reported in the returned verdict.
    pub async fn verify(&self, code: &str) -> VerificationResult {
        METRICS.inc_verifications();
        let digest = obs::code_digest(code);
        let span = VerifySpan::new(&digest, self.active.name());
        span.instrument(self.run_pipeline(code, &digest)).await
    }

    /// Synchronous wrapper around [`verify`](Self::verify).
    ///
    /// Builds a private current-thread runtime, so it must not be called from
    /// inside an async context.
    pub fn verify_blocking(&self, code: &str) -> SandboxResult<VerificationResult> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(SandboxError::Runtime(
                "verify_blocking called from within an async runtime; use verify().await".into(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SandboxError::Runtime(e.to_string()))?;
        Ok(runtime.block_on(self.verify(code)))
    }

    async fn run_pipeline(&self, code: &str, digest: &str) -> VerificationResult {
        obs::emit_verify_started(digest, code.len());

        let analysis_started = Instant::now();
        let violations = analyze(code, &self.policy);
        if !violations.is_empty() {
            METRICS.inc_static_rejections();
            obs::emit_static_rejected(digest, &violations);
            return VerificationResult::rejected(
                violations,
                analysis_started.elapsed(),
                self.active.name(),
            );
        }

        let outcome = self.execute_on(self.active.as_ref(), code).await;
        if outcome.exit_status != ExitStatus::InfrastructureError {
            return VerificationResult::executed(outcome, self.active.name(), None);
        }

        // At most one retry, and only from a non-local driver.
        let Some(local) = self.fallback.as_ref() else {
            return VerificationResult::executed(outcome, self.active.name(), None);
        };
        METRICS.inc_fallbacks();
        obs::emit_driver_fallback(
            self.active.name(),
            local.name(),
            outcome.error_message.as_deref().unwrap_or("infrastructure error"),
        );
        let retried = self.execute_on(local.as_ref(), code).await;
        VerificationResult::executed(retried, local.name(), Some(self.active.name().to_string()))
    }

    async fn execute_on(&self, driver: &dyn SandboxDriver, code: &str) -> ExecutionOutcome {
        METRICS.inc_executions();
        let outcome = driver.execute(code, &self.policy).await;
        if outcome.exit_status == ExitStatus::TimedOut {
            METRICS.inc_timeouts();
        }
        obs::emit_execution_finished(
            driver.name(),
            outcome.exit_status,
            outcome.duration.as_millis() as u64,
        );
        outcome
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("policy", &self.policy)
            .field("active_driver", &self.active.name())
            .field("fallback", &self.fallback.as_ref().map(|d| d.name().to_string()))
            .finish()
    }
}
