//! Shared test doubles for manager and pipeline tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anvil_sandbox::{
    CapabilityGap, DriverSet, ExecutionOutcome, ExitStatus, IsolationLevel, SandboxDriver,
    SecurityPolicy,
};
use async_trait::async_trait;

/// Driver that returns a canned outcome and counts invocations.
pub struct MockDriver {
    name: &'static str,
    isolation: IsolationLevel,
    available: bool,
    status: ExitStatus,
    output: &'static str,
    pub probes: AtomicUsize,
    pub executions: AtomicUsize,
}

impl MockDriver {
    pub fn new(name: &'static str, isolation: IsolationLevel) -> Self {
        Self {
            name,
            isolation,
            available: true,
            status: ExitStatus::Success,
            output: "",
            probes: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
        }
    }

    pub fn container() -> Self {
        Self::new("container", IsolationLevel::Container)
    }

    pub fn remote() -> Self {
        Self::new("remote", IsolationLevel::RemoteVm)
    }

    pub fn local() -> Self {
        Self::new("local", IsolationLevel::Process)
    }

    pub fn available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn returning(mut self, status: ExitStatus, output: &'static str) -> Self {
        self.status = status;
        self.output = output;
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl SandboxDriver for MockDriver {
    fn name(&self) -> &str {
        self.name
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn is_available(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.available
    }

    fn check_policy(&self, _policy: &SecurityPolicy) -> Result<(), CapabilityGap> {
        Ok(())
    }

    async fn execute(&self, _code: &str, _policy: &SecurityPolicy) -> ExecutionOutcome {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let duration = Duration::from_millis(3);
        let output = self.output.to_string();
        match self.status {
            ExitStatus::Success => ExecutionOutcome::success(output, duration),
            ExitStatus::RuntimeError => {
                ExecutionOutcome::runtime_error(output, format!("{} runtime error", self.name), duration)
            }
            ExitStatus::TimedOut => {
                ExecutionOutcome::timed_out(output, Duration::from_millis(2), duration)
            }
            ExitStatus::InfrastructureError => {
                ExecutionOutcome::infrastructure(format!("{} backend unreachable", self.name), duration)
            }
        }
    }
}

pub fn driver_set(
    container: Option<Arc<MockDriver>>,
    remote: Option<Arc<MockDriver>>,
    local: Arc<MockDriver>,
) -> DriverSet {
    DriverSet {
        container: container.map(|d| d as Arc<dyn SandboxDriver>),
        remote: remote.map(|d| d as Arc<dyn SandboxDriver>),
        local,
    }
}
