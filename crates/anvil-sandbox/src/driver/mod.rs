//! Sandbox drivers: one isolation backend each.
//!
//! The manager only ever talks to [`SandboxDriver`] trait objects. Every
//! driver turns its own failures into an [`ExecutionOutcome`] instead of an
//! error, so a misbehaving backend can never abort a verification.
//!
//! # Modules
//!
//! - [`local`]: restricted host subprocess (reduced guarantee)
//! - [`container`]: fresh single-use container per call
//! - [`remote`]: ephemeral remote sandbox session over HTTP
//! - `process`: shared child-process runner (deadline, group kill, tail capture)

pub mod container;
pub mod local;
mod process;
pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::outcome::ExecutionOutcome;
use crate::policy::SecurityPolicy;

pub use container::ContainerDriver;
pub use local::LocalDriver;
pub use remote::RemoteDriver;

/// Driver names as reported in `active_driver`.
pub const LOCAL_DRIVER: &str = "local";
pub const CONTAINER_DRIVER: &str = "container";
pub const REMOTE_DRIVER: &str = "remote";

/// Strength of the isolation boundary a driver provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Host subprocess; weakest guarantee.
    Process,
    Container,
    RemoteVm,
}

/// A policy requirement the driver cannot enforce.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("capability gap: {driver} driver cannot enforce {requirement}")]
pub struct CapabilityGap {
    pub driver: String,
    pub requirement: String,
}

impl CapabilityGap {
    pub fn new(driver: &str, requirement: impl Into<String>) -> Self {
        Self {
            driver: driver.to_string(),
            requirement: requirement.into(),
        }
    }
}

/// Common contract for isolation backends.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Stable name, e.g. `"local"`.
    fn name(&self) -> &str;

    fn isolation(&self) -> IsolationLevel;

    /// Cheap, side-effect-free probe. Returns `false` on absence, never panics.
    async fn is_available(&self) -> bool;

    /// Refuse policies this driver cannot enforce.
    fn check_policy(&self, policy: &SecurityPolicy) -> Result<(), CapabilityGap>;

    /// Run `code` until it finishes or `policy.timeout()` elapses.
    ///
    /// Isolation resources acquired here are released before returning, on
    /// every path.
    async fn execute(&self, code: &str, policy: &SecurityPolicy) -> ExecutionOutcome;
}
