//! Anvil sandbox: verify generated tool code before it is trusted.
//!
//! A verification runs in two stages. The [`analyzer`] inspects the
//! candidate's syntax tree against a [`SecurityPolicy`] and rejects forbidden
//! constructs without executing anything. Clean code is then executed by
//! one [`SandboxDriver`] chosen by the [`SandboxManager`]: an ephemeral
//! container, a remote cloud sandbox, or, as a reduced-guarantee fallback,
//! a restricted local subprocess.
//!
//! ```no_run
//! use anvil_sandbox::{SandboxManager, SecurityPolicy};
//!
//! # async fn demo() -> anvil_sandbox::SandboxResult<()> {
//! let manager = SandboxManager::new(SecurityPolicy::default(), true).await?;
//! let result = manager.verify("print('ok')").await;
//! println!("{} via {}", result.success, result.active_driver);
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod config;
pub mod driver;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod obs;
pub mod outcome;
pub mod policy;
pub mod result;
pub mod telemetry;

pub use analyzer::{analyze, Rule, Violation};
pub use config::{ContainerConfig, EngineConfig, LocalConfig, RemoteConfig};
pub use driver::{
    CapabilityGap, ContainerDriver, IsolationLevel, LocalDriver, RemoteDriver, SandboxDriver,
    CONTAINER_DRIVER, LOCAL_DRIVER, REMOTE_DRIVER,
};
pub use error::{SandboxError, SandboxResult};
pub use manager::{DriverSet, SandboxManager, SandboxStatus};
pub use metrics::METRICS;
pub use outcome::{ExecutionOutcome, ExitStatus};
pub use policy::{PolicyBuilder, SecurityPolicy};
pub use result::VerificationResult;

/// Crate version, as reported by `anvil doctor`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
