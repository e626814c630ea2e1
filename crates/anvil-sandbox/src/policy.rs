//! Security policy: what a sandboxed run is permitted to do.
//!
//! A [`SecurityPolicy`] is an immutable value. It is validated once, at
//! construction, and then shared read-only across concurrent verifications.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};

/// Modules denied by default: process spawning, raw sockets, native code
/// loading and runtime code evaluation.
pub const DEFAULT_DENIED_MODULES: &[&str] = &[
    "subprocess",
    "multiprocessing",
    "pty",
    "socket",
    "ctypes",
    "importlib",
    "code",
    "codeop",
    "posix",
    "_posixsubprocess",
];

/// Default wall-clock budget for a single execution.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on captured output (the tail is kept).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Declarative permissions and limits for one verification run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicy", into = "RawPolicy")]
pub struct SecurityPolicy {
    allow_network: bool,
    allow_filesystem_write: bool,
    denied_modules: BTreeSet<String>,
    allowed_calls: BTreeSet<String>,
    passthrough_env: BTreeSet<String>,
    timeout: Duration,
    memory_limit_bytes: Option<u64>,
    cpu_limit: Option<f64>,
    max_output_bytes: usize,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allow_network: false,
            allow_filesystem_write: false,
            denied_modules: DEFAULT_DENIED_MODULES
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
            allowed_calls: BTreeSet::new(),
            passthrough_env: BTreeSet::new(),
            timeout: DEFAULT_TIMEOUT,
            memory_limit_bytes: None,
            cpu_limit: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl SecurityPolicy {
    /// Start from the default policy (network and filesystem writes denied).
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder {
            raw: RawPolicy::from(SecurityPolicy::default()),
        }
    }

    pub fn allow_network(&self) -> bool {
        self.allow_network
    }

    pub fn allow_filesystem_write(&self) -> bool {
        self.allow_filesystem_write
    }

    pub fn denied_modules(&self) -> &BTreeSet<String> {
        &self.denied_modules
    }

    /// Fully qualified call names exempt from the always-on call rules.
    pub fn allowed_calls(&self) -> &BTreeSet<String> {
        &self.allowed_calls
    }

    /// Host environment variables forwarded to the candidate when network
    /// access is allowed. Ignored otherwise.
    pub fn passthrough_env(&self) -> &BTreeSet<String> {
        &self.passthrough_env
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_bytes
    }

    pub fn cpu_limit(&self) -> Option<f64> {
        self.cpu_limit
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Re-check the invariants enforced at construction.
    pub fn validate(&self) -> SandboxResult<()> {
        if self.timeout.is_zero() {
            return Err(SandboxError::InvalidPolicy(
                "timeout must be greater than zero".into(),
            ));
        }
        if self.memory_limit_bytes == Some(0) {
            return Err(SandboxError::InvalidPolicy(
                "memory_limit_bytes must be greater than zero when set".into(),
            ));
        }
        if let Some(cpus) = self.cpu_limit {
            if !cpus.is_finite() || cpus <= 0.0 {
                return Err(SandboxError::InvalidPolicy(format!(
                    "cpu_limit must be a positive number, got {cpus}"
                )));
            }
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::InvalidPolicy(
                "max_output_bytes must be greater than zero".into(),
            ));
        }
        if let Some(bad) = self
            .denied_modules
            .iter()
            .chain(self.allowed_calls.iter())
            .find(|name| name.trim().is_empty())
        {
            return Err(SandboxError::InvalidPolicy(format!(
                "module and call names must not be blank, got {bad:?}"
            )));
        }
        Ok(())
    }
}

/// Fluent builder for [`SecurityPolicy`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    raw: RawPolicy,
}

impl PolicyBuilder {
    pub fn allow_network(mut self, allow: bool) -> Self {
        self.raw.allow_network = allow;
        self
    }

    pub fn allow_filesystem_write(mut self, allow: bool) -> Self {
        self.raw.allow_filesystem_write = allow;
        self
    }

    /// Add a module to the deny list.
    pub fn deny_module(mut self, module: impl Into<String>) -> Self {
        self.raw.denied_modules.insert(module.into());
        self
    }

    /// Remove a module from the deny list (including the defaults).
    pub fn permit_module(mut self, module: &str) -> Self {
        self.raw.denied_modules.remove(module);
        self
    }

    /// Exempt a fully qualified call (e.g. `subprocess.run`) from the
    /// process, socket and dynamic-evaluation rules.
    pub fn allow_call(mut self, call: impl Into<String>) -> Self {
        self.raw.allowed_calls.insert(call.into());
        self
    }

    pub fn passthrough_env(mut self, name: impl Into<String>) -> Self {
        self.raw.passthrough_env.insert(name.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.raw.timeout_ms = duration_to_ms(timeout);
        self
    }

    pub fn memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.raw.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn cpu_limit(mut self, cpus: f64) -> Self {
        self.raw.cpu_limit = Some(cpus);
        self
    }

    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.raw.max_output_bytes = bytes;
        self
    }

    pub fn build(self) -> SandboxResult<SecurityPolicy> {
        SecurityPolicy::try_from(self.raw)
    }
}

/// Wire representation: durations as milliseconds, every field optional
/// except the ones without a sensible default.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPolicy {
    #[serde(default)]
    allow_network: bool,
    #[serde(default)]
    allow_filesystem_write: bool,
    #[serde(default = "default_denied_modules")]
    denied_modules: BTreeSet<String>,
    #[serde(default)]
    allowed_calls: BTreeSet<String>,
    #[serde(default)]
    passthrough_env: BTreeSet<String>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default)]
    memory_limit_bytes: Option<u64>,
    #[serde(default)]
    cpu_limit: Option<f64>,
    #[serde(default = "default_max_output_bytes")]
    max_output_bytes: usize,
}

fn default_denied_modules() -> BTreeSet<String> {
    SecurityPolicy::default().denied_modules
}

fn default_timeout_ms() -> u64 {
    duration_to_ms(DEFAULT_TIMEOUT)
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl From<SecurityPolicy> for RawPolicy {
    fn from(p: SecurityPolicy) -> Self {
        RawPolicy {
            allow_network: p.allow_network,
            allow_filesystem_write: p.allow_filesystem_write,
            denied_modules: p.denied_modules,
            allowed_calls: p.allowed_calls,
            passthrough_env: p.passthrough_env,
            timeout_ms: duration_to_ms(p.timeout),
            memory_limit_bytes: p.memory_limit_bytes,
            cpu_limit: p.cpu_limit,
            max_output_bytes: p.max_output_bytes,
        }
    }
}

impl TryFrom<RawPolicy> for SecurityPolicy {
    type Error = SandboxError;

    fn try_from(raw: RawPolicy) -> SandboxResult<Self> {
        let policy = SecurityPolicy {
            allow_network: raw.allow_network,
            allow_filesystem_write: raw.allow_filesystem_write,
            denied_modules: raw.denied_modules,
            allowed_calls: raw.allowed_calls,
            passthrough_env: raw.passthrough_env,
            timeout: Duration::from_millis(raw.timeout_ms),
            memory_limit_bytes: raw.memory_limit_bytes,
            cpu_limit: raw.cpu_limit,
            max_output_bytes: raw.max_output_bytes,
        };
        policy.validate()?;
        Ok(policy)
    }
}
