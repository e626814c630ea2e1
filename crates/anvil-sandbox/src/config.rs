//! Driver configuration, resolved from the environment.

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};

pub const DEFAULT_PYTHON: &str = "python3";
pub const DEFAULT_CONTAINER_RUNTIME: &str = "docker";
pub const DEFAULT_CONTAINER_IMAGE: &str = "python:3.12-slim";
pub const DEFAULT_REMOTE_API_URL: &str = "https://app.daytona.io/api";

/// Configuration for the local subprocess driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Interpreter used to run candidate code.
    pub python: String,
    /// Binary used to enter a fresh network namespace.
    pub unshare: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            python: std::env::var("ANVIL_PYTHON").unwrap_or_else(|_| DEFAULT_PYTHON.to_string()),
            unshare: "unshare".to_string(),
        }
    }
}

/// Configuration for the ephemeral-container driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container CLI (`docker` or a compatible runtime such as `podman`).
    pub runtime: String,
    pub image: String,
    pub pids_limit: u32,
    /// Upper bound on the availability probe.
    pub probe_timeout_ms: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: std::env::var("ANVIL_CONTAINER_RUNTIME")
                .unwrap_or_else(|_| DEFAULT_CONTAINER_RUNTIME.to_string()),
            image: std::env::var("ANVIL_CONTAINER_IMAGE")
                .unwrap_or_else(|_| DEFAULT_CONTAINER_IMAGE.to_string()),
            pids_limit: 128,
            probe_timeout_ms: 3_000,
        }
    }
}

/// Configuration for the remote cloud sandbox driver.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub api_url: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    /// Optional region/target for sandbox placement.
    pub target: Option<String>,
    /// Budget for provisioning and teardown requests.
    pub request_timeout_ms: u64,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"***")
            .field("target", &self.target)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(api_url: &str, api_key: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            target: None,
            request_timeout_ms: 30_000,
        }
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    /// Read `DAYTONA_API_KEY`, `DAYTONA_API_URL` and `DAYTONA_TARGET`.
    ///
    /// Returns `None` when no API key is set: the remote driver is then
    /// simply not configured.
    pub fn from_env() -> Option<Self> {
        let key = std::env::var("DAYTONA_API_KEY").ok()?;
        if key.trim().is_empty() {
            return None;
        }
        let url = std::env::var("DAYTONA_API_URL")
            .unwrap_or_else(|_| DEFAULT_REMOTE_API_URL.to_string());
        let config = Self::new(&url, key.trim());
        Some(match std::env::var("DAYTONA_TARGET") {
            Ok(target) if !target.trim().is_empty() => config.with_target(target.trim()),
            _ => config,
        })
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if !(self.api_url.starts_with("https://") || self.api_url.starts_with("http://")) {
            return Err(SandboxError::InvalidConfig(format!(
                "remote api_url must be an http(s) URL, got {:?}",
                self.api_url
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(SandboxError::InvalidConfig(
                "remote api_key must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Everything the manager needs to construct its drivers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub local: LocalConfig,
    pub container: ContainerConfig,
    pub remote: Option<RemoteConfig>,
}

impl EngineConfig {
    /// Resolve all driver settings from environment variables.
    pub fn from_env() -> Self {
        Self {
            local: LocalConfig::default(),
            container: ContainerConfig::default(),
            remote: RemoteConfig::from_env(),
        }
    }
}
