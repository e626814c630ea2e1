//! The verify state machine: static gate, execution mapping, and the
//! one-shot local fallback.

mod common;

use std::sync::Arc;

use anvil_sandbox::{ExitStatus, Rule, SandboxManager, SecurityPolicy};
use common::{driver_set, MockDriver};

async fn manager_with(
    container: Arc<MockDriver>,
    local: Arc<MockDriver>,
    policy: SecurityPolicy,
) -> SandboxManager {
    SandboxManager::with_drivers(policy, true, driver_set(Some(container), None, local))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_denied_import_never_reaches_driver() {
    let container = MockDriver::container().shared();
    let local = MockDriver::local().shared();
    let manager = manager_with(container.clone(), local.clone(), SecurityPolicy::default()).await;

    for code in [
        "import subprocess\nsubprocess.run(['ls'])",
        "from ctypes import CDLL",
        "import os\nif False:\n    import socket\n",
    ] {
        let result = manager.verify(code).await;
        assert!(!result.success, "{code}");
        assert!(!result.security_violations.is_empty(), "{code}");
        assert!(result.exit_status.is_none());
    }
    assert_eq!(container.executions(), 0);
    assert_eq!(local.executions(), 0);
}

#[tokio::test]
async fn test_socket_import_single_violation() {
    let container = MockDriver::container().shared();
    let manager =
        manager_with(container.clone(), MockDriver::local().shared(), SecurityPolicy::default())
            .await;

    let result = manager.verify("import socket").await;

    assert!(!result.success);
    assert_eq!(result.security_violations.len(), 1);
    let violation = &result.security_violations[0];
    assert_eq!(violation.line, Some(1));
    assert!(violation.detail.contains("socket"));
    assert_eq!(container.executions(), 0);
}

#[tokio::test]
async fn test_network_import_flagged_even_if_unused() {
    let container = MockDriver::container().shared();
    let manager =
        manager_with(container.clone(), MockDriver::local().shared(), SecurityPolicy::default())
            .await;

    let result = manager
        .verify("def never_called():\n    import urllib.request\n\nprint('hi')\n")
        .await;
    assert!(result
        .security_violations
        .iter()
        .any(|v| v.rule == Rule::NetworkModule));
    assert_eq!(container.executions(), 0);
}

#[tokio::test]
async fn test_syntax_error_is_single_violation() {
    let container = MockDriver::container().shared();
    let manager =
        manager_with(container.clone(), MockDriver::local().shared(), SecurityPolicy::default())
            .await;

    let result = manager.verify("def broken(:\n    pass\n").await;
    assert_eq!(result.security_violations.len(), 1);
    assert_eq!(result.security_violations[0].rule, Rule::SyntaxError);
    assert_eq!(container.executions(), 0);
}

#[tokio::test]
async fn test_success_maps_output() {
    let container = MockDriver::container()
        .returning(ExitStatus::Success, "ok\n")
        .shared();
    let manager =
        manager_with(container, MockDriver::local().shared(), SecurityPolicy::default()).await;

    let result = manager.verify("print('ok')").await;
    assert!(result.success);
    assert_eq!(result.output, "ok\n");
    assert!(result.error.is_none());
    assert!(result.security_violations.is_empty());
    assert_eq!(result.active_driver, "container");
    assert_eq!(result.exit_status, Some(ExitStatus::Success));
}

#[tokio::test]
async fn test_runtime_error_is_not_retried() {
    let container = MockDriver::container()
        .returning(ExitStatus::RuntimeError, "partial")
        .shared();
    let local = MockDriver::local().shared();
    let manager = manager_with(container.clone(), local.clone(), SecurityPolicy::default()).await;

    let result = manager.verify("raise ValueError()").await;
    assert!(!result.success);
    assert_eq!(result.exit_status, Some(ExitStatus::RuntimeError));
    assert_eq!(result.error.as_deref(), Some("container runtime error"));
    assert_eq!(container.executions(), 1);
    assert_eq!(local.executions(), 0);
}

#[tokio::test]
async fn test_timeout_is_distinct_from_runtime_error() {
    let container = MockDriver::container()
        .returning(ExitStatus::TimedOut, "")
        .shared();
    let local = MockDriver::local().shared();
    let manager = manager_with(container, local.clone(), SecurityPolicy::default()).await;

    let result = manager.verify("while True: pass").await;
    assert_eq!(result.exit_status, Some(ExitStatus::TimedOut));
    assert_eq!(local.executions(), 0);
}

#[tokio::test]
async fn test_infrastructure_error_falls_back_once() {
    let container = MockDriver::container()
        .returning(ExitStatus::InfrastructureError, "")
        .shared();
    let local = MockDriver::local()
        .returning(ExitStatus::Success, "from local")
        .shared();
    let manager = manager_with(container.clone(), local.clone(), SecurityPolicy::default()).await;

    let result = manager.verify("print('x')").await;
    assert!(result.success);
    assert_eq!(result.active_driver, "local");
    assert_eq!(result.fallback_from.as_deref(), Some("container"));
    assert_eq!(result.output, "from local");
    assert_eq!(container.executions(), 1);
    assert_eq!(local.executions(), 1);

    // The cached selection does not change after a fallback.
    assert_eq!(manager.get_status().active_driver, "container");
}

#[tokio::test]
async fn test_failed_fallback_returns_local_failure() {
    let container = MockDriver::container()
        .returning(ExitStatus::InfrastructureError, "")
        .shared();
    let local = MockDriver::local()
        .returning(ExitStatus::InfrastructureError, "")
        .shared();
    let manager = manager_with(container.clone(), local.clone(), SecurityPolicy::default()).await;

    let result = manager.verify("print('x')").await;
    assert!(!result.success);
    assert_eq!(result.exit_status, Some(ExitStatus::InfrastructureError));
    assert_eq!(result.active_driver, "local");
    assert_eq!(result.error.as_deref(), Some("local backend unreachable"));
    assert_eq!(container.executions(), 1);
    assert_eq!(local.executions(), 1);
}

#[tokio::test]
async fn test_local_infrastructure_error_is_not_retried() {
    let local = MockDriver::local()
        .returning(ExitStatus::InfrastructureError, "")
        .shared();
    let manager = manager_with(
        MockDriver::container().available(false).shared(),
        local.clone(),
        SecurityPolicy::default(),
    )
    .await;

    let result = manager.verify("print('x')").await;
    assert_eq!(result.exit_status, Some(ExitStatus::InfrastructureError));
    assert!(result.fallback_from.is_none());
    assert_eq!(local.executions(), 1);
}

#[tokio::test]
async fn test_verify_is_deterministic() {
    let container = MockDriver::container()
        .returning(ExitStatus::RuntimeError, "")
        .shared();
    let manager =
        manager_with(container, MockDriver::local().shared(), SecurityPolicy::default()).await;

    let rejected = "import socket\nimport requests\neval('1')\n";
    let first = manager.verify(rejected).await;
    let second = manager.verify(rejected).await;
    assert_eq!(first.security_violations, second.security_violations);

    let executed = "print(1)";
    let a = manager.verify(executed).await;
    let b = manager.verify(executed).await;
    assert_eq!(a.exit_status, b.exit_status);
    assert_eq!(a.success, b.success);
}

#[tokio::test]
async fn test_concurrent_verifications_share_manager() {
    let container = MockDriver::container()
        .returning(ExitStatus::Success, "ok")
        .shared();
    let manager = Arc::new(
        manager_with(container.clone(), MockDriver::local().shared(), SecurityPolicy::default())
            .await,
    );

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.verify(&format!("print({i})")).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }
    assert_eq!(container.executions(), 8);
}

#[tokio::test]
async fn test_network_policy_permits_network_imports() {
    let container = MockDriver::container().shared();
    let policy = SecurityPolicy::builder().allow_network(true).build().unwrap();
    let manager = manager_with(container.clone(), MockDriver::local().shared(), policy).await;

    let result = manager.verify("import requests\nprint('x')\n").await;
    assert!(result.security_violations.is_empty());
    assert_eq!(container.executions(), 1);
}
