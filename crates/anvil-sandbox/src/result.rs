//! The verdict returned to callers of [`SandboxManager::verify`](crate::manager::SandboxManager::verify).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analyzer::{Rule, Violation};
use crate::outcome::{ExecutionOutcome, ExitStatus};

/// Structured outcome of one verification.
///
/// Either the pipeline stopped at static analysis (`security_violations`
/// non-empty, `exit_status` absent) or it executed the candidate
/// (`security_violations` empty, `exit_status` present). `success` implies
/// the latter with [`ExitStatus::Success`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration: Duration,
    pub security_violations: Vec<Violation>,
    /// Driver that produced this result.
    pub active_driver: String,
    pub exit_status: Option<ExitStatus>,
    /// Driver whose infrastructure failure caused a fallback, if any.
    pub fallback_from: Option<String>,
}

impl VerificationResult {
    /// Static analysis rejected the candidate; nothing was executed.
    pub fn rejected(
        violations: Vec<Violation>,
        duration: Duration,
        active_driver: impl Into<String>,
    ) -> Self {
        let error = match violations.as_slice() {
            [only] if only.rule == Rule::SyntaxError => format!("syntax error: {only}"),
            [only] => format!("security violation: {only}"),
            many => format!("{} security violations", many.len()),
        };
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
            duration,
            security_violations: violations,
            active_driver: active_driver.into(),
            exit_status: None,
            fallback_from: None,
        }
    }

    /// Map a driver outcome into a verdict.
    pub fn executed(
        outcome: ExecutionOutcome,
        active_driver: impl Into<String>,
        fallback_from: Option<String>,
    ) -> Self {
        Self {
            success: outcome.is_success(),
            output: outcome.stdout_tail,
            error: outcome.error_message,
            duration: outcome.duration,
            security_violations: Vec::new(),
            active_driver: active_driver.into(),
            exit_status: Some(outcome.exit_status),
            fallback_from,
        }
    }

    /// Did execution get far enough to produce an exit status?
    pub fn was_executed(&self) -> bool {
        self.exit_status.is_some()
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}
