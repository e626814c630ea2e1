//! Structured observability hooks for the verification lifecycle.
//!
//! Every event carries an `event = "<domain>.<action>"` field so log
//! pipelines can filter on it. Filter with `ANVIL_LOG` (or `RUST_LOG`);
//! set `ANVIL_LOG_FORMAT=json` for JSON lines.

use std::future::Future;

use sha2::{Digest, Sha256};
use tracing::instrument::Instrumented;
use tracing::{info, warn, Instrument};

use crate::analyzer::Violation;
use crate::outcome::ExitStatus;

/// Short, stable identifier for a piece of candidate code: the first 12 hex
/// characters of its sha256.
pub fn code_digest(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    hex::encode(&digest[..6])
}

/// Span scoping one `verify` call, tagged with the code digest and driver.
///
/// Async callers wrap the future with [`VerifySpan::instrument`]; an entered
/// guard must not be held across `.await`.
pub struct VerifySpan {
    span: tracing::Span,
}

impl VerifySpan {
    pub fn new(code_digest: &str, driver: &str) -> Self {
        let span = tracing::info_span!("anvil.verify", code = %code_digest, driver = %driver);
        Self { span }
    }

    pub fn instrument<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }

    /// Enter the span for synchronous code until the guard drops.
    pub fn enter(self) -> tracing::span::EnteredSpan {
        self.span.entered()
    }
}

pub fn emit_driver_selected(driver: &str, prefer_primary: bool, fallback_available: bool) {
    info!(
        event = "driver.selected",
        driver = %driver,
        prefer_primary = prefer_primary,
        fallback_available = fallback_available,
    );
}

pub fn emit_verify_started(code_digest: &str, code_bytes: usize) {
    info!(event = "verify.started", code = %code_digest, code_bytes = code_bytes);
}

/// Static analysis stopped the pipeline.
pub fn emit_static_rejected(code_digest: &str, violations: &[Violation]) {
    let first = violations.first().map(ToString::to_string).unwrap_or_default();
    info!(
        event = "verify.static_rejected",
        code = %code_digest,
        violations = violations.len(),
        first = %first,
    );
}

pub fn emit_execution_finished(driver: &str, status: ExitStatus, duration_ms: u64) {
    info!(
        event = "verify.executed",
        driver = %driver,
        exit_status = %status,
        duration_ms = duration_ms,
    );
}

/// A non-local driver failed at the infrastructure level and the run is
/// being retried locally. Warn level: the isolation guarantee just dropped.
pub fn emit_driver_fallback(from: &str, to: &str, error: &str) {
    warn!(event = "driver.fallback", from = %from, to = %to, error = %error);
}
