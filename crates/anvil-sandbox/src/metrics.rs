//! Global atomic counters for verification activity.
//!
//! Counters are bumped at the call site by the manager. Call
//! [`Metrics::flush`] to emit current values as one `tracing::info!` event
//! (for example when a CLI run ends).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    verifications: AtomicU64,
    static_rejections: AtomicU64,
    executions: AtomicU64,
    timeouts: AtomicU64,
    fallbacks: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            verifications: AtomicU64::new(0),
            static_rejections: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn inc_verifications(&self) {
        self.verifications.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "verifications", "counter incremented");
    }

    pub fn inc_static_rejections(&self) {
        self.static_rejections.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "static_rejections", "counter incremented");
    }

    /// One driver `execute` call, fallback retries included.
    pub fn inc_executions(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions", "counter incremented");
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "timeouts", "counter incremented");
    }

    pub fn inc_fallbacks(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "fallbacks", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            verifications = self.verifications(),
            static_rejections = self.static_rejections(),
            executions = self.executions(),
            timeouts = self.timeouts(),
            fallbacks = self.fallbacks(),
        );
    }

    pub fn verifications(&self) -> u64 {
        self.verifications.load(Ordering::Relaxed)
    }

    pub fn static_rejections(&self) -> u64 {
        self.static_rejections.load(Ordering::Relaxed)
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.verifications,
            &self.static_rejections,
            &self.executions,
            &self.timeouts,
            &self.fallbacks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
