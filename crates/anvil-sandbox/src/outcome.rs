//! Raw execution outcome produced by a single driver invocation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// The candidate ran to completion and exited cleanly.
    Success,
    /// The candidate raised or exited non-zero.
    RuntimeError,
    /// The policy timeout elapsed and the run was forcibly terminated.
    TimedOut,
    /// The isolation backend itself failed; the candidate may never have run.
    InfrastructureError,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Success => "success",
            ExitStatus::RuntimeError => "runtime_error",
            ExitStatus::TimedOut => "timed_out",
            ExitStatus::InfrastructureError => "infrastructure_error",
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one driver invocation. Never mutated after the driver returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub exit_status: ExitStatus,
    /// Tail of the captured stdout, bounded by the policy's output cap.
    pub stdout_tail: String,
    pub error_message: Option<String>,
    /// Time from execution start (isolation ready) to completion or kill.
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn success(stdout_tail: String, duration: Duration) -> Self {
        Self {
            exit_status: ExitStatus::Success,
            stdout_tail,
            error_message: None,
            duration,
        }
    }

    pub fn runtime_error(stdout_tail: String, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_status: ExitStatus::RuntimeError,
            stdout_tail,
            error_message: Some(error.into()),
            duration,
        }
    }

    pub fn timed_out(stdout_tail: String, limit: Duration, duration: Duration) -> Self {
        Self {
            exit_status: ExitStatus::TimedOut,
            stdout_tail,
            error_message: Some(format!(
                "execution timed out after {}ms (limit {}ms)",
                duration.as_millis(),
                limit.as_millis()
            )),
            duration,
        }
    }

    pub fn infrastructure(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_status: ExitStatus::InfrastructureError,
            stdout_tail: String::new(),
            error_message: Some(error.into()),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_status == ExitStatus::Success
    }
}

/// Byte buffer that keeps only the last `cap` bytes written to it.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            self.truncated |= chunk.len() > self.cap || !self.buf.is_empty();
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.truncated = true;
        }
        self.buf.extend_from_slice(chunk);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Lossy UTF-8 view of the retained tail.
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Keep the last `cap` bytes of `text`, respecting char boundaries.
pub fn tail_of(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut start = text.len() - cap;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_buffer_keeps_last_bytes() {
        let mut tail = TailBuffer::new(5);
        tail.push(b"abc");
        tail.push(b"defg");
        assert!(tail.is_truncated());
        assert_eq!(tail.into_string(), "cdefg");
    }

    #[test]
    fn test_tail_buffer_large_chunk() {
        let mut tail = TailBuffer::new(3);
        tail.push(b"0123456789");
        assert!(tail.is_truncated());
        assert_eq!(tail.into_string(), "789");
    }

    #[test]
    fn test_tail_buffer_under_cap() {
        let mut tail = TailBuffer::new(16);
        tail.push(b"ok\n");
        assert!(!tail.is_truncated());
        assert_eq!(tail.into_string(), "ok\n");
    }

    #[test]
    fn test_tail_of_respects_char_boundary() {
        assert_eq!(tail_of("hello", 10), "hello");
        assert_eq!(tail_of("hello", 3), "llo");
        // "é" is two bytes; cutting inside it must skip forward.
        assert_eq!(tail_of("aé", 1), "");
        assert_eq!(tail_of("aéb", 2), "b");
    }

    #[test]
    fn test_timed_out_message_mentions_limit() {
        let o = ExecutionOutcome::timed_out(
            "partial".into(),
            Duration::from_secs(2),
            Duration::from_millis(2001),
        );
        assert_eq!(o.exit_status, ExitStatus::TimedOut);
        assert!(o.error_message.unwrap().contains("limit 2000ms"));
        assert_eq!(o.stdout_tail, "partial");
    }
}
