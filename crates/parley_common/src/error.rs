//! Error and disposition taxonomy for the gateway.
//!
//! Admission failures are decided synchronously and surface as [`Denial`].
//! Everything that happens after a subprocess is spawned ends in exactly one
//! [`Disposition`], which is also the tag written to the persisted record.
//! Raw process/OS errors never cross the broker boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an admission request was refused. Both variants are recoverable by
/// client retry after backoff, not server faults.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Denial {
    /// Caller exceeded the sliding-window request rate.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Global or per-caller concurrency cap already reached.
    #[error("capacity exceeded ({scope})")]
    CapacityExceeded { scope: CapacityScope },
}

impl Denial {
    /// Machine-readable reason for the 429 body.
    pub fn reason(&self) -> &'static str {
        match self {
            Denial::RateLimited { .. } => "rate_limited",
            Denial::CapacityExceeded { .. } => "capacity_exceeded",
        }
    }
}

/// Which concurrency cap was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityScope {
    Global,
    PerCaller,
}

impl CapacityScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityScope::Global => "global",
            CapacityScope::PerCaller => "per_caller",
        }
    }
}

impl std::fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal disposition of one chat session. Exactly one per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The authoritative phase produced usable output and exited cleanly.
    Completed,
    /// Deadline elapsed. Treated as a successful-but-incomplete answer: the
    /// partial buffer is still normalized and surfaced, not discarded.
    SubprocessTimeout,
    /// Nonzero exit. Stderr is logged for diagnostics, never shown verbatim.
    SubprocessFailure,
    /// Caller disconnected mid-stream. A normal outcome, not an error.
    CallerAborted,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::SubprocessTimeout => "subprocess_timeout",
            Disposition::SubprocessFailure => "subprocess_failure",
            Disposition::CallerAborted => "caller_aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Disposition::Completed),
            "subprocess_timeout" => Some(Disposition::SubprocessTimeout),
            "subprocess_failure" => Some(Disposition::SubprocessFailure),
            "caller_aborted" => Some(Disposition::CallerAborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
