//! Shared request, answer, and record types.

use crate::error::Disposition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An accepted chat request. Immutable once built.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Opaque caller identity (the bearer token, unparsed).
    pub caller_id: String,
    /// Raw request text.
    pub text: String,
    /// Client-supplied or generated correlation id.
    pub correlation_id: Uuid,
    /// Arrival timestamp.
    pub received_at: DateTime<Utc>,
}

impl ChatRequest {
    pub fn new(caller_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            text: text.into(),
            correlation_id: Uuid::new_v4(),
            received_at: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = id;
        self
    }
}

/// The normalized outcome of a session: a single concise sentence for the
/// caller, plus internal-only raw text for audit. The caller-visible copy
/// never carries model or provider identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedAnswer {
    /// Single best-effort sentence, safe to show externally.
    pub concise: String,
    /// Full raw text, retained for audit/debugging only.
    pub full: Option<String>,
    /// Wall-clock time spent on the session.
    pub elapsed_ms: u64,
    /// True until a terminal result is available.
    pub pending: bool,
}

impl NormalizedAnswer {
    /// Placeholder emitted when no phase produced usable output in time.
    pub fn pending_placeholder(elapsed_ms: u64) -> Self {
        Self {
            concise: "Still working on an answer. Check back shortly.".to_string(),
            full: None,
            elapsed_ms,
            pending: true,
        }
    }

    /// The caller-facing projection: concise text and elapsed time only.
    pub fn caller_view(&self) -> CallerAnswer {
        CallerAnswer {
            concise_answer: self.concise.clone(),
            pending: self.pending,
            meta: AnswerMeta {
                elapsed_ms: self.elapsed_ms,
            },
        }
    }
}

/// Caller-visible answer payload. Deliberately has no slot for model,
/// provider, or raw scratch output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerAnswer {
    pub concise_answer: String,
    pub pending: bool,
    pub meta: AnswerMeta,
}

/// Caller-visible metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMeta {
    pub elapsed_ms: u64,
}

/// One persisted chat record. Append-only from the gateway's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub caller_id: String,
    pub input_text: String,
    pub concise_answer: String,
    pub full_answer: Option<String>,
    pub disposition: Disposition,
    pub timestamp: DateTime<Utc>,
}

/// Events multiplexed onto one per-request stream, in order:
/// `Correlation`, at most one `Primary`, any number of `Detail`/`Stderr`,
/// exactly one `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Correlation id for poll-based recovery, always first.
    Correlation(Uuid),
    /// The concise answer. Emitted at most once per stream.
    Primary(String),
    /// Supplementary, non-authoritative output after the primary answer.
    Detail(String),
    /// Diagnostic-only subprocess stderr line.
    Stderr(String),
    /// Terminal event, always last.
    Done {
        disposition: Disposition,
        pending: bool,
    },
}

impl SessionEvent {
    /// SSE event name on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            SessionEvent::Correlation(_) => "correlationId",
            SessionEvent::Primary(_) => "data",
            SessionEvent::Detail(_) => "detail",
            SessionEvent::Stderr(_) => "stderr",
            SessionEvent::Done { .. } => "done",
        }
    }
}
