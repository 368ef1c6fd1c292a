//! Streaming session manager.
//!
//! Drives one chat request through both subprocess phases, run concurrently:
//! a short advisory preflight (may produce a fast provisional answer) and the
//! authoritative full invocation. All session output is multiplexed onto a
//! single ordered event stream: the correlation id first, at most one primary
//! answer, then supplementary detail, and exactly one terminal `Done`.
//!
//! The session owns the admission ticket for its whole lifetime. Capacity is
//! released by the ticket's Drop at the end of the session task, never
//! earlier, so a client disconnect cannot leak a slot while the subprocess
//! is still being torn down.

use crate::admission::AdmissionTicket;
use crate::broker::{BrokerEvent, InvocationOutcome, Phase, PhaseStatus, ProcessBroker};
use crate::metrics::GatewayMetrics;
use crate::persist::RecordSink;
use crate::store::EphemeralStore;
use chrono::Utc;
use parley_common::config::{GatewayConfig, NormalizerConfig};
use parley_common::error::Disposition;
use parley_common::normalize::{
    best_effort_text, enforce_concise_style, sanitize_for_caller, strip_operational_metadata,
};
use parley_common::types::{ChatRecord, ChatRequest, NormalizedAnswer, SessionEvent};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Shown when the model produced text we refuse to surface (empty or
/// non-Latin script).
const FALLBACK_ANSWER: &str = "I do not have a readable answer for that.";

/// Shown when the model subprocess failed outright. The real error goes to
/// the log, never to the caller.
const FAILURE_ANSWER: &str = "Something went wrong while answering. Please try again.";

/// Orchestrates sessions. One instance per daemon, shared across requests.
pub struct SessionManager {
    broker: ProcessBroker,
    normalizer: NormalizerConfig,
    store: Arc<EphemeralStore>,
    sink: Arc<dyn RecordSink>,
    metrics: GatewayMetrics,
}

impl SessionManager {
    pub fn new(
        config: &GatewayConfig,
        store: Arc<EphemeralStore>,
        sink: Arc<dyn RecordSink>,
        metrics: GatewayMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker: ProcessBroker::new(config.model.clone()),
            normalizer: config.normalizer,
            store,
            sink,
            metrics,
        })
    }

    /// Start a session for an admitted request. The returned receiver yields
    /// the ordered event stream; dropping it cancels the session.
    pub fn spawn_session(
        self: &Arc<Self>,
        request: ChatRequest,
        ticket: AdmissionTicket,
    ) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(64);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_session(request, ticket, tx).await;
        });
        rx
    }

    async fn run_session(
        &self,
        request: ChatRequest,
        ticket: AdmissionTicket,
        out: mpsc::Sender<SessionEvent>,
    ) {
        let started = Instant::now();
        self.metrics.active_sessions.inc();
        self.store.insert_pending(request.correlation_id);

        let mut primary_sent = false;
        let mut aborted = false;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        emit(
            &out,
            &cancel_tx,
            &mut aborted,
            SessionEvent::Correlation(request.correlation_id),
        )
        .await;

        // Both phases share one event channel; the channel closes once both
        // broker tasks have sent their terminal outcomes.
        let (events_tx, mut events_rx) = mpsc::channel(128);
        self.broker.spawn_invocation(
            Phase::Preflight,
            &request.text,
            cancel_rx.clone(),
            events_tx.clone(),
        );
        self.broker
            .spawn_invocation(Phase::Full, &request.text, cancel_rx, events_tx);

        let mut preflight_outcome: Option<InvocationOutcome> = None;
        let mut full_outcome: Option<InvocationOutcome> = None;

        while preflight_outcome.is_none() || full_outcome.is_none() {
            tokio::select! {
                // The caller hung up: signal both subprocesses, then keep
                // draining until the broker reports the kills.
                _ = out.closed(), if !aborted => {
                    debug!("Caller went away, cancelling session {}", request.correlation_id);
                    aborted = true;
                    let _ = cancel_tx.send(true);
                }
                event = events_rx.recv() => match event {
                    Some(BrokerEvent::Payload { payload, .. }) => {
                        let concise = self.normalize_concise(&payload.response);
                        let event = if primary_sent {
                            SessionEvent::Detail(concise)
                        } else {
                            primary_sent = true;
                            SessionEvent::Primary(concise)
                        };
                        emit(&out, &cancel_tx, &mut aborted, event).await;
                    }
                    Some(BrokerEvent::DetailLine { line, .. }) => {
                        if !line.trim().is_empty() {
                            emit(&out, &cancel_tx, &mut aborted, SessionEvent::Detail(line)).await;
                        }
                    }
                    Some(BrokerEvent::StderrLine { line, .. }) => {
                        emit(&out, &cancel_tx, &mut aborted, SessionEvent::Stderr(line)).await;
                    }
                    Some(BrokerEvent::Terminal(outcome)) => {
                        self.metrics
                            .record_invocation(outcome.phase.as_str(), status_label(&outcome.status));
                        match outcome.phase {
                            Phase::Preflight => preflight_outcome = Some(outcome),
                            Phase::Full => {
                                // The full phase is authoritative; a preflight
                                // still running has nothing left to add.
                                if preflight_outcome.is_none() {
                                    let _ = cancel_tx.send(true);
                                }
                                full_outcome = Some(outcome);
                            }
                        }
                    }
                    // The broker always sends a terminal before exiting; a
                    // closed channel without both means a task panicked.
                    None => {
                        error!("Broker channel closed before both terminal outcomes");
                        break;
                    }
                }
            }
        }

        let disposition = if aborted {
            Disposition::CallerAborted
        } else {
            match &full_outcome {
                Some(outcome) => match outcome.status {
                    PhaseStatus::Completed => Disposition::Completed,
                    PhaseStatus::TimedOut => Disposition::SubprocessTimeout,
                    PhaseStatus::Aborted => Disposition::CallerAborted,
                    PhaseStatus::Failed { .. } => Disposition::SubprocessFailure,
                },
                None => Disposition::SubprocessFailure,
            }
        };

        let preflight_answer = preflight_outcome
            .as_ref()
            .and_then(|o| o.payload.as_ref())
            .map(|p| self.normalize_concise(&p.response));

        let answer =
            self.resolve_answer(&disposition, full_outcome.as_ref(), preflight_answer, started);

        // A late primary covers the case where the payload only became
        // parseable in the terminal buffer (partial output before a kill).
        if !primary_sent && !answer.pending {
            emit(
                &out,
                &cancel_tx,
                &mut aborted,
                SessionEvent::Primary(answer.concise.clone()),
            )
            .await;
        }

        let record = ChatRecord {
            caller_id: request.caller_id.clone(),
            input_text: request.text.clone(),
            concise_answer: answer.concise.clone(),
            full_answer: answer.full.clone(),
            disposition,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.sink.append(&record) {
            error!("Failed to persist chat record: {:#}", e);
        }

        self.store.complete(request.correlation_id, answer.clone());

        emit(
            &out,
            &cancel_tx,
            &mut aborted,
            SessionEvent::Done {
                disposition,
                pending: answer.pending,
            },
        )
        .await;

        self.metrics.record_session(disposition.as_str());
        self.metrics.active_sessions.dec();

        info!(
            "Session {} for {} finished: {} after {:?}",
            request.correlation_id,
            request.caller_id,
            disposition,
            started.elapsed()
        );

        // The ticket drops here, releasing admission capacity.
        drop(ticket);
    }

    /// Full normalization pipeline for one raw model response.
    fn normalize_concise(&self, raw: &str) -> String {
        let stripped = strip_operational_metadata(raw, &self.normalizer);
        let concise = enforce_concise_style(&stripped.external, &self.normalizer);
        sanitize_for_caller(&concise, FALLBACK_ANSWER)
    }

    /// Pick the answer the session ends with, in preference order: the full
    /// phase's payload, its best-effort stdout, the preflight answer, then
    /// the pending placeholder.
    fn resolve_answer(
        &self,
        disposition: &Disposition,
        full: Option<&InvocationOutcome>,
        preflight_answer: Option<String>,
        started: Instant,
    ) -> NormalizedAnswer {
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if *disposition == Disposition::SubprocessFailure {
            if let Some(outcome) = full {
                error!(
                    "Full phase failed ({:?}): {}",
                    outcome.status,
                    outcome.stderr.trim()
                );
            }
            return NormalizedAnswer {
                concise: FAILURE_ANSWER.to_string(),
                full: full.map(|o| o.stdout.clone()).filter(|s| !s.is_empty()),
                elapsed_ms,
                pending: false,
            };
        }

        let raw = full.and_then(|outcome| {
            outcome
                .payload
                .as_ref()
                .map(|p| p.response.clone())
                .or_else(|| best_effort_text(&outcome.stdout))
        });

        if let Some(raw) = raw {
            let stripped = strip_operational_metadata(&raw, &self.normalizer);
            let concise = enforce_concise_style(&stripped.external, &self.normalizer);
            let concise = sanitize_for_caller(&concise, FALLBACK_ANSWER);
            return NormalizedAnswer {
                concise,
                full: stripped.full,
                elapsed_ms,
                pending: false,
            };
        }

        if let Some(concise) = preflight_answer {
            return NormalizedAnswer {
                concise,
                full: None,
                elapsed_ms,
                pending: false,
            };
        }

        NormalizedAnswer::pending_placeholder(elapsed_ms)
    }
}

fn status_label(status: &PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Completed => "completed",
        PhaseStatus::TimedOut => "timed_out",
        PhaseStatus::Aborted => "aborted",
        PhaseStatus::Failed { .. } => "failed",
    }
}

/// Best-effort event send. A refused send means the stream receiver is gone,
/// which doubles as the cancellation signal for the running subprocess.
async fn emit(
    out: &mpsc::Sender<SessionEvent>,
    cancel_tx: &watch::Sender<bool>,
    aborted: &mut bool,
    event: SessionEvent,
) {
    if *aborted {
        return;
    }
    if out.send(event).await.is_err() {
        *aborted = true;
        let _ = cancel_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::persist::SqliteRecordSink;
    use parley_common::config::{LimitsConfig, ModelConfig, StoreConfig};
    use std::time::Duration;

    fn config_with_script(script: &str, full_deadline_secs: u64) -> GatewayConfig {
        GatewayConfig {
            model: ModelConfig {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
                preflight_extra_args: vec!["--offline".to_string()],
                system_instruction: "answer concisely".to_string(),
                full_deadline_secs,
                preflight_deadline_secs: 1,
            },
            ..GatewayConfig::default()
        }
    }

    struct Harness {
        manager: Arc<SessionManager>,
        admission: Arc<AdmissionController>,
        store: Arc<EphemeralStore>,
        sink: Arc<SqliteRecordSink>,
        _dir: tempfile::TempDir,
    }

    fn harness(script: &str, full_deadline_secs: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(SqliteRecordSink::open(&dir.path().join("records.db")).unwrap());
        let store = EphemeralStore::new(StoreConfig::default());
        let admission = AdmissionController::new(LimitsConfig::default());
        let manager = SessionManager::new(
            &config_with_script(script, full_deadline_secs),
            Arc::clone(&store),
            sink.clone() as Arc<dyn RecordSink>,
            GatewayMetrics::new(),
        );
        Harness {
            manager,
            admission,
            store,
            sink,
            _dir: dir,
        }
    }

    async fn collect_all(mut rx: mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn ordered_stream_with_single_primary() {
        let h = harness(r#"echo '{"response": "Paris is the capital of France."}'"#, 5);
        let request = ChatRequest::new("alice", "capital of france?");
        let correlation_id = request.correlation_id;
        let ticket = h.admission.try_acquire("alice").unwrap();

        let events = collect_all(h.manager.spawn_session(request, ticket)).await;

        assert_eq!(events[0], SessionEvent::Correlation(correlation_id));
        let primaries: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Primary(_)))
            .collect();
        assert_eq!(primaries.len(), 1);
        assert!(matches!(
            events.last().unwrap(),
            SessionEvent::Done {
                disposition: Disposition::Completed,
                pending: false
            }
        ));

        // Both phases ran the same script; the second payload was demoted.
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Detail(_))));

        let stored = h.store.lookup(correlation_id).unwrap();
        assert!(!stored.pending);
        assert_eq!(stored.concise, "Paris is the capital of France.");
        assert_eq!(h.sink.count().unwrap(), 1);
        assert_eq!(h.admission.global_active(), 0);
    }

    #[tokio::test]
    async fn fast_preflight_gives_provisional_primary_but_full_answer_persists() {
        // Preflight answers immediately; the full phase takes two seconds and
        // produces the authoritative text. The stream shows the provisional
        // answer once, the store ends with the full one.
        let h = harness(
            r#"if [ "$1" = "--offline" ]; then echo '{"response": "Quick take."}'; else sleep 2; echo '{"response": "Slow and thorough."}'; fi"#,
            10,
        );
        let request = ChatRequest::new("alice", "q");
        let correlation_id = request.correlation_id;
        let ticket = h.admission.try_acquire("alice").unwrap();

        let events = collect_all(h.manager.spawn_session(request, ticket)).await;

        let primaries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Primary(text) => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(primaries, vec!["Quick take.".to_string()]);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Detail(text) if text.contains("thorough"))));

        let stored = h.store.lookup(correlation_id).unwrap();
        assert_eq!(stored.concise, "Slow and thorough.");
    }

    #[tokio::test]
    async fn preflight_failure_is_advisory_only() {
        // Preflight (marked by --offline) exits nonzero; the full phase
        // still produces the answer.
        let h = harness(
            r#"if [ "$1" = "--offline" ]; then exit 7; else echo '{"response": "Recovered in the full phase."}'; fi"#,
            5,
        );
        let request = ChatRequest::new("alice", "q");
        let ticket = h.admission.try_acquire("alice").unwrap();

        let events = collect_all(h.manager.spawn_session(request, ticket)).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Primary(text) if text.contains("Recovered"))));
        assert!(matches!(
            events.last().unwrap(),
            SessionEvent::Done {
                disposition: Disposition::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn timeout_keeps_partial_answer() {
        let h = harness(
            r#"echo '{"response": "Partial but usable."}'; sleep 30"#,
            1,
        );
        let request = ChatRequest::new("alice", "q");
        let correlation_id = request.correlation_id;
        let ticket = h.admission.try_acquire("alice").unwrap();

        let events = collect_all(h.manager.spawn_session(request, ticket)).await;

        assert!(matches!(
            events.last().unwrap(),
            SessionEvent::Done {
                disposition: Disposition::SubprocessTimeout,
                pending: false
            }
        ));
        let stored = h.store.lookup(correlation_id).unwrap();
        assert_eq!(stored.concise, "Partial but usable.");
        assert_eq!(h.admission.global_active(), 0);
    }

    #[tokio::test]
    async fn silent_timeout_yields_pending_placeholder() {
        // Both phases produce nothing before their deadlines: no primary is
        // ever emitted and the session ends pending.
        let h = harness("sleep 30", 1);
        let request = ChatRequest::new("alice", "q");
        let correlation_id = request.correlation_id;
        let ticket = h.admission.try_acquire("alice").unwrap();

        let events = collect_all(h.manager.spawn_session(request, ticket)).await;

        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::Primary(_))));
        assert!(matches!(
            events.last().unwrap(),
            SessionEvent::Done {
                disposition: Disposition::SubprocessTimeout,
                pending: true
            }
        ));

        let stored = h.store.lookup(correlation_id).unwrap();
        assert!(stored.pending);
        assert!(!stored.concise.is_empty());
        assert_eq!(h.sink.count().unwrap(), 1);
        assert_eq!(h.admission.global_active(), 0);
    }

    #[tokio::test]
    async fn subprocess_failure_hides_the_error() {
        let h = harness(r#"echo 'cuda out of memory' >&2; exit 2"#, 5);
        let request = ChatRequest::new("alice", "q");
        let ticket = h.admission.try_acquire("alice").unwrap();

        let events = collect_all(h.manager.spawn_session(request, ticket)).await;

        assert!(matches!(
            events.last().unwrap(),
            SessionEvent::Done {
                disposition: Disposition::SubprocessFailure,
                ..
            }
        ));
        // The caller-facing answer never carries the raw error.
        let primary = events.iter().find_map(|e| match e {
            SessionEvent::Primary(text) => Some(text.clone()),
            _ => None,
        });
        assert_eq!(primary.unwrap(), FAILURE_ANSWER);
        assert_eq!(h.sink.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn dropped_receiver_cancels_and_releases_capacity() {
        let h = harness("sleep 30", 60);
        let request = ChatRequest::new("alice", "q");
        let ticket = h.admission.try_acquire("alice").unwrap();
        assert_eq!(h.admission.global_active(), 1);

        let mut rx = h.manager.spawn_session(request, ticket);
        // Read the correlation id, then hang up.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, SessionEvent::Correlation(_)));
        drop(rx);

        // The kill and the record write finish well inside a second.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(h.admission.global_active(), 0);
        assert_eq!(h.sink.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn noisy_model_output_is_normalized() {
        // printf keeps the backslash-n as JSON escape bytes; echo may not.
        let h = harness(
            r#"printf '%s\n' '{"response": "Thinking: let me check.\nParis is the capital of France. Paris is the capital city of France."}'"#,
            5,
        );
        let request = ChatRequest::new("alice", "q");
        let correlation_id = request.correlation_id;
        let ticket = h.admission.try_acquire("alice").unwrap();

        collect_all(h.manager.spawn_session(request, ticket)).await;

        let stored = h.store.lookup(correlation_id).unwrap();
        // Scaffolding stripped, restatement deduplicated, one sentence kept.
        assert_eq!(stored.concise, "Paris is the capital of France.");
        assert!(stored.full.is_some());
    }
}
