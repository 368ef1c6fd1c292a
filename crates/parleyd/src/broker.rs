//! Process broker.
//!
//! Owns the lifecycle of one model CLI invocation: spawn, stream stdout and
//! stderr, enforce the phase deadline, honor cancellation, and report exactly
//! one terminal outcome. A single task per invocation consumes both pipes and
//! is the only writer of the accumulated buffers.
//!
//! Raw process/OS errors stop here: every failure mode is converted into an
//! [`InvocationOutcome`] before the session manager sees it.

use parley_common::config::ModelConfig;
use parley_common::normalize::{extract_structured_payload, StructuredPayload};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cap on each accumulated buffer; output past this is dropped.
const MAX_BUFFER_BYTES: usize = 64 * 1024;

/// Which attempt this invocation serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Short deadline, external lookups forbidden. Advisory only.
    Preflight,
    /// Long deadline, lookups permitted. Authoritative.
    Full,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preflight => "preflight",
            Phase::Full => "full",
        }
    }
}

/// Terminal state of one invocation. Exactly one per spawn.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseStatus {
    /// Process exited zero having produced output.
    Completed,
    /// Deadline elapsed; the child was killed, partial buffers kept.
    TimedOut,
    /// Cancellation signal received; the child was killed.
    Aborted,
    /// Nonzero exit, or the process could not be spawned at all.
    Failed { exit_code: Option<i32> },
}

/// Everything one invocation produced.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub phase: Phase,
    pub status: PhaseStatus,
    /// Accumulated stdout, append-only until terminal.
    pub stdout: String,
    /// Accumulated stderr, diagnostics only.
    pub stderr: String,
    /// Structured payload, if one was recognized while streaming.
    pub payload: Option<StructuredPayload>,
    pub elapsed: Duration,
}

/// Events the owning task emits while an invocation runs.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A structured payload was recognized in the stdout buffer. Sent at most
    /// once per invocation; later output is supplementary, never re-parsed as
    /// a primary answer.
    Payload {
        phase: Phase,
        payload: StructuredPayload,
    },
    /// A stdout line that arrived after the payload was recognized.
    DetailLine { phase: Phase, line: String },
    /// A stderr line (diagnostic only).
    StderrLine { phase: Phase, line: String },
    /// The single terminal report.
    Terminal(InvocationOutcome),
}

/// Spawns and supervises model CLI invocations.
#[derive(Debug, Clone)]
pub struct ProcessBroker {
    model: ModelConfig,
}

impl ProcessBroker {
    pub fn new(model: ModelConfig) -> Self {
        Self { model }
    }

    /// Start one invocation. The returned task owns the subprocess and its
    /// buffers and sends exactly one `Terminal` event before finishing, even
    /// when the receiver is gone.
    pub fn spawn_invocation(
        &self,
        phase: Phase,
        user_text: &str,
        cancel: watch::Receiver<bool>,
        events: mpsc::Sender<BrokerEvent>,
    ) -> JoinHandle<()> {
        let model = self.model.clone();
        let prompt = format!("{}\n\n{}", model.system_instruction, user_text);
        tokio::spawn(run_invocation(model, phase, prompt, cancel, events))
    }
}

async fn run_invocation(
    model: ModelConfig,
    phase: Phase,
    prompt: String,
    mut cancel: watch::Receiver<bool>,
    events: mpsc::Sender<BrokerEvent>,
) {
    let start = Instant::now();
    let deadline = match phase {
        Phase::Preflight => model.preflight_deadline(),
        Phase::Full => model.full_deadline(),
    };

    let mut command = Command::new(&model.command);
    command.args(&model.args);
    if phase == Phase::Preflight {
        command.args(&model.preflight_extra_args);
    }
    command
        .arg(&prompt)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!("Failed to spawn model CLI for {} phase: {}", phase.as_str(), e);
            let _ = events
                .send(BrokerEvent::Terminal(InvocationOutcome {
                    phase,
                    status: PhaseStatus::Failed { exit_code: None },
                    stdout: String::new(),
                    stderr: format!("spawn failed: {}", e),
                    payload: None,
                    elapsed: start.elapsed(),
                }))
                .await;
            return;
        }
    };

    debug!("{} phase spawned, deadline {:?}", phase.as_str(), deadline);

    // Both pipes were requested above; take() cannot fail here.
    let mut stdout_lines = BufReader::new(child.stdout.take().expect("stdout piped")).lines();
    let mut stderr_lines = BufReader::new(child.stderr.take().expect("stderr piped")).lines();

    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();
    let mut payload: Option<StructuredPayload> = None;
    let mut stdout_open = true;
    let mut stderr_open = true;

    let timer = tokio::time::sleep(deadline);
    tokio::pin!(timer);

    let status = loop {
        tokio::select! {
            // Caller disconnect must reach the child within one loop tick.
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    let _ = child.kill().await;
                    break PhaseStatus::Aborted;
                }
            }
            _ = &mut timer => {
                let _ = child.kill().await;
                break PhaseStatus::TimedOut;
            }
            line = stdout_lines.next_line(), if stdout_open => {
                match line {
                    Ok(Some(line)) => {
                        append_capped(&mut stdout_buf, &line);
                        if payload.is_none() {
                            if let Some(found) = extract_structured_payload(&stdout_buf) {
                                payload = Some(found.clone());
                                let _ = events
                                    .send(BrokerEvent::Payload { phase, payload: found })
                                    .await;
                            }
                        } else {
                            let _ = events
                                .send(BrokerEvent::DetailLine { phase, line })
                                .await;
                        }
                    }
                    Ok(None) | Err(_) => stdout_open = false,
                }
            }
            line = stderr_lines.next_line(), if stderr_open => {
                match line {
                    Ok(Some(line)) => {
                        append_capped(&mut stderr_buf, &line);
                        let _ = events
                            .send(BrokerEvent::StderrLine { phase, line })
                            .await;
                    }
                    Ok(None) | Err(_) => stderr_open = false,
                }
            }
            exit = child.wait(), if !stdout_open && !stderr_open => {
                match exit {
                    Ok(status) if status.success() => break PhaseStatus::Completed,
                    Ok(status) => break PhaseStatus::Failed { exit_code: status.code() },
                    Err(e) => {
                        warn!("Wait failed for {} phase: {}", phase.as_str(), e);
                        break PhaseStatus::Failed { exit_code: None };
                    }
                }
            }
        }
    };

    let elapsed = start.elapsed();
    debug!(
        "{} phase terminal: {:?} after {:?} ({} stdout bytes)",
        phase.as_str(),
        status,
        elapsed,
        stdout_buf.len()
    );

    let _ = events
        .send(BrokerEvent::Terminal(InvocationOutcome {
            phase,
            status,
            stdout: stdout_buf,
            stderr: stderr_buf,
            payload,
            elapsed,
        }))
        .await;
}

fn append_capped(buffer: &mut String, line: &str) {
    if buffer.len() >= MAX_BUFFER_BYTES {
        return;
    }
    if !buffer.is_empty() {
        buffer.push('\n');
    }
    let remaining = MAX_BUFFER_BYTES - buffer.len();
    if line.len() <= remaining {
        buffer.push_str(line);
    } else {
        let mut cut = remaining;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        buffer.push_str(&line[..cut]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::config::ModelConfig;

    fn sh_model(script: &str, deadline_secs: u64) -> ModelConfig {
        ModelConfig {
            command: "/bin/sh".to_string(),
            // The prompt lands in $1 after "-c SCRIPT sh"; the scripts here
            // ignore it unless they echo "$1".
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            preflight_extra_args: vec![],
            system_instruction: "answer concisely".to_string(),
            full_deadline_secs: deadline_secs,
            preflight_deadline_secs: 1,
        }
    }

    async fn collect_until_terminal(
        mut rx: mpsc::Receiver<BrokerEvent>,
    ) -> (Vec<BrokerEvent>, InvocationOutcome) {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            if let BrokerEvent::Terminal(outcome) = event {
                return (seen, outcome);
            }
            seen.push(event);
        }
        panic!("channel closed without a terminal event");
    }

    #[tokio::test]
    async fn clean_exit_with_payload_completes() {
        let broker = ProcessBroker::new(sh_model(
            r#"echo '{"response": "The answer is 42.", "model": "stub"}'"#,
            5,
        ));
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(32);
        broker.spawn_invocation(Phase::Full, "question", cancel_rx, tx);

        let (events, outcome) = collect_until_terminal(rx).await;
        assert_eq!(outcome.status, PhaseStatus::Completed);
        let payload = outcome.payload.expect("payload recognized");
        assert_eq!(payload.response, "The answer is 42.");
        assert!(events
            .iter()
            .any(|e| matches!(e, BrokerEvent::Payload { .. })));
    }

    #[tokio::test]
    async fn output_after_payload_is_demoted_to_detail() {
        let broker = ProcessBroker::new(sh_model(
            r#"echo '{"response": "Primary."}'; echo 'supplementary context line'"#,
            5,
        ));
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(32);
        broker.spawn_invocation(Phase::Full, "q", cancel_rx, tx);

        let (events, outcome) = collect_until_terminal(rx).await;
        assert_eq!(outcome.status, PhaseStatus::Completed);
        assert!(events.iter().any(|e| matches!(
            e,
            BrokerEvent::DetailLine { line, .. } if line.contains("supplementary")
        )));
    }

    #[tokio::test]
    async fn deadline_kills_and_keeps_partial_buffer() {
        let broker = ProcessBroker::new(sh_model(
            r#"echo '{"response": "Partial but usable."}'; sleep 30"#,
            1,
        ));
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(32);
        broker.spawn_invocation(Phase::Full, "q", cancel_rx, tx);

        let (_events, outcome) = collect_until_terminal(rx).await;
        assert_eq!(outcome.status, PhaseStatus::TimedOut);
        // The partial buffer survived the kill and still parses.
        assert_eq!(
            outcome.payload.expect("partial payload").response,
            "Partial but usable."
        );
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_aborts_promptly() {
        let broker = ProcessBroker::new(sh_model("sleep 30", 60));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(32);
        broker.spawn_invocation(Phase::Full, "q", cancel_rx, tx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_tx.send(true).unwrap();

        let (_events, outcome) = collect_until_terminal(rx).await;
        assert_eq!(outcome.status, PhaseStatus::Aborted);
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_captured_stderr() {
        let broker = ProcessBroker::new(sh_model(
            "echo 'model blew up' >&2; exit 3",
            5,
        ));
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(32);
        broker.spawn_invocation(Phase::Full, "q", cancel_rx, tx);

        let (events, outcome) = collect_until_terminal(rx).await;
        assert_eq!(outcome.status, PhaseStatus::Failed { exit_code: Some(3) });
        assert!(outcome.stderr.contains("model blew up"));
        assert!(events
            .iter()
            .any(|e| matches!(e, BrokerEvent::StderrLine { .. })));
    }

    #[tokio::test]
    async fn missing_executable_fails_without_panicking() {
        let mut model = sh_model("true", 5);
        model.command = "/nonexistent/model-cli".to_string();
        let broker = ProcessBroker::new(model);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(32);
        broker.spawn_invocation(Phase::Full, "q", cancel_rx, tx);

        let (_events, outcome) = collect_until_terminal(rx).await;
        assert!(matches!(outcome.status, PhaseStatus::Failed { .. }));
        assert!(outcome.stderr.contains("spawn failed"));
    }

    #[test]
    fn append_capped_respects_the_limit() {
        let mut buffer = String::new();
        let line = "x".repeat(MAX_BUFFER_BYTES);
        append_capped(&mut buffer, &line);
        append_capped(&mut buffer, "overflow");
        assert_eq!(buffer.len(), MAX_BUFFER_BYTES);
    }
}
