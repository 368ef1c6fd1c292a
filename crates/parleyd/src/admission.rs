//! Admission controller.
//!
//! Tracks global and per-caller in-flight invocation counts plus a per-caller
//! sliding-window request ledger. `try_acquire` never waits: a caller over any
//! limit is told immediately (the 429 path) instead of being queued, because
//! queued model invocations grow memory without bound under load spikes.
//!
//! All counter mutation goes through `try_acquire` and the ticket's Drop -
//! no call site touches the counts directly, and the RAII guard makes the
//! release exactly-once on every exit path including cancellation.

use parley_common::config::LimitsConfig;
use parley_common::error::{CapacityScope, Denial};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct AdmissionState {
    global_active: usize,
    per_caller_active: HashMap<String, usize>,
    request_log: HashMap<String, Vec<Instant>>,
}

/// Shared admission state. One instance per daemon.
#[derive(Debug)]
pub struct AdmissionController {
    limits: LimitsConfig,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub fn new(limits: LimitsConfig) -> Arc<Self> {
        Arc::new(Self {
            limits,
            state: Mutex::new(AdmissionState::default()),
        })
    }

    /// Grant or deny permission to start one subprocess invocation.
    /// Rate check runs first, then capacity; neither ever blocks.
    pub fn try_acquire(self: &Arc<Self>, caller_id: &str) -> Result<AdmissionTicket, Denial> {
        let now = Instant::now();
        let window = self.limits.rate_window();
        let mut state = self.state.lock().expect("admission lock poisoned");

        // Sliding window, pruned lazily on each check.
        let log = state.request_log.entry(caller_id.to_string()).or_default();
        log.retain(|&ts| now.duration_since(ts) < window);

        if log.len() >= self.limits.rate_max_requests {
            let oldest = log.first().copied().unwrap_or(now);
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            warn!(
                "Rate limit exceeded for caller {} ({}/{} in window)",
                caller_id,
                log.len(),
                self.limits.rate_max_requests
            );
            return Err(Denial::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        // The attempt counts toward the window whether or not capacity is
        // available: the ledger tracks request rate, not successes.
        log.push(now);

        if state.global_active >= self.limits.global_max_active {
            warn!(
                "Global capacity exhausted ({} active), denying caller {}",
                state.global_active, caller_id
            );
            return Err(Denial::CapacityExceeded {
                scope: CapacityScope::Global,
            });
        }

        let caller_active = state
            .per_caller_active
            .get(caller_id)
            .copied()
            .unwrap_or(0);
        if caller_active >= self.limits.per_caller_max_active {
            warn!(
                "Per-caller capacity exhausted for {} ({} active)",
                caller_id, caller_active
            );
            return Err(Denial::CapacityExceeded {
                scope: CapacityScope::PerCaller,
            });
        }

        state.global_active += 1;
        *state
            .per_caller_active
            .entry(caller_id.to_string())
            .or_insert(0) += 1;

        debug!(
            "Admitted caller {} ({} active globally)",
            caller_id, state.global_active
        );

        Ok(AdmissionTicket {
            controller: Arc::clone(self),
            caller_id: caller_id.to_string(),
            acquired_at: now,
            released: AtomicBool::new(false),
        })
    }

    /// Exactly-once decrement, floored at zero. Only the ticket calls this.
    fn release(&self, caller_id: &str) {
        let mut state = self.state.lock().expect("admission lock poisoned");
        state.global_active = state.global_active.saturating_sub(1);
        match state.per_caller_active.get_mut(caller_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.per_caller_active.remove(caller_id);
            }
            None => {}
        }
        debug!(
            "Released ticket for {} ({} active globally)",
            caller_id, state.global_active
        );
    }

    /// Current global in-flight count.
    pub fn global_active(&self) -> usize {
        self.state.lock().expect("admission lock poisoned").global_active
    }

    /// Drop rate-ledger entries for callers with nothing inside the window.
    /// Call periodically; per-caller pruning otherwise happens lazily.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.limits.rate_window();
        let mut state = self.state.lock().expect("admission lock poisoned");
        state.request_log.retain(|_, log| {
            log.retain(|&ts| now.duration_since(ts) < window);
            !log.is_empty()
        });
    }
}

/// Capacity held for the duration of one subprocess invocation. Released
/// exactly once - on Drop - whichever way the invocation ends (success,
/// failure, timeout, or cancellation).
#[derive(Debug)]
pub struct AdmissionTicket {
    controller: Arc<AdmissionController>,
    caller_id: String,
    acquired_at: Instant,
    released: AtomicBool,
}

impl AdmissionTicket {
    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.controller.release(&self.caller_id);
        }
    }
}
