//! Retry scheduling for verification runs
//!
//! Re-invokes the orchestrator on tokio timers until it finishes. A second
//! caller for a handle that is already being driven gets `AlreadyActive`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::engine::updater::orchestrator::{AttemptOutcome, Orchestrator, Verdict};
use crate::engine::updater::state::VerifyPhase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Finished(Verdict),
    /// Gave up after this many attempts without a terminal transport status
    Exhausted { attempts: u32 },
    AlreadyActive,
}

pub struct RetryScheduler {
    orchestrator: Arc<Orchestrator>,
    active: Arc<Mutex<HashSet<String>>>,
    max_attempts: Option<u32>,
}

struct ActiveSlot {
    active: Arc<Mutex<HashSet<String>>>,
    handle: String,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.handle);
        }
    }
}

impl RetryScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            active: Arc::new(Mutex::new(HashSet::new())),
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn is_active(&self, handle: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains(handle))
            .unwrap_or(false)
    }

    fn claim(&self, handle: &str) -> Option<ActiveSlot> {
        let mut active = self.active.lock().ok()?;
        if !active.insert(handle.to_string()) {
            return None;
        }
        Some(ActiveSlot {
            active: Arc::clone(&self.active),
            handle: handle.to_string(),
        })
    }

    fn mark_exhausted(&self, handle: &str) {
        let recorded = self.orchestrator.records().update_verification(handle, |s| {
            s.phase = VerifyPhase::TerminalFailure;
            s.outcome = Some("retries_exhausted".to_string());
        });
        if let Err(e) = recorded {
            tracing::warn!(handle, error = %e, "Failed to record exhausted retries");
        }
    }

    /// Drive `handle` to a verdict.
    pub async fn run(&self, handle: &str) -> ScheduleOutcome {
        let Some(_slot) = self.claim(handle) else {
            tracing::debug!(handle, "Verification already scheduled");
            return ScheduleOutcome::AlreadyActive;
        };

        let mut attempt = 0;
        loop {
            match self.orchestrator.run_attempt(handle, attempt).await {
                AttemptOutcome::Finished(verdict) => return ScheduleOutcome::Finished(verdict),
                AttemptOutcome::Retry { attempt: next, delay } => {
                    if self.max_attempts.is_some_and(|max| next >= max) {
                        tracing::warn!(handle, attempts = next, "Verification retries exhausted");
                        self.mark_exhausted(handle);
                        return ScheduleOutcome::Exhausted { attempts: next };
                    }
                    tracing::debug!(handle, attempt = next, delay_ms = delay.as_millis() as u64, "Scheduling retry");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
            }
        }
    }
}
