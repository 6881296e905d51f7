use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ExternalLedger, LedgerSubmission, SubmitError};

/// How the recording ledger answers one submission.
#[derive(Debug, Clone)]
pub enum Behavior {
    Accept,
    /// Accept after sleeping.
    AcceptAfter(Duration),
    Fail(SubmitError),
    /// Record the move as accepted but report `SubmitError` (a lost ack).
    AcceptThenFail(SubmitError),
    /// Never answer; the caller's timeout decides.
    Hang,
}

#[derive(Debug)]
struct State {
    script: VecDeque<Behavior>,
    fallback: Behavior,
    attempts: Vec<LedgerSubmission>,
    accepted: Vec<LedgerSubmission>,
    keys: HashSet<String>,
    duplicates: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-memory external ledger.
///
/// Intended for tests/dev. Accepted moves are deduplicated by idempotency
/// key, the way the real service treats a resubmission: a duplicate is
/// acknowledged and counted but not recorded twice.
#[derive(Debug)]
pub struct RecordingLedger {
    state: Mutex<State>,
}

impl Default for RecordingLedger {
    fn default() -> Self {
        Self::always(Behavior::Accept)
    }
}

impl RecordingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger answering every submission with `behavior`.
    pub fn always(behavior: Behavior) -> Self {
        Self {
            state: Mutex::new(State {
                script: VecDeque::new(),
                fallback: behavior,
                attempts: Vec::new(),
                accepted: Vec::new(),
                keys: HashSet::new(),
                duplicates: 0,
                in_flight: 0,
                max_in_flight: 0,
            }),
        }
    }

    /// Queue a one-shot answer, used before the fallback.
    pub fn push(&self, behavior: Behavior) {
        if let Ok(mut state) = self.state.lock() {
            state.script.push_back(behavior);
        }
    }

    /// Replace the answer used once the script is exhausted.
    pub fn set_fallback(&self, behavior: Behavior) {
        if let Ok(mut state) = self.state.lock() {
            state.fallback = behavior;
        }
    }

    /// Every submission received, in arrival order.
    pub fn attempts(&self) -> Vec<LedgerSubmission> {
        self.state.lock().map(|s| s.attempts.clone()).unwrap_or_default()
    }

    /// Distinct moves accepted, in acceptance order.
    pub fn accepted(&self) -> Vec<LedgerSubmission> {
        self.state.lock().map(|s| s.accepted.clone()).unwrap_or_default()
    }

    /// Accepted resubmissions of an already accepted move.
    pub fn duplicates(&self) -> usize {
        self.state.lock().map(|s| s.duplicates).unwrap_or(0)
    }

    /// Highest number of submissions observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().map(|s| s.max_in_flight).unwrap_or(0)
    }

    fn begin(&self, submission: &LedgerSubmission) -> Behavior {
        let Ok(mut state) = self.state.lock() else {
            return Behavior::Fail(SubmitError::Transport("recording ledger poisoned".into()));
        };
        state.attempts.push(submission.clone());
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        match state.script.pop_front() {
            Some(behavior) => behavior,
            None => state.fallback.clone(),
        }
    }

    fn finish(&self, submission: &LedgerSubmission, accepted: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.in_flight = state.in_flight.saturating_sub(1);
            if accepted {
                if state.keys.insert(submission.idempotency_key()) {
                    state.accepted.push(submission.clone());
                } else {
                    state.duplicates += 1;
                }
            }
        }
    }
}

/// Decrements the in-flight count if the submission future is dropped
/// (e.g. by a caller timeout) before it finishes.
struct InFlight<'a> {
    ledger: &'a RecordingLedger,
    submission: &'a LedgerSubmission,
    done: bool,
}

impl InFlight<'_> {
    fn complete(mut self, accepted: bool) {
        self.done = true;
        self.ledger.finish(self.submission, accepted);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.ledger.finish(self.submission, false);
        }
    }
}

#[async_trait]
impl ExternalLedger for RecordingLedger {
    async fn submit(&self, submission: &LedgerSubmission) -> Result<(), SubmitError> {
        let behavior = self.begin(submission);
        let guard = InFlight {
            ledger: self,
            submission,
            done: false,
        };

        match behavior {
            Behavior::Accept => {
                guard.complete(true);
                Ok(())
            }
            Behavior::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                guard.complete(true);
                Ok(())
            }
            Behavior::Fail(err) => {
                guard.complete(false);
                Err(err)
            }
            Behavior::AcceptThenFail(err) => {
                guard.complete(true);
                Err(err)
            }
            Behavior::Hang => {
                std::future::pending::<()>().await;
                guard.complete(false);
                Err(SubmitError::Transport("unreachable".into()))
            }
        }
    }
}
