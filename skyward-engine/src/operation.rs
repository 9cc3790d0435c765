//! Long-running operation tracking.
//!
//! A mutating remote call hands back an [`OperationHandle`]. The
//! [`OperationTracker`] polls it until it is terminal:
//!
//! ```text
//! Issued -> Polling -> Succeeded
//!                   -> Failed
//! ```
//!
//! Polling never spins: each round sleeps for the server hint or the
//! current interval, which doubles up to `max_interval`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use crate::cancel::Cancellation;
use crate::error::{ClassifiedError, ErrorKind, RemoteFailure, classify};
use crate::remote::ControlPlane;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationVerb {
    Put,
    Delete,
}

/// How the channel follows up on an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollTarget {
    /// Nothing to poll; the call completed synchronously.
    None,
    /// Operation status URL (`Azure-AsyncOperation`).
    AsyncOperation(String),
    /// Location URL answering 202 until done.
    Location(String),
    /// Poll the resource itself for its provisioning state.
    Resource,
    /// Channel-private token.
    Opaque(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Issued,
    Polling,
    Succeeded,
    Failed(ClassifiedError),
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed(_))
    }
}

/// Token for an in-flight remote mutation.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub verb: OperationVerb,
    /// Path of the resource being mutated.
    pub resource_path: String,
    pub api_version: String,
    pub target: PollTarget,
    pub issued_at: DateTime<Utc>,
    state: OperationState,
}

impl OperationHandle {
    pub fn issued(
        verb: OperationVerb,
        resource_path: impl Into<String>,
        api_version: impl Into<String>,
        target: PollTarget,
    ) -> Self {
        Self {
            verb,
            resource_path: resource_path.into(),
            api_version: api_version.into(),
            target,
            issued_at: Utc::now(),
            state: OperationState::Issued,
        }
    }

    /// A handle for a call that finished synchronously.
    pub fn completed(
        verb: OperationVerb,
        resource_path: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        let mut handle = Self::issued(verb, resource_path, api_version, PollTarget::None);
        handle.state = OperationState::Succeeded;
        handle
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }
}

/// Result of one poll round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    InProgress { retry_after: Option<Duration> },
    Succeeded,
    Failed(RemoteFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    /// Overall budget for one `await_completion` call.
    pub timeout: Duration,
}

/// Drives operation handles to a terminal state.
#[derive(Clone)]
pub struct OperationTracker {
    channel: Arc<dyn ControlPlane>,
    policy: PollPolicy,
}

impl OperationTracker {
    pub fn new(channel: Arc<dyn ControlPlane>, policy: PollPolicy) -> Self {
        Self { channel, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Block until `handle` is terminal, the budget runs out, or the pass is
    /// cancelled. Timeout and cancellation surface as `Transient`.
    pub async fn await_completion(
        &self,
        handle: &mut OperationHandle,
        cancel: &Cancellation,
    ) -> Result<(), ClassifiedError> {
        match &handle.state {
            OperationState::Succeeded => return Ok(()),
            OperationState::Failed(err) => return Err(err.clone()),
            OperationState::Issued | OperationState::Polling => {}
        }

        handle.state = OperationState::Polling;
        let deadline = Instant::now() + self.policy.timeout;
        let mut interval = self.policy.interval;
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            let polled = cancel
                .run(tokio::time::timeout_at(deadline, self.channel.poll(handle)))
                .await;
            let hint = match polled {
                None => return Err(ClassifiedError::cancelled()),
                Some(Err(_elapsed)) => return Err(self.overdue(handle)),
                Some(Ok(Ok(PollStatus::Succeeded))) => {
                    debug!(
                        path = %handle.resource_path,
                        rounds,
                        "Operation {:?} succeeded",
                        handle.verb
                    );
                    handle.state = OperationState::Succeeded;
                    return Ok(());
                }
                Some(Ok(Ok(PollStatus::Failed(failure)))) => {
                    let err = classify(&failure);
                    handle.state = OperationState::Failed(err.clone());
                    return Err(err);
                }
                Some(Ok(Ok(PollStatus::InProgress { retry_after }))) => retry_after,
                Some(Ok(Err(failure))) => {
                    let err = classify(&failure);
                    // A hiccup on the status endpoint says nothing about the
                    // operation itself; keep polling within the budget.
                    if !matches!(err.kind, ErrorKind::Transient | ErrorKind::Throttled) {
                        handle.state = OperationState::Failed(err.clone());
                        return Err(err);
                    }
                    debug!(path = %handle.resource_path, error = %err, "Poll failed, retrying");
                    err.retry_after
                }
            };

            let delay = hint
                .map(|d| d.min(self.policy.max_interval))
                .unwrap_or(interval);
            if Instant::now() + delay > deadline {
                return Err(self.overdue(handle));
            }
            debug!(path = %handle.resource_path, rounds, ?delay, "Operation still in progress");
            if !cancel.sleep(delay).await {
                return Err(ClassifiedError::cancelled());
            }
            interval = (interval * 2).min(self.policy.max_interval);
        }
    }

    fn overdue(&self, handle: &OperationHandle) -> ClassifiedError {
        ClassifiedError::transient(format!(
            "operation on {} did not finish within {:?}",
            handle.resource_path, self.policy.timeout
        ))
    }
}
