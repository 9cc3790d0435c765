//! Node agent: submits a manifest to the engine and waits for it to settle.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::{Result, bail};
use skyward_engine::controller::Outcome;
use skyward_engine::{Engine, InstanceKey, ProvisioningState, ReconcileEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

use crate::manifest::Manifest;

/// What the agent waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Goal {
    Converge,
    Teardown,
}

impl Goal {
    fn reached(self, outcome: &Outcome) -> bool {
        match self {
            Goal::Converge => outcome.is_settled() && *outcome != Outcome::Deleted,
            Goal::Teardown => matches!(outcome, Outcome::Deleted | Outcome::Failed { .. }),
        }
    }

    /// Settled as far as the tracked state shows; `None` for untracked keys.
    fn reached_in_store(self, state: Option<ProvisioningState>) -> bool {
        match (self, state) {
            (Goal::Converge, Some(ProvisioningState::Ready | ProvisioningState::Failed)) => true,
            (Goal::Teardown, None | Some(ProvisioningState::Failed)) => true,
            _ => false,
        }
    }
}

/// Final tally of a run.
#[derive(Debug, Default)]
pub struct Summary {
    pub settled: BTreeMap<InstanceKey, Outcome>,
    pub unsettled: Vec<InstanceKey>,
    pub interrupted: bool,
}

impl Summary {
    pub fn failed(&self) -> usize {
        self.settled
            .values()
            .filter(|o| matches!(o, Outcome::Failed { .. }))
            .count()
    }

    pub fn is_success(&self) -> bool {
        !self.interrupted && self.unsettled.is_empty() && self.failed() == 0
    }

    fn log(&self, phase: &str) {
        for (key, outcome) in &self.settled {
            match outcome {
                Outcome::Failed { kind, message } => error!("{phase}: {key} failed ({kind}): {message}"),
                other => info!("{phase}: {key} {other:?}"),
            }
        }
        for key in &self.unsettled {
            warn!("{phase}: {key} did not settle");
        }
        info!(
            settled = self.settled.len(),
            failed = self.failed(),
            unsettled = self.unsettled.len(),
            "{phase} finished"
        );
    }
}

pub struct NodeAgent {
    engine: Engine,
    manifest: Manifest,
    settle_timeout: Duration,
}

impl NodeAgent {
    pub fn new(engine: Engine, manifest: Manifest, settle_timeout: Duration) -> Self {
        Self {
            engine,
            manifest,
            settle_timeout,
        }
    }

    /// Converge the manifest, then optionally tear it down again.
    pub async fn run(self, teardown: bool) -> Result<()> {
        let mut events = self.engine.subscribe();

        info!(resources = self.manifest.len(), "Submitting manifest");
        for (key, spec) in &self.manifest.entries {
            let generation = self.engine.submit(key.clone(), spec.clone());
            info!(key = %key, generation, "Submitted");
        }

        let summary = self.wait(&mut events, Goal::Converge).await;
        summary.log("Converge");
        let mut result = Self::verdict(&summary, "converge");

        if teardown && !summary.interrupted {
            info!("Tearing down");
            for key in self.manifest.keys() {
                self.engine.delete(&key);
            }
            let summary = self.wait(&mut events, Goal::Teardown).await;
            summary.log("Teardown");
            result = result.and(Self::verdict(&summary, "teardown"));
        }

        self.engine.shutdown().await;
        result
    }

    fn verdict(summary: &Summary, phase: &str) -> Result<()> {
        if summary.interrupted {
            bail!("{phase} interrupted");
        }
        if !summary.is_success() {
            bail!(
                "{phase} incomplete: {} failed, {} unsettled",
                summary.failed(),
                summary.unsettled.len()
            );
        }
        Ok(())
    }

    async fn wait(&self, events: &mut broadcast::Receiver<ReconcileEvent>, goal: Goal) -> Summary {
        let mut outstanding: HashSet<InstanceKey> = self.manifest.keys().into_iter().collect();
        let mut summary = Summary::default();
        let deadline = tokio::time::sleep(self.settle_timeout);
        tokio::pin!(deadline);

        while !outstanding.is_empty() {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if outstanding.contains(&event.key) && goal.reached(&event.outcome) {
                            outstanding.remove(&event.key);
                            summary.settled.insert(event.key, event.outcome);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Event stream lagged, rechecking tracked state");
                        self.recheck(goal, &mut outstanding, &mut summary);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = &mut deadline => {
                    warn!(timeout = ?self.settle_timeout, "Settle timeout reached");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT");
                    summary.interrupted = true;
                    break;
                }
            }
        }

        let mut unsettled: Vec<_> = outstanding.into_iter().collect();
        unsettled.sort();
        summary.unsettled = unsettled;
        summary
    }

    fn recheck(&self, goal: Goal, outstanding: &mut HashSet<InstanceKey>, summary: &mut Summary) {
        let store = self.engine.store();
        outstanding.retain(|key| {
            let status = store.status(key);
            if !goal.reached_in_store(status.as_ref().map(|s| s.state)) {
                return true;
            }
            let outcome = match status {
                None => Outcome::Deleted,
                Some(status) if status.state == ProvisioningState::Ready => Outcome::Ready,
                Some(status) => {
                    let (kind, message) = status
                        .last_error
                        .map(|e| (e.kind, e.message))
                        .unwrap_or((skyward_engine::ErrorKind::Fatal, "failed".to_string()));
                    Outcome::Failed { kind, message }
                }
            };
            summary.settled.insert(key.clone(), outcome);
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyward_engine::ErrorKind;

    #[test]
    fn converge_goal_ignores_requeues() {
        let requeue = Outcome::Requeue {
            after: Duration::from_secs(1),
            kind: ErrorKind::Transient,
            reason: "waiting".into(),
        };
        assert!(!Goal::Converge.reached(&requeue));
        assert!(Goal::Converge.reached(&Outcome::Ready));
        assert!(!Goal::Converge.reached(&Outcome::Deleted));
        assert!(Goal::Teardown.reached(&Outcome::Deleted));
        assert!(!Goal::Teardown.reached(&Outcome::Ready));
    }

    #[test]
    fn store_view_of_settled() {
        assert!(Goal::Converge.reached_in_store(Some(ProvisioningState::Ready)));
        assert!(!Goal::Converge.reached_in_store(Some(ProvisioningState::Creating)));
        assert!(!Goal::Converge.reached_in_store(None));
        assert!(Goal::Teardown.reached_in_store(None));
        assert!(!Goal::Teardown.reached_in_store(Some(ProvisioningState::Deleting)));
    }

    #[test]
    fn summary_success() {
        let mut summary = Summary::default();
        summary.settled.insert(
            InstanceKey::new(skyward_engine::ResourceKind::SqlServer, "s", "rg", "a"),
            Outcome::Ready,
        );
        assert!(summary.is_success());

        summary.settled.insert(
            InstanceKey::new(skyward_engine::ResourceKind::SqlServer, "s", "rg", "b"),
            Outcome::Failed {
                kind: ErrorKind::AlreadyExists,
                message: "taken".into(),
            },
        );
        assert_eq!(summary.failed(), 1);
        assert!(!summary.is_success());
    }
}
