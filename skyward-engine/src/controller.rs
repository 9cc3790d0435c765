//! Convergence controller.
//!
//! One [`reconcile`](ConvergenceController::reconcile) call is one pass for
//! one instance:
//!
//! ```text
//! deletion requested:  dependents? -> Delete -> Get (confirm absent) -> Deleted
//! otherwise:           stored failure? -> dependencies ready? -> CreateOrUpdate -> Ready
//! ```
//!
//! Every pass ends in exactly one [`Outcome`] and, unless it was cancelled or
//! the instance is no longer tracked, exactly one [`StatusSink::commit`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::backoff::Backoff;
use crate::cancel::Cancellation;
use crate::config::EngineConfig;
use crate::error::{ClassifiedError, ErrorKind};
use crate::manager::{DesiredAttributes, GroupRef, ManagerRegistry, ResourceManager};
use crate::model::{InstanceKey, ProvisioningState, ResourceInstance, ResourceStatus, StatusError};
use crate::resolver::{DependencyResolver, InstanceLookup};

/// Final status of a pass, handed to the status sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDelta {
    pub key: InstanceKey,
    pub status: ResourceStatus,
    /// The remote resource is confirmed gone; stop tracking the instance.
    pub forget: bool,
}

/// Receives the status write of every committed pass.
pub trait StatusSink: Send + Sync {
    fn commit(&self, delta: StatusDelta);
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    /// Try again after `after`.
    Requeue {
        after: Duration,
        kind: ErrorKind,
        reason: String,
    },
    /// Terminal until the spec changes.
    Failed { kind: ErrorKind, message: String },
    Deleted,
}

impl Outcome {
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Outcome::Requeue { after, .. } => Some(*after),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, Outcome::Requeue { .. })
    }
}

enum Pass {
    Commit { outcome: Outcome, forget: bool },
    /// Cancelled: status stays as it was.
    Abandon(Outcome),
}

impl Pass {
    fn keep(outcome: Outcome) -> Self {
        Pass::Commit {
            outcome,
            forget: false,
        }
    }
}

/// Names held by someone else were never ours to delete.
fn name_owned_elsewhere(status: &ResourceStatus) -> bool {
    status.remote_id.is_none()
        && status.last_error.as_ref().is_some_and(|e| {
            matches!(e.kind, ErrorKind::AlreadyExists | ErrorKind::InvalidName)
        })
}

pub struct ConvergenceController {
    managers: ManagerRegistry,
    lookup: Arc<dyn InstanceLookup>,
    resolver: DependencyResolver,
    sink: Arc<dyn StatusSink>,
    backoff: Backoff,
    max_retries: u32,
    audit: AuditLog,
    /// Per-instance pass serialization.
    passes: Mutex<HashMap<InstanceKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConvergenceController {
    pub fn new(
        config: &EngineConfig,
        managers: ManagerRegistry,
        lookup: Arc<dyn InstanceLookup>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            managers,
            resolver: DependencyResolver::new(lookup.clone()),
            lookup,
            sink,
            backoff: config.backoff(),
            max_retries: config.max_retries,
            audit: AuditLog::new(),
            passes: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    fn pass_lock(&self, key: &InstanceKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut passes = self.passes.lock().unwrap_or_else(|e| e.into_inner());
        passes.entry(key.clone()).or_default().clone()
    }

    /// Drop the pass lock of `key` unless another pass is waiting on it.
    /// Called while the caller still holds the guard, so an uncontended
    /// entry is referenced exactly twice: by the table and by that guard.
    fn release(&self, key: &InstanceKey) {
        let mut passes = self.passes.lock().unwrap_or_else(|e| e.into_inner());
        if passes.get(key).is_some_and(|lock| Arc::strong_count(lock) <= 2) {
            passes.remove(key);
        }
    }

    /// Number of instances with a pass lock in the table.
    pub fn pass_locks(&self) -> usize {
        self.passes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run one pass for `instance`. Passes for the same instance are
    /// serialized; a pass that waited for another works from the status the
    /// earlier one committed.
    pub async fn reconcile(&self, instance: &ResourceInstance, cancel: &Cancellation) -> Outcome {
        let lock = self.pass_lock(&instance.key);
        let _guard = match cancel.run(lock.lock_owned()).await {
            Some(guard) => guard,
            None => return self.cancelled(&instance.key),
        };

        // An instance the store no longer knows was deleted and forgotten;
        // acting on the caller's copy would recreate it remotely.
        let current = match self.lookup.lookup(&instance.key) {
            Some(current) => current,
            None => {
                debug!(key = %instance.key, "Instance no longer tracked, skipping pass");
                self.release(&instance.key);
                return Outcome::Deleted;
            }
        };
        let mut status = current.status.clone();
        let from = status.state;

        let pass = match self.managers.get(current.key.kind) {
            None => self.fail(
                &mut status,
                ClassifiedError::fatal(format!(
                    "no resource manager for kind {}",
                    current.key.kind
                )),
            ),
            Some(manager) if current.deletion_requested => {
                self.converge_absent(&current, manager.as_ref(), &mut status, cancel)
                    .await
            }
            Some(manager) => {
                self.converge_present(&current, manager.as_ref(), &mut status, cancel)
                    .await
            }
        };

        let outcome = match pass {
            Pass::Abandon(outcome) => outcome,
            Pass::Commit { outcome, forget } => {
                status.last_reconciled = Some(Utc::now());
                status.observed_generation = current.spec.generation;
                self.report(&current.key, from, &status, &outcome);
                self.sink.commit(StatusDelta {
                    key: current.key.clone(),
                    status,
                    forget,
                });
                outcome
            }
        };
        self.release(&current.key);
        outcome
    }

    async fn converge_present(
        &self,
        instance: &ResourceInstance,
        manager: &dyn ResourceManager,
        status: &mut ResourceStatus,
        cancel: &Cancellation,
    ) -> Pass {
        if instance.spec_changed() {
            if status.state == ProvisioningState::Failed {
                debug!(key = %instance.key, "Spec changed, retrying failed instance");
                status.state = ProvisioningState::Pending;
            }
            status.last_error = None;
            status.retries = 0;
        } else if status.state == ProvisioningState::Failed {
            let (kind, message) = match &status.last_error {
                Some(err) => (err.kind, err.message.clone()),
                None => (ErrorKind::Fatal, "failed".to_string()),
            };
            return Pass::keep(Outcome::Failed { kind, message });
        }

        let resolution = self.resolver.resolve(instance);
        if !resolution.is_satisfied() {
            let reason = resolution.describe();
            status.message = Some(reason.clone());
            return Pass::keep(Outcome::Requeue {
                after: self.backoff.base(),
                kind: ErrorKind::Transient,
                reason,
            });
        }

        if status.state != ProvisioningState::Ready {
            status.state = ProvisioningState::Creating;
        }
        status.message = None;

        let group = GroupRef::for_instance(instance);
        let desired = DesiredAttributes::new(instance.spec.attributes.clone())
            .with_resolved(resolution.resolved_ids());
        let force_update = status.remote_id.is_some();

        let remote = match manager
            .create_or_update(&group, &instance.key.name, &desired, force_update, cancel)
            .await
        {
            Ok(remote) => remote,
            Err(err) => return self.on_error(status, err, cancel),
        };

        let known = status.remote_id.as_deref();
        if let Some(known) = known.filter(|known| *known != remote.id) {
            let err = ClassifiedError::fatal(format!(
                "remote identity changed from {known} to {}",
                remote.id
            ));
            return self.fail(status, err);
        }

        if status.remote_id.is_none() {
            self.audit.provisioned(&instance.key, &remote.id);
        }
        status.remote_id = Some(remote.id);
        status.state = ProvisioningState::Ready;
        status.last_error = None;
        status.retries = 0;
        Pass::keep(Outcome::Ready)
    }

    async fn converge_absent(
        &self,
        instance: &ResourceInstance,
        manager: &dyn ResourceManager,
        status: &mut ResourceStatus,
        cancel: &Cancellation,
    ) -> Pass {
        let dependents = self.resolver.dependents_of(&instance.key);
        if !dependents.is_empty() {
            let names: Vec<String> = dependents.iter().map(ToString::to_string).collect();
            let err =
                ClassifiedError::conflict(format!("still referenced by {}", names.join(", ")));
            self.audit.deletion_blocked(&instance.key, dependents.len());
            status.message = Some(err.message.clone());
            status.last_error = Some(StatusError::from(&err));
            return Pass::keep(Outcome::Requeue {
                after: self.backoff.base(),
                kind: err.kind,
                reason: err.message,
            });
        }

        if name_owned_elsewhere(status) {
            info!(key = %instance.key, "Never provisioned, nothing to delete remotely");
            status.state = ProvisioningState::Deleted;
            return Pass::Commit {
                outcome: Outcome::Deleted,
                forget: true,
            };
        }

        status.state = ProvisioningState::Deleting;
        status.message = None;
        let group = GroupRef::for_instance(instance);
        let name = &instance.key.name;

        if let Err(err) = manager.delete(&group, name, cancel).await {
            return self.on_error(status, err, cancel);
        }

        match manager.get(&group, name, cancel).await {
            Err(err) if err.is_not_found() => {
                status.state = ProvisioningState::Deleted;
                status.last_error = None;
                status.retries = 0;
                Pass::Commit {
                    outcome: Outcome::Deleted,
                    forget: true,
                }
            }
            Ok(_) => self.on_error(
                status,
                ClassifiedError::transient("deletion not yet observed"),
                cancel,
            ),
            Err(err) => self.on_error(status, err, cancel),
        }
    }

    fn cancelled(&self, key: &InstanceKey) -> Outcome {
        info!(key = %key, "Pass cancelled, status left unchanged");
        let err = ClassifiedError::cancelled();
        Outcome::Requeue {
            after: self.backoff.base(),
            kind: err.kind,
            reason: err.message,
        }
    }

    /// Interpret a classified failure for the current pass.
    fn on_error(
        &self,
        status: &mut ResourceStatus,
        err: ClassifiedError,
        cancel: &Cancellation,
    ) -> Pass {
        if cancel.is_cancelled() {
            let err = ClassifiedError::cancelled();
            return Pass::Abandon(Outcome::Requeue {
                after: self.backoff.base(),
                kind: err.kind,
                reason: err.message,
            });
        }

        match err.kind {
            ErrorKind::NotFound | ErrorKind::Transient => {
                let after = err.suggested_backoff(&self.backoff, status.retries);
                status.last_error = Some(StatusError::from(&err));
                Pass::keep(Outcome::Requeue {
                    after,
                    kind: err.kind,
                    reason: err.message,
                })
            }
            ErrorKind::Conflict | ErrorKind::Throttled => {
                status.retries += 1;
                if status.retries > self.max_retries {
                    let err = ClassifiedError::fatal(format!(
                        "retry limit exceeded after {} attempts: {}",
                        status.retries, err
                    ));
                    return self.fail(status, err);
                }
                let after = err.suggested_backoff(&self.backoff, status.retries - 1);
                status.last_error = Some(StatusError::from(&err));
                Pass::keep(Outcome::Requeue {
                    after,
                    kind: err.kind,
                    reason: err.message,
                })
            }
            ErrorKind::AlreadyExists | ErrorKind::InvalidName | ErrorKind::Fatal => {
                self.fail(status, err)
            }
        }
    }

    fn fail(&self, status: &mut ResourceStatus, err: ClassifiedError) -> Pass {
        status.state = ProvisioningState::Failed;
        status.last_error = Some(StatusError::from(&err));
        Pass::keep(Outcome::Failed {
            kind: err.kind,
            message: err.message,
        })
    }

    fn report(
        &self,
        key: &InstanceKey,
        from: ProvisioningState,
        status: &ResourceStatus,
        outcome: &Outcome,
    ) {
        self.audit.transition(key, from, status.state);
        match outcome {
            Outcome::Ready => info!(key = %key, remote_id = ?status.remote_id, "Instance ready"),
            Outcome::Deleted => {
                self.audit.deleted(key);
                info!(key = %key, "Instance deleted");
            }
            Outcome::Requeue {
                after,
                kind,
                reason,
            } => {
                if status.message.as_deref() == Some(reason.as_str()) {
                    info!(key = %key, ?after, "{reason}");
                } else {
                    warn!(key = %key, %kind, ?after, "Requeueing: {reason}");
                }
            }
            Outcome::Failed { kind, message } => {
                let fresh = status
                    .last_error
                    .as_ref()
                    .filter(|_| from != ProvisioningState::Failed);
                if let Some(last_error) = fresh {
                    self.audit.failed(key, last_error);
                }
                error!(key = %key, %kind, "Reconciliation failed: {message}");
            }
        }
    }
}
