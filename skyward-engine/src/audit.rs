//! Audit trail of state transitions.
//!
//! Events go to the `audit` tracing target so a subscriber can route them
//! separately from diagnostic logs.

use tracing::{info, warn};

use crate::model::{InstanceKey, ProvisioningState, StatusError};

/// Audit logger for reconciliation passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLog;

impl AuditLog {
    pub fn new() -> Self {
        Self
    }

    pub fn transition(&self, key: &InstanceKey, from: ProvisioningState, to: ProvisioningState) {
        if from != to {
            info!(target: "audit", key = %key, %from, %to, "State changed: {key} {from} -> {to}");
        }
    }

    pub fn provisioned(&self, key: &InstanceKey, remote_id: &str) {
        info!(target: "audit", key = %key, remote_id, "Provisioned: {key}");
    }

    pub fn deleted(&self, key: &InstanceKey) {
        info!(target: "audit", key = %key, "Deleted: {key}");
    }

    pub fn failed(&self, key: &InstanceKey, error: &StatusError) {
        warn!(target: "audit", key = %key, kind = %error.kind, "Failed: {key}: {}", error.message);
    }

    pub fn deletion_blocked(&self, key: &InstanceKey, dependents: usize) {
        info!(target: "audit", key = %key, dependents, "Deletion blocked: {key} still has {dependents} dependent(s)");
    }
}
