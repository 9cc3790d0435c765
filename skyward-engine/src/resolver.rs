//! Dependency resolution against tracked state.
//!
//! The resolver never talks to the remote; it only reads what the tracking
//! store knows about other instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{DependencyReference, InstanceKey, ProvisioningState, ResourceInstance};

/// Read-only view of tracked instances.
pub trait InstanceLookup: Send + Sync {
    fn lookup(&self, key: &InstanceKey) -> Option<ResourceInstance>;

    /// Tracked instances holding a reference to `key`.
    fn referencing(&self, key: &InstanceKey) -> Vec<ResourceInstance>;
}

/// Readiness of an instance's references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Ready references with the target's remote id.
    pub ready: Vec<(DependencyReference, String)>,
    /// Tracked but not (yet) Ready.
    pub pending: Vec<DependencyReference>,
    /// Not tracked at all.
    pub missing: Vec<DependencyReference>,
}

impl Resolution {
    pub fn is_satisfied(&self) -> bool {
        self.pending.is_empty() && self.missing.is_empty()
    }

    /// Reference name to remote id, for ready references.
    pub fn resolved_ids(&self) -> BTreeMap<String, String> {
        self.ready
            .iter()
            .map(|(reference, id)| (reference.name.clone(), id.clone()))
            .collect()
    }

    /// Human-readable summary of what is still outstanding.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        for reference in &self.pending {
            parts.push(format!("{} {} not ready", reference.name, reference.target));
        }
        for reference in &self.missing {
            parts.push(format!("{} {} not found", reference.name, reference.target));
        }
        if parts.is_empty() {
            "all dependencies ready".to_string()
        } else {
            format!("waiting on dependency: {}", parts.join(", "))
        }
    }
}

#[derive(Clone)]
pub struct DependencyResolver {
    lookup: Arc<dyn InstanceLookup>,
}

impl DependencyResolver {
    pub fn new(lookup: Arc<dyn InstanceLookup>) -> Self {
        Self { lookup }
    }

    pub fn resolve(&self, instance: &ResourceInstance) -> Resolution {
        let mut resolution = Resolution::default();
        for reference in &instance.spec.references {
            match self.lookup.lookup(&reference.target) {
                None => resolution.missing.push(reference.clone()),
                Some(target) if target.is_ready() && !target.deletion_requested => {
                    let id = target.status.remote_id.unwrap_or_default();
                    resolution.ready.push((reference.clone(), id));
                }
                Some(_) => resolution.pending.push(reference.clone()),
            }
        }
        resolution
    }

    /// Instances that still reference `key` and have not reached Deleted.
    pub fn dependents_of(&self, key: &InstanceKey) -> Vec<InstanceKey> {
        self.lookup
            .referencing(key)
            .into_iter()
            .filter(|dependent| {
                dependent.key != *key && dependent.status.state != ProvisioningState::Deleted
            })
            .map(|dependent| dependent.key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DesiredSpec, ResourceKind, SERVER_REFERENCE};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Fixed(HashMap<InstanceKey, ResourceInstance>);

    impl InstanceLookup for Fixed {
        fn lookup(&self, key: &InstanceKey) -> Option<ResourceInstance> {
            self.0.get(key).cloned()
        }

        fn referencing(&self, key: &InstanceKey) -> Vec<ResourceInstance> {
            self.0
                .values()
                .filter(|i| i.spec.references.iter().any(|r| &r.target == key))
                .cloned()
                .collect()
        }
    }

    fn server() -> InstanceKey {
        InstanceKey::new(ResourceKind::SqlServer, "sub", "rg", "s1")
    }

    fn database() -> ResourceInstance {
        ResourceInstance::new(
            InstanceKey::new(ResourceKind::SqlDatabase, "sub", "rg", "d1"),
            DesiredSpec::new().reference(SERVER_REFERENCE, server()),
        )
    }

    fn resolver(instances: Vec<ResourceInstance>) -> DependencyResolver {
        let map = instances.into_iter().map(|i| (i.key.clone(), i)).collect();
        DependencyResolver::new(Arc::new(Fixed(map)))
    }

    #[test]
    fn untracked_reference_is_missing() {
        let resolution = resolver(vec![]).resolve(&database());
        assert!(!resolution.is_satisfied());
        assert_eq!(resolution.missing.len(), 1);
        assert!(resolution.describe().contains("not found"));
    }

    #[test]
    fn ready_requires_remote_id() {
        let mut s1 = ResourceInstance::new(server(), DesiredSpec::new());
        s1.status.state = ProvisioningState::Ready;
        let resolution = resolver(vec![s1.clone()]).resolve(&database());
        assert_eq!(resolution.pending.len(), 1);

        s1.status.remote_id = Some("/subscriptions/sub/s1".into());
        let resolution = resolver(vec![s1]).resolve(&database());
        assert!(resolution.is_satisfied());
        assert_eq!(
            resolution.resolved_ids().get(SERVER_REFERENCE).map(String::as_str),
            Some("/subscriptions/sub/s1")
        );
    }

    #[test]
    fn dependents_exclude_deleted() {
        let s1 = ResourceInstance::new(server(), DesiredSpec::new());
        let mut d1 = database();
        let resolver_live = resolver(vec![s1.clone(), d1.clone()]);
        assert_eq!(resolver_live.dependents_of(&server()), vec![d1.key.clone()]);

        d1.status.state = ProvisioningState::Deleted;
        assert!(resolver(vec![s1, d1]).dependents_of(&server()).is_empty());
    }
}
