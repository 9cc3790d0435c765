//! In-memory tracking store.
//!
//! Holds the desired spec and last committed status of every tracked
//! instance. The controller reads it through [`InstanceLookup`] and writes
//! back through [`StatusSink`], once per pass.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::controller::{StatusDelta, StatusSink};
use crate::model::{DesiredSpec, InstanceKey, ResourceInstance, ResourceStatus};
use crate::resolver::InstanceLookup;

#[derive(Default)]
struct StoreInner {
    instances: HashMap<InstanceKey, ResourceInstance>,
    /// Reference target to the instances referencing it.
    dependents: HashMap<InstanceKey, BTreeSet<InstanceKey>>,
}

impl StoreInner {
    fn index(&mut self, instance: &ResourceInstance) {
        for reference in &instance.spec.references {
            self.dependents
                .entry(reference.target.clone())
                .or_default()
                .insert(instance.key.clone());
        }
    }

    fn unindex(&mut self, instance: &ResourceInstance) {
        for reference in &instance.spec.references {
            if let Some(set) = self.dependents.get_mut(&reference.target) {
                set.remove(&instance.key);
                if set.is_empty() {
                    self.dependents.remove(&reference.target);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct InstanceStore {
    inner: RwLock<StoreInner>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the desired spec for `key` and return its generation. A new
    /// instance starts at generation 1; changed content bumps it.
    pub fn apply(&self, key: InstanceKey, spec: DesiredSpec) -> u64 {
        let mut inner = self.write();

        let previous = inner.instances.remove(&key);
        let instance = match previous {
            Some(mut existing) => {
                inner.unindex(&existing);
                if !existing.spec.same_content(&spec) {
                    let generation = existing.spec.generation + 1;
                    existing.spec = DesiredSpec { generation, ..spec };
                }
                existing.deletion_requested = false;
                existing
            }
            None => ResourceInstance::new(key.clone(), DesiredSpec { generation: 1, ..spec }),
        };

        let generation = instance.spec.generation;
        inner.index(&instance);
        inner.instances.insert(key, instance);
        generation
    }

    /// Flag an instance for deletion. Returns `false` if it is not tracked.
    pub fn request_deletion(&self, key: &InstanceKey) -> bool {
        match self.write().instances.get_mut(key) {
            Some(instance) => {
                instance.deletion_requested = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &InstanceKey) -> Option<ResourceInstance> {
        self.read().instances.get(key).cloned()
    }

    pub fn status(&self, key: &InstanceKey) -> Option<ResourceStatus> {
        self.read().instances.get(key).map(|i| i.status.clone())
    }

    pub fn keys(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<_> = self.read().instances.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn instances(&self) -> Vec<ResourceInstance> {
        let mut instances: Vec<_> = self.read().instances.values().cloned().collect();
        instances.sort_by(|a, b| a.key.cmp(&b.key));
        instances
    }

    pub fn len(&self) -> usize {
        self.read().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().instances.is_empty()
    }
}

impl InstanceLookup for InstanceStore {
    fn lookup(&self, key: &InstanceKey) -> Option<ResourceInstance> {
        self.get(key)
    }

    fn referencing(&self, key: &InstanceKey) -> Vec<ResourceInstance> {
        let inner = self.read();
        inner
            .dependents
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|dependent| inner.instances.get(dependent).cloned())
            .collect()
    }
}

impl StatusSink for InstanceStore {
    fn commit(&self, delta: StatusDelta) {
        let mut inner = self.write();
        if delta.forget {
            if let Some(instance) = inner.instances.remove(&delta.key) {
                inner.unindex(&instance);
                debug!(key = %delta.key, "Instance no longer tracked");
            }
            return;
        }
        match inner.instances.get_mut(&delta.key) {
            Some(instance) => instance.status = delta.status,
            None => debug!(key = %delta.key, "Dropping status for untracked instance"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProvisioningState, ResourceKind, SERVER_REFERENCE};

    fn server() -> InstanceKey {
        InstanceKey::new(ResourceKind::MySqlServer, "sub", "rg", "s1")
    }

    fn database() -> InstanceKey {
        InstanceKey::new(ResourceKind::MySqlDatabase, "sub", "rg", "d1")
    }

    #[test]
    fn generation_bumps_only_on_change() {
        let store = InstanceStore::new();
        let spec = DesiredSpec::new().attribute("location", "westus2");
        assert_eq!(store.apply(server(), spec.clone()), 1);
        assert_eq!(store.apply(server(), spec.clone()), 1);
        assert_eq!(store.apply(server(), spec.attribute("version", "8.0")), 2);
    }

    #[test]
    fn reapply_keeps_status() {
        let store = InstanceStore::new();
        store.apply(server(), DesiredSpec::new());
        store.commit(StatusDelta {
            key: server(),
            status: ResourceStatus {
                state: ProvisioningState::Ready,
                ..Default::default()
            },
            forget: false,
        });
        store.apply(server(), DesiredSpec::new().attribute("sku", "B_Gen5_1"));
        assert_eq!(
            store.status(&server()).unwrap().state,
            ProvisioningState::Ready
        );
    }

    #[test]
    fn reverse_index_follows_references() {
        let store = InstanceStore::new();
        store.apply(server(), DesiredSpec::new());
        store.apply(
            database(),
            DesiredSpec::new().reference(SERVER_REFERENCE, server()),
        );
        let dependents = store.referencing(&server());
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].key, database());

        store.commit(StatusDelta {
            key: database(),
            status: ResourceStatus::default(),
            forget: true,
        });
        assert!(store.referencing(&server()).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn deletion_of_untracked_key() {
        let store = InstanceStore::new();
        assert!(!store.request_deletion(&server()));
        store.apply(server(), DesiredSpec::new());
        assert!(store.request_deletion(&server()));
        assert!(store.get(&server()).unwrap().deletion_requested);
    }
}
