//! Resource managers.
//!
//! A [`ResourceManager`] is a pure adapter from one resource kind to the
//! control plane: create-or-update, get, delete and name availability. It
//! holds no convergence logic. Every kind family implements [`ArmResource`]
//! (paths, request bodies, naming) and gets the manager operations from the
//! shared implementation below.

mod arm;
mod child;
mod cosmosdb;
mod mysql;
mod sql;
mod storage;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

pub use arm::{ArmClient, ArmResource};
pub use child::ChildManager;
pub use cosmosdb::CosmosDbAccountManager;
pub use mysql::{MySqlAdministratorManager, MySqlReplicaManager, MySqlServerManager};
pub use sql::SqlServerManager;
pub use storage::StorageAccountManager;

use crate::cancel::Cancellation;
use crate::config::EngineConfig;
use crate::error::{ClassifiedError, classify_name_reason};
use crate::model::{
    Attributes, NameAvailability, NameReason, RemoteState, ResourceInstance, ResourceKind,
    SERVER_REFERENCE,
};
use crate::naming;
use crate::remote::ControlPlane;

/// Scope a resource is created in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    pub subscription: String,
    pub resource_group: String,
    /// Parent server name for child kinds.
    pub parent: Option<String>,
}

impl GroupRef {
    pub fn new(subscription: impl Into<String>, resource_group: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            resource_group: resource_group.into(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Scope of a tracked instance; the parent comes from its `server` reference.
    pub fn for_instance(instance: &ResourceInstance) -> Self {
        let group = Self::new(&instance.key.subscription, &instance.key.resource_group);
        match instance.spec.find_reference(SERVER_REFERENCE) {
            Some(server) => group.with_parent(&server.target.name),
            None => group,
        }
    }

    pub fn parent(&self) -> Result<&str, ClassifiedError> {
        self.parent
            .as_deref()
            .ok_or_else(|| ClassifiedError::fatal("missing `server` reference"))
    }
}

/// Desired attributes plus the remote ids of resolved references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredAttributes {
    pub values: Attributes,
    /// Reference name to remote id.
    pub resolved: BTreeMap<String, String>,
}

impl DesiredAttributes {
    pub fn new(values: Attributes) -> Self {
        Self {
            values,
            resolved: BTreeMap::new(),
        }
    }

    pub fn with_resolved(mut self, resolved: BTreeMap<String, String>) -> Self {
        self.resolved = resolved;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// A string attribute the kind cannot do without.
    pub fn required_str(&self, key: &str) -> Result<&str, ClassifiedError> {
        match self.str(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(ClassifiedError::fatal(format!(
                "missing required attribute `{key}`"
            ))),
        }
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.str(key).unwrap_or(default)
    }

    pub fn resolved(&self, reference: &str) -> Option<&str> {
        self.resolved.get(reference).map(String::as_str)
    }

    /// Copy the listed attributes into `target` when present.
    pub fn copy_optional(&self, target: &mut Map<String, Value>, keys: &[&str]) {
        for key in keys {
            if let Some(value) = self.values.get(*key) {
                target.insert((*key).to_string(), value.clone());
            }
        }
    }
}

/// Result of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAck {
    Deleted,
    /// Nothing to delete; no mutating call was made.
    AlreadyAbsent,
}

/// Capability set every resource kind provides.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Create or update and wait for the remote operation to finish. The name
    /// must pass [`check_name_availability`](Self::check_name_availability)
    /// unless `force_update` is set.
    async fn create_or_update(
        &self,
        group: &GroupRef,
        name: &str,
        desired: &DesiredAttributes,
        force_update: bool,
        cancel: &Cancellation,
    ) -> Result<RemoteState, ClassifiedError>;

    /// Read-only lookup; absence is `NotFound`.
    async fn get(
        &self,
        group: &GroupRef,
        name: &str,
        cancel: &Cancellation,
    ) -> Result<RemoteState, ClassifiedError>;

    /// Idempotent delete.
    async fn delete(
        &self,
        group: &GroupRef,
        name: &str,
        cancel: &Cancellation,
    ) -> Result<DeleteAck, ClassifiedError>;

    async fn check_name_availability(
        &self,
        group: &GroupRef,
        name: &str,
        cancel: &Cancellation,
    ) -> Result<NameAvailability, ClassifiedError>;
}

#[async_trait]
impl<T: ArmResource> ResourceManager for T {
    fn kind(&self) -> ResourceKind {
        self.resource_kind()
    }

    async fn create_or_update(
        &self,
        group: &GroupRef,
        name: &str,
        desired: &DesiredAttributes,
        force_update: bool,
        cancel: &Cancellation,
    ) -> Result<RemoteState, ClassifiedError> {
        let path = self.path(group, name)?;
        let body = self.body(name, desired)?;

        if !force_update {
            let availability = self.check_name_availability(group, name, cancel).await?;
            let detail = availability.message.as_deref();
            if let Some(err) = classify_name_reason(availability.reason, name, detail) {
                return Err(err);
            }
        }

        self.client().put_and_wait(&path, body, cancel).await
    }

    async fn get(
        &self,
        group: &GroupRef,
        name: &str,
        cancel: &Cancellation,
    ) -> Result<RemoteState, ClassifiedError> {
        let path = self.path(group, name)?;
        self.client().get(&path, cancel).await
    }

    async fn delete(
        &self,
        group: &GroupRef,
        name: &str,
        cancel: &Cancellation,
    ) -> Result<DeleteAck, ClassifiedError> {
        let path = self.path(group, name)?;
        self.client().delete_if_present(&path, cancel).await
    }

    async fn check_name_availability(
        &self,
        group: &GroupRef,
        name: &str,
        cancel: &Cancellation,
    ) -> Result<NameAvailability, ClassifiedError> {
        if let Err(reason) = naming::check(self.name_rule(), name) {
            return Ok(NameAvailability::taken(NameReason::Invalid, Some(reason)));
        }
        match self.name_check(group, name) {
            Some(check) => self.client().check_name(&check, cancel).await,
            None => Ok(NameAvailability::available()),
        }
    }
}

/// Managers by kind.
#[derive(Clone, Default)]
pub struct ManagerRegistry {
    managers: HashMap<ResourceKind, Arc<dyn ResourceManager>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a manager for every [`ResourceKind`].
    pub fn standard(channel: Arc<dyn ControlPlane>, config: &EngineConfig) -> Self {
        let client = ArmClient::new(channel, config.poll_policy());
        let mut registry = Self::new();
        registry.register(Arc::new(SqlServerManager::new(client.clone())));
        registry.register(Arc::new(ChildManager::sql_database(client.clone())));
        registry.register(Arc::new(ChildManager::sql_firewall_rule(client.clone())));
        registry.register(Arc::new(MySqlServerManager::new(client.clone())));
        registry.register(Arc::new(MySqlReplicaManager::new(client.clone())));
        registry.register(Arc::new(ChildManager::mysql_database(client.clone())));
        registry.register(Arc::new(ChildManager::mysql_firewall_rule(client.clone())));
        registry.register(Arc::new(MySqlAdministratorManager::new(client.clone())));
        registry.register(Arc::new(StorageAccountManager::new(client.clone())));
        registry.register(Arc::new(CosmosDbAccountManager::new(client)));
        registry
    }

    /// Register a manager, replacing any earlier one for the same kind.
    pub fn register(&mut self, manager: Arc<dyn ResourceManager>) {
        self.managers.insert(manager.kind(), manager);
    }

    pub fn get(&self, kind: ResourceKind) -> Option<Arc<dyn ResourceManager>> {
        self.managers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.managers.keys().copied()
    }
}
