//! Resource instances, their desired specs and observed status.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClassifiedError, ErrorKind};

/// Manageable resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    SqlServer,
    SqlDatabase,
    SqlFirewallRule,
    MySqlServer,
    MySqlReplica,
    MySqlDatabase,
    MySqlFirewallRule,
    MySqlAdministrator,
    StorageAccount,
    CosmosDbAccount,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::SqlServer,
        ResourceKind::SqlDatabase,
        ResourceKind::SqlFirewallRule,
        ResourceKind::MySqlServer,
        ResourceKind::MySqlReplica,
        ResourceKind::MySqlDatabase,
        ResourceKind::MySqlFirewallRule,
        ResourceKind::MySqlAdministrator,
        ResourceKind::StorageAccount,
        ResourceKind::CosmosDbAccount,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::SqlServer => "sql-server",
            ResourceKind::SqlDatabase => "sql-database",
            ResourceKind::SqlFirewallRule => "sql-firewall-rule",
            ResourceKind::MySqlServer => "my-sql-server",
            ResourceKind::MySqlReplica => "my-sql-replica",
            ResourceKind::MySqlDatabase => "my-sql-database",
            ResourceKind::MySqlFirewallRule => "my-sql-firewall-rule",
            ResourceKind::MySqlAdministrator => "my-sql-administrator",
            ResourceKind::StorageAccount => "storage-account",
            ResourceKind::CosmosDbAccount => "cosmos-db-account",
        }
    }

    /// Whether the kind lives underneath a server.
    pub fn is_child(self) -> bool {
        matches!(
            self,
            ResourceKind::SqlDatabase
                | ResourceKind::SqlFirewallRule
                | ResourceKind::MySqlDatabase
                | ResourceKind::MySqlFirewallRule
                | ResourceKind::MySqlAdministrator
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a tracked instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub kind: ResourceKind,
    pub subscription: String,
    pub resource_group: String,
    pub name: String,
}

impl InstanceKey {
    pub fn new(
        kind: ResourceKind,
        subscription: impl Into<String>,
        resource_group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            subscription: subscription.into(),
            resource_group: resource_group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.resource_group, self.name)
    }
}

/// Weak pointer to a prerequisite instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReference {
    /// Role of the reference, e.g. `server` or `source`.
    pub name: String,
    pub target: InstanceKey,
}

impl DependencyReference {
    pub fn new(name: impl Into<String>, target: InstanceKey) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }
}

/// Reference role naming a child's parent server.
pub const SERVER_REFERENCE: &str = "server";
/// Reference role naming a replica's primary.
pub const SOURCE_REFERENCE: &str = "source";

pub type Attributes = BTreeMap<String, Value>;

/// Desired state as supplied by the orchestration framework.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredSpec {
    /// Bumped on every change; the "spec changed" signal.
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub references: Vec<DependencyReference>,
}

impl DesiredSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn reference(mut self, name: impl Into<String>, target: InstanceKey) -> Self {
        self.references.push(DependencyReference::new(name, target));
        self
    }

    pub fn find_reference(&self, name: &str) -> Option<&DependencyReference> {
        self.references.iter().find(|r| r.name == name)
    }

    /// Same desired content, ignoring the generation counter.
    pub fn same_content(&self, other: &DesiredSpec) -> bool {
        self.attributes == other.attributes && self.references == other.references
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisioningState {
    #[default]
    Pending,
    Creating,
    Ready,
    Deleting,
    Deleted,
    Failed,
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisioningState::Pending => "Pending",
            ProvisioningState::Creating => "Creating",
            ProvisioningState::Ready => "Ready",
            ProvisioningState::Deleting => "Deleting",
            ProvisioningState::Deleted => "Deleted",
            ProvisioningState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// The persisted part of a classified error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ClassifiedError> for StatusError {
    fn from(err: &ClassifiedError) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub state: ProvisioningState,
    /// Remote resource id; immutable once set.
    pub remote_id: Option<String>,
    pub last_error: Option<StatusError>,
    /// Progress note, e.g. which dependency is being waited on.
    pub message: Option<String>,
    pub last_reconciled: Option<DateTime<Utc>>,
    pub observed_generation: u64,
    /// Consecutive Conflict/Throttled outcomes.
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub key: InstanceKey,
    pub spec: DesiredSpec,
    #[serde(default)]
    pub status: ResourceStatus,
    /// Set by the framework once the desired object is removed.
    #[serde(default)]
    pub deletion_requested: bool,
}

impl ResourceInstance {
    pub fn new(key: InstanceKey, spec: DesiredSpec) -> Self {
        Self {
            key,
            spec,
            status: ResourceStatus::default(),
            deletion_requested: false,
        }
    }

    /// Ready with a recorded remote id.
    pub fn is_ready(&self) -> bool {
        self.status.state == ProvisioningState::Ready
            && self.status.remote_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn spec_changed(&self) -> bool {
        self.spec.generation != self.status.observed_generation
    }
}

/// Remote representation of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteState {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub provisioning_state: Option<String>,
    #[serde(default)]
    pub properties: Value,
}

/// Why a name is or is not available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameReason {
    Available,
    AlreadyExists,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAvailability {
    pub available: bool,
    pub reason: NameReason,
    pub message: Option<String>,
}

impl NameAvailability {
    pub fn available() -> Self {
        Self {
            available: true,
            reason: NameReason::Available,
            message: None,
        }
    }

    pub fn taken(reason: NameReason, message: Option<String>) -> Self {
        Self {
            available: false,
            reason,
            message,
        }
    }
}
