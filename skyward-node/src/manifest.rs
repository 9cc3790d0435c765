//! Manifest of desired instances.
//!
//! ```json
//! {
//!   "resourceGroup": "rg-demo",
//!   "resources": [
//!     { "kind": "my-sql-server", "name": "mysql-primary", "attributes": { "location": "eastus2" } },
//!     { "kind": "my-sql-database", "name": "appdb", "references": { "server": "mysql-primary" } }
//!   ]
//! }
//! ```
//!
//! A reference is either a bare name, whose kind follows from the role and
//! the referencing kind, or an explicit `{ "kind", "name" }` pair.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use skyward_engine::model::{Attributes, SERVER_REFERENCE, SOURCE_REFERENCE};
use skyward_engine::{DesiredSpec, InstanceKey, ResourceKind};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    subscription: Option<String>,
    resource_group: String,
    #[serde(default)]
    resources: Vec<RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResource {
    kind: ResourceKind,
    name: String,
    resource_group: Option<String>,
    #[serde(default)]
    attributes: Attributes,
    #[serde(default)]
    references: BTreeMap<String, RawReference>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawReference {
    Name(String),
    Explicit { kind: ResourceKind, name: String },
}

/// Desired instances in manifest order. Every key and reference lives in
/// the one manifest subscription.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub subscription: String,
    pub entries: Vec<(InstanceKey, DesiredSpec)>,
}

/// Kind a bare-name reference points at.
fn implied_kind(from: ResourceKind, role: &str) -> Option<ResourceKind> {
    match (role, from) {
        (SOURCE_REFERENCE, ResourceKind::MySqlReplica) => Some(ResourceKind::MySqlServer),
        (SERVER_REFERENCE, ResourceKind::SqlDatabase | ResourceKind::SqlFirewallRule) => {
            Some(ResourceKind::SqlServer)
        }
        (
            SERVER_REFERENCE,
            ResourceKind::MySqlDatabase
            | ResourceKind::MySqlFirewallRule
            | ResourceKind::MySqlAdministrator,
        ) => Some(ResourceKind::MySqlServer),
        _ => None,
    }
}

impl Manifest {
    pub fn load(path: &Path, default_subscription: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::parse(&text, default_subscription)
            .with_context(|| format!("Invalid manifest {}", path.display()))
    }

    pub fn parse(text: &str, default_subscription: &str) -> Result<Self> {
        let raw: RawManifest = serde_json::from_str(text).context("Malformed manifest JSON")?;
        let subscription = raw
            .subscription
            .unwrap_or_else(|| default_subscription.to_string());
        if subscription.trim().is_empty() {
            bail!("No subscription: set one in the manifest or pass --subscription");
        }

        let mut entries: Vec<(InstanceKey, DesiredSpec)> = Vec::with_capacity(raw.resources.len());
        for resource in raw.resources {
            let group = resource
                .resource_group
                .unwrap_or_else(|| raw.resource_group.clone());
            let key = InstanceKey::new(resource.kind, &subscription, &group, &resource.name);
            if entries.iter().any(|(k, _)| k == &key) {
                bail!("Duplicate resource {key}");
            }

            let mut spec = DesiredSpec {
                attributes: resource.attributes,
                ..Default::default()
            };
            for (role, reference) in resource.references {
                let (kind, name) = match reference {
                    RawReference::Explicit { kind, name } => (kind, name),
                    RawReference::Name(name) => match implied_kind(resource.kind, &role) {
                        Some(kind) => (kind, name),
                        None => bail!("{key}: reference `{role}` needs an explicit kind"),
                    },
                };
                spec = spec.reference(role, InstanceKey::new(kind, &subscription, &group, name));
            }
            entries.push((key, spec));
        }

        Ok(Self {
            subscription,
            entries,
        })
    }

    pub fn keys(&self) -> Vec<InstanceKey> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
