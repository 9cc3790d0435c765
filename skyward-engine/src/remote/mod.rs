//! Control-plane channel.
//!
//! The resource managers talk to the cloud through a [`ControlPlane`]:
//! - [`http::HttpControlPlane`]: ARM-style REST over HTTPS
//! - [`sim::SimulatedControlPlane`]: in-memory remote for tests and dry runs

pub mod http;
pub mod sim;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RemoteFailure;
use crate::model::{NameAvailability, RemoteState};
use crate::operation::{OperationHandle, PollStatus};

/// Fully qualified resource path plus the API version to address it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    /// e.g. `/subscriptions/s/resourceGroups/rg/providers/Microsoft.Sql/servers/s1`
    pub path: String,
    pub api_version: String,
}

impl ResourcePath {
    pub fn new(path: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            api_version: api_version.into(),
        }
    }

    /// Path of a top-level resource in a resource group.
    pub fn top_level(
        subscription: &str,
        resource_group: &str,
        resource_type: &str,
        name: &str,
        api_version: &str,
    ) -> Self {
        Self::new(
            format!(
                "/subscriptions/{subscription}/resourceGroups/{resource_group}/providers/{resource_type}/{name}"
            ),
            api_version,
        )
    }

    /// Path of a resource nested below this one.
    pub fn child(&self, segment: &str, name: &str) -> Self {
        Self::new(
            format!("{}/{segment}/{name}", self.path),
            self.api_version.clone(),
        )
    }

    /// Resource type, e.g. `Microsoft.Sql/servers/databases`.
    pub fn resource_type(&self) -> Option<String> {
        let (_, tail) = self.path.split_once("/providers/")?;
        let segments: Vec<&str> = tail.split('/').collect();
        if segments.len() < 3 || segments.len() % 2 == 0 {
            return None;
        }
        let mut ty = vec![segments[0]];
        ty.extend(segments[1..].iter().step_by(2));
        Some(ty.join("/"))
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }
}

/// How a kind checks whether a global name is free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameCheck {
    /// POST `{"name", "type"}` to a `checkNameAvailability` action.
    Action {
        path: ResourcePath,
        resource_type: String,
        name: String,
    },
    /// HEAD a name probe: 200 means taken, 404 means free.
    ExistsProbe {
        path: ResourcePath,
        resource_type: String,
        name: String,
    },
}

impl NameCheck {
    pub fn resource_type(&self) -> &str {
        match self {
            NameCheck::Action { resource_type, .. } | NameCheck::ExistsProbe { resource_type, .. } => {
                resource_type
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NameCheck::Action { name, .. } | NameCheck::ExistsProbe { name, .. } => name,
        }
    }
}

/// Authenticated request/response channel to the cloud control plane.
///
/// Implementations only move bytes and report raw failures; classification
/// and retries happen above this layer.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Issue a create-or-update; the handle tracks completion.
    async fn begin_put(&self, path: &ResourcePath, body: Value)
    -> Result<OperationHandle, RemoteFailure>;

    /// Issue a delete; the handle tracks completion.
    async fn begin_delete(&self, path: &ResourcePath) -> Result<OperationHandle, RemoteFailure>;

    async fn get(&self, path: &ResourcePath) -> Result<RemoteState, RemoteFailure>;

    /// One poll round for an in-flight operation.
    async fn poll(&self, handle: &OperationHandle) -> Result<PollStatus, RemoteFailure>;

    async fn check_name(&self, check: &NameCheck) -> Result<NameAvailability, RemoteFailure>;
}
