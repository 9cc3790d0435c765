//! In-memory control plane.
//!
//! Behaves like an eventually consistent remote: mutations are accepted
//! immediately and become visible only after a configurable number of poll
//! rounds. Failures can be injected per call site, and every call is counted
//! so tests can assert which remote calls a pass made.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{ControlPlane, NameCheck, ResourcePath};
use crate::error::RemoteFailure;
use crate::model::{NameAvailability, NameReason, RemoteState};
use crate::operation::{OperationHandle, OperationVerb, PollStatus, PollTarget};

/// Call sites that accept injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Put,
    Delete,
    Get,
    Poll,
    NameCheck,
}

/// Number of calls received per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub puts: usize,
    pub deletes: usize,
    pub gets: usize,
    pub polls: usize,
    pub name_checks: usize,
}

impl CallCounts {
    /// Calls that change remote state.
    pub fn mutations(&self) -> usize {
        self.puts + self.deletes
    }

    pub fn total(&self) -> usize {
        self.puts + self.deletes + self.gets + self.polls + self.name_checks
    }
}

struct SimResource {
    resource_type: String,
    state: RemoteState,
}

struct SimOperation {
    verb: OperationVerb,
    path: ResourcePath,
    body: Value,
    remaining: u32,
    failure: Option<RemoteFailure>,
}

#[derive(Default)]
struct SimState {
    resources: BTreeMap<String, SimResource>,
    operations: HashMap<String, SimOperation>,
    /// Names held by someone outside this engine.
    reserved: HashSet<(String, String)>,
    faults: HashMap<FaultPoint, VecDeque<RemoteFailure>>,
    operation_failures: VecDeque<RemoteFailure>,
    calls: CallCounts,
    latency: u32,
}

impl SimState {
    fn take_fault(&mut self, point: FaultPoint) -> Option<RemoteFailure> {
        self.faults.get_mut(&point).and_then(VecDeque::pop_front)
    }

    fn apply(&mut self, op: &SimOperation) {
        match op.verb {
            OperationVerb::Put => {
                let resource_type = op.path.resource_type().unwrap_or_default();
                let properties = op.body.get("properties").cloned().unwrap_or(Value::Null);
                let state = RemoteState {
                    id: op.path.path.clone(),
                    name: op.path.name().to_string(),
                    provisioning_state: Some("Succeeded".to_string()),
                    properties,
                };
                self.resources.insert(
                    op.path.path.clone(),
                    SimResource {
                        resource_type,
                        state,
                    },
                );
            }
            OperationVerb::Delete => {
                let prefix = format!("{}/", op.path.path);
                self.resources
                    .retain(|path, _| path != &op.path.path && !path.starts_with(&prefix));
            }
        }
    }

    fn name_taken(&self, resource_type: &str, name: &str) -> bool {
        self.reserved
            .contains(&(resource_type.to_string(), name.to_string()))
            || self
                .resources
                .values()
                .any(|r| r.resource_type == resource_type && r.state.name == name)
    }
}

fn not_found(path: &str) -> RemoteFailure {
    RemoteFailure::http(
        404,
        Some("ResourceNotFound".to_string()),
        format!("resource {path} was not found"),
    )
}

/// Parent of a nested resource path, `None` for top-level resources.
fn parent_of(path: &ResourcePath) -> Option<String> {
    let depth = path.resource_type()?.split('/').count();
    if depth < 3 {
        return None;
    }
    let mut parts: Vec<&str> = path.path.split('/').collect();
    parts.truncate(parts.len() - 2);
    Some(parts.join("/"))
}

/// In-memory [`ControlPlane`].
pub struct SimulatedControlPlane {
    state: Mutex<SimState>,
    poll_delay: Duration,
}

impl Default for SimulatedControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedControlPlane {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            poll_delay: Duration::ZERO,
        }
    }

    /// Poll rounds before a mutation completes; 0 completes synchronously.
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.state.get_mut().latency = polls;
        self
    }

    /// Time each poll call takes to answer.
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub async fn set_latency(&self, polls: u32) {
        self.state.lock().await.latency = polls;
    }

    /// Fail the next call at `point` with `failure`.
    pub async fn fail_next(&self, point: FaultPoint, failure: RemoteFailure) {
        self.state
            .lock()
            .await
            .faults
            .entry(point)
            .or_default()
            .push_back(failure);
    }

    /// Make the next accepted mutation end in `failure`.
    pub async fn fail_next_operation(&self, failure: RemoteFailure) {
        self.state.lock().await.operation_failures.push_back(failure);
    }

    /// Mark a global name as owned by someone else.
    pub async fn reserve_name(&self, resource_type: &str, name: &str) {
        self.state
            .lock()
            .await
            .reserved
            .insert((resource_type.to_string(), name.to_string()));
    }

    /// Create a resource out of band.
    pub async fn seed(&self, path: &ResourcePath, properties: Value) {
        let op = SimOperation {
            verb: OperationVerb::Put,
            path: path.clone(),
            body: serde_json::json!({ "properties": properties }),
            remaining: 0,
            failure: None,
        };
        self.state.lock().await.apply(&op);
    }

    /// Remove a resource out of band.
    pub async fn remove(&self, path: &str) {
        self.state.lock().await.resources.remove(path);
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    pub async fn reset_calls(&self) {
        self.state.lock().await.calls = CallCounts::default();
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.state.lock().await.resources.contains_key(path)
    }

    pub async fn resource(&self, path: &str) -> Option<RemoteState> {
        self.state
            .lock()
            .await
            .resources
            .get(path)
            .map(|r| r.state.clone())
    }

    pub async fn resource_count(&self) -> usize {
        self.state.lock().await.resources.len()
    }

    async fn accept(
        &self,
        verb: OperationVerb,
        path: &ResourcePath,
        body: Value,
    ) -> OperationHandle {
        let mut state = self.state.lock().await;
        let failure = state.operation_failures.pop_front();
        let latency = state.latency;
        let mut op = SimOperation {
            verb,
            path: path.clone(),
            body,
            remaining: latency,
            failure,
        };

        if op.remaining == 0 && op.failure.is_none() {
            state.apply(&op);
            return OperationHandle::completed(verb, &path.path, &path.api_version);
        }

        op.remaining = op.remaining.max(1);
        let id = Uuid::new_v4().to_string();
        debug!(operation = %id, path = %path.path, "Simulated operation accepted");
        state.operations.insert(id.clone(), op);
        OperationHandle::issued(verb, &path.path, &path.api_version, PollTarget::Opaque(id))
    }
}

#[async_trait]
impl ControlPlane for SimulatedControlPlane {
    async fn begin_put(
        &self,
        path: &ResourcePath,
        body: Value,
    ) -> Result<OperationHandle, RemoteFailure> {
        {
            let mut state = self.state.lock().await;
            state.calls.puts += 1;
            if let Some(failure) = state.take_fault(FaultPoint::Put) {
                return Err(failure);
            }
            if let Some(parent) = parent_of(path) {
                if !state.resources.contains_key(&parent) {
                    return Err(RemoteFailure::http(
                        404,
                        Some("ParentResourceNotFound".to_string()),
                        format!("parent resource {parent} was not found"),
                    ));
                }
            }
        }
        Ok(self.accept(OperationVerb::Put, path, body).await)
    }

    async fn begin_delete(&self, path: &ResourcePath) -> Result<OperationHandle, RemoteFailure> {
        {
            let mut state = self.state.lock().await;
            state.calls.deletes += 1;
            if let Some(failure) = state.take_fault(FaultPoint::Delete) {
                return Err(failure);
            }
            if !state.resources.contains_key(&path.path) {
                return Err(not_found(&path.path));
            }
        }
        Ok(self.accept(OperationVerb::Delete, path, Value::Null).await)
    }

    async fn get(&self, path: &ResourcePath) -> Result<RemoteState, RemoteFailure> {
        let mut state = self.state.lock().await;
        state.calls.gets += 1;
        if let Some(failure) = state.take_fault(FaultPoint::Get) {
            return Err(failure);
        }
        state
            .resources
            .get(&path.path)
            .map(|r| r.state.clone())
            .ok_or_else(|| not_found(&path.path))
    }

    async fn poll(&self, handle: &OperationHandle) -> Result<PollStatus, RemoteFailure> {
        if !self.poll_delay.is_zero() {
            tokio::time::sleep(self.poll_delay).await;
        }

        let mut state = self.state.lock().await;
        state.calls.polls += 1;
        if let Some(failure) = state.take_fault(FaultPoint::Poll) {
            return Err(failure);
        }

        let id = match &handle.target {
            PollTarget::Opaque(id) => id.clone(),
            PollTarget::None => return Ok(PollStatus::Succeeded),
            other => {
                return Err(RemoteFailure::http(
                    400,
                    None,
                    format!("unsupported poll target {other:?}"),
                ));
            }
        };

        let Some(op) = state.operations.get_mut(&id) else {
            return Err(RemoteFailure::http(
                404,
                Some("OperationNotFound".to_string()),
                format!("operation {id} is unknown"),
            ));
        };

        op.remaining = op.remaining.saturating_sub(1);
        if op.remaining > 0 {
            return Ok(PollStatus::InProgress { retry_after: None });
        }

        let Some(op) = state.operations.remove(&id) else {
            return Ok(PollStatus::InProgress { retry_after: None });
        };
        match op.failure.clone() {
            Some(failure) => Ok(PollStatus::Failed(failure)),
            None => {
                state.apply(&op);
                Ok(PollStatus::Succeeded)
            }
        }
    }

    async fn check_name(&self, check: &NameCheck) -> Result<NameAvailability, RemoteFailure> {
        let mut state = self.state.lock().await;
        state.calls.name_checks += 1;
        if let Some(failure) = state.take_fault(FaultPoint::NameCheck) {
            return Err(failure);
        }
        if state.name_taken(check.resource_type(), check.name()) {
            Ok(NameAvailability::taken(
                NameReason::AlreadyExists,
                Some(format!("{} is already in use", check.name())),
            ))
        } else {
            Ok(NameAvailability::available())
        }
    }
}
