use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{DeleteAck, DesiredAttributes, GroupRef};
use crate::cancel::Cancellation;
use crate::error::{ClassifiedError, RemoteFailure, classify};
use crate::model::{NameAvailability, RemoteState, ResourceKind};
use crate::naming::NameRule;
use crate::operation::{OperationTracker, PollPolicy};
use crate::remote::{ControlPlane, NameCheck, ResourcePath};

/// Kind-specific knowledge: where a resource lives and what to send.
pub trait ArmResource: Send + Sync {
    fn resource_kind(&self) -> ResourceKind;

    fn client(&self) -> &ArmClient;

    fn path(&self, group: &GroupRef, name: &str) -> Result<ResourcePath, ClassifiedError>;

    fn name_rule(&self) -> NameRule;

    /// Remote name check; `None` when names are scoped to a parent.
    fn name_check(&self, _group: &GroupRef, _name: &str) -> Option<NameCheck> {
        None
    }

    /// Request body for create-or-update. Fails before any remote call when
    /// a required attribute is missing.
    fn body(&self, name: &str, desired: &DesiredAttributes) -> Result<Value, ClassifiedError>;
}

/// `checkNameAvailability` action of a resource provider.
pub(super) fn name_check_action(
    subscription: &str,
    provider: &str,
    resource_type: &str,
    name: &str,
    api_version: &str,
) -> NameCheck {
    NameCheck::Action {
        path: ResourcePath::new(
            format!("/subscriptions/{subscription}/providers/{provider}/checkNameAvailability"),
            api_version,
        ),
        resource_type: resource_type.to_string(),
        name: name.to_string(),
    }
}

/// Control-plane access shared by all managers.
#[derive(Clone)]
pub struct ArmClient {
    channel: Arc<dyn ControlPlane>,
    tracker: OperationTracker,
}

/// Run a channel call under `cancel`, classifying its failure.
async fn call<T>(
    cancel: &Cancellation,
    fut: impl Future<Output = Result<T, RemoteFailure>>,
) -> Result<T, ClassifiedError> {
    match cancel.run(fut).await {
        None => Err(ClassifiedError::cancelled()),
        Some(result) => result.map_err(|failure| classify(&failure)),
    }
}

impl ArmClient {
    pub fn new(channel: Arc<dyn ControlPlane>, policy: PollPolicy) -> Self {
        let tracker = OperationTracker::new(channel.clone(), policy);
        Self { channel, tracker }
    }

    /// PUT, wait for the operation, then read back the final representation.
    pub async fn put_and_wait(
        &self,
        path: &ResourcePath,
        body: Value,
        cancel: &Cancellation,
    ) -> Result<RemoteState, ClassifiedError> {
        let mut handle = call(cancel, self.channel.begin_put(path, body)).await?;
        self.tracker.await_completion(&mut handle, cancel).await?;
        self.get(path, cancel).await
    }

    pub async fn get(
        &self,
        path: &ResourcePath,
        cancel: &Cancellation,
    ) -> Result<RemoteState, ClassifiedError> {
        call(cancel, self.channel.get(path)).await
    }

    /// Delete unless already gone. Only a `NotFound` lookup counts as gone;
    /// any other lookup failure aborts the delete.
    pub async fn delete_if_present(
        &self,
        path: &ResourcePath,
        cancel: &Cancellation,
    ) -> Result<DeleteAck, ClassifiedError> {
        match self.get(path, cancel).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                debug!(path = %path.path, "Already absent, nothing to delete");
                return Ok(DeleteAck::AlreadyAbsent);
            }
            Err(err) => return Err(err),
        }

        let mut handle = match call(cancel, self.channel.begin_delete(path)).await {
            Ok(handle) => handle,
            // Gone between the lookup and the delete.
            Err(err) if err.is_not_found() => return Ok(DeleteAck::AlreadyAbsent),
            Err(err) => return Err(err),
        };
        match self.tracker.await_completion(&mut handle, cancel).await {
            Ok(()) => Ok(DeleteAck::Deleted),
            Err(err) if err.is_not_found() => Ok(DeleteAck::Deleted),
            Err(err) => Err(err),
        }
    }

    pub async fn check_name(
        &self,
        check: &NameCheck,
        cancel: &Cancellation,
    ) -> Result<NameAvailability, ClassifiedError> {
        call(cancel, self.channel.check_name(check)).await
    }
}
