//! ARM-style REST channel.
//!
//! Resources are addressed as `{endpoint}{path}?api-version=..`. Mutations
//! either answer with the final body or hand back an `Azure-AsyncOperation`
//! or `Location` URL to poll. Errors come as `{"error":{"code","message"}}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use super::{ControlPlane, NameCheck, ResourcePath};
use crate::config::{ConfigError, EngineConfig};
use crate::credentials::CredentialProvider;
use crate::error::RemoteFailure;
use crate::model::{NameAvailability, NameReason, RemoteState};
use crate::operation::{OperationHandle, OperationVerb, PollStatus, PollTarget};

const ASYNC_OPERATION: &str = "azure-asyncoperation";
const CLIENT_REQUEST_ID: &str = "x-ms-client-request-id";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpControlPlane {
    client: Client,
    endpoint: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpControlPlane {
    pub fn new(
        config: &EngineConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = Client::builder()
            .user_agent(config.user_agent())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint().to_string(),
            credentials,
        })
    }

    fn request(&self, method: Method, path: &ResourcePath) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.endpoint, path.path))
            .query(&[("api-version", path.api_version.as_str())])
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteFailure> {
        let authorizer = self
            .credentials
            .authorizer()
            .await
            .map_err(|e| RemoteFailure::network(format!("no usable credential: {e}")))?;

        let request_id = Uuid::new_v4().to_string();
        let response = builder
            .bearer_auth(authorizer.token())
            .header(CLIENT_REQUEST_ID, &request_id)
            .send()
            .await
            .map_err(|e| RemoteFailure::network(e.to_string()))?;

        debug!(
            request_id = %request_id,
            status = response.status().as_u16(),
            url = %response.url(),
            "Control plane responded"
        );
        Ok(response)
    }

    async fn get_resource(&self, path: &ResourcePath) -> Result<Response, RemoteFailure> {
        self.send(self.request(Method::GET, path)).await
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn header(headers: &HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `(code, message)` from an ARM error body.
fn error_detail(body: &Value) -> (Option<String>, Option<String>) {
    let error = body.get("error").unwrap_or(body);
    let code = error.get("code").and_then(Value::as_str).map(str::to_string);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);
    (code, message)
}

/// Turn an unsuccessful response into a failure, consuming the body.
async fn failure(response: Response) -> RemoteFailure {
    let status = response.status();
    let hint = retry_after(response.headers());
    let text = response.text().await.unwrap_or_default();
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
    let (code, message) = error_detail(&body);
    let message = message.unwrap_or_else(|| {
        if text.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            text
        }
    });
    RemoteFailure::http(status.as_u16(), code, message).with_retry_after(hint)
}

async fn json_body(response: Response) -> Result<Value, RemoteFailure> {
    let text = response
        .text()
        .await
        .map_err(|e| RemoteFailure::network(e.to_string()))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|e| RemoteFailure::http(200, None, format!("malformed response body: {e}")))
}

fn provisioning_state(body: &Value) -> Option<&str> {
    body.pointer("/properties/provisioningState")
        .and_then(Value::as_str)
}

fn remote_state(path: &ResourcePath, body: Value) -> RemoteState {
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or(path.path.as_str())
        .to_string();
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_else(|| path.name())
        .to_string();
    let provisioning_state = provisioning_state(&body).map(str::to_string);
    let properties = body.get("properties").cloned().unwrap_or(Value::Null);
    RemoteState {
        id,
        name,
        provisioning_state,
        properties,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Running,
    Succeeded,
    Failed,
}

fn progress(state: &str) -> Progress {
    match state {
        "Succeeded" => Progress::Succeeded,
        "Failed" | "Canceled" | "Cancelled" => Progress::Failed,
        _ => Progress::Running,
    }
}

/// Where to follow up after a 2xx mutation response.
fn poll_target(headers: &HeaderMap) -> Option<PollTarget> {
    if let Some(url) = header(headers, ASYNC_OPERATION) {
        return Some(PollTarget::AsyncOperation(url));
    }
    header(headers, LOCATION).map(PollTarget::Location)
}

fn operation_failure(body: &Value, fallback: &str) -> RemoteFailure {
    let (code, message) = error_detail(body);
    RemoteFailure {
        code,
        message: message.unwrap_or_else(|| fallback.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn begin_put(
        &self,
        path: &ResourcePath,
        body: Value,
    ) -> Result<OperationHandle, RemoteFailure> {
        let response = self
            .send(self.request(Method::PUT, path).json(&body))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(failure(response).await);
        }

        if let Some(target) = poll_target(response.headers()) {
            return Ok(OperationHandle::issued(
                OperationVerb::Put,
                &path.path,
                &path.api_version,
                target,
            ));
        }

        let body = json_body(response).await?;
        match provisioning_state(&body).map(progress) {
            Some(Progress::Failed) => Err(operation_failure(
                &body,
                "provisioning failed",
            )),
            Some(Progress::Running) => Ok(OperationHandle::issued(
                OperationVerb::Put,
                &path.path,
                &path.api_version,
                PollTarget::Resource,
            )),
            Some(Progress::Succeeded) | None if status == StatusCode::ACCEPTED => {
                Ok(OperationHandle::issued(
                    OperationVerb::Put,
                    &path.path,
                    &path.api_version,
                    PollTarget::Resource,
                ))
            }
            Some(Progress::Succeeded) | None => Ok(OperationHandle::completed(
                OperationVerb::Put,
                &path.path,
                &path.api_version,
            )),
        }
    }

    async fn begin_delete(&self, path: &ResourcePath) -> Result<OperationHandle, RemoteFailure> {
        let response = self.send(self.request(Method::DELETE, path)).await?;
        match response.status() {
            StatusCode::ACCEPTED => {
                let target = poll_target(response.headers()).unwrap_or(PollTarget::Resource);
                Ok(OperationHandle::issued(
                    OperationVerb::Delete,
                    &path.path,
                    &path.api_version,
                    target,
                ))
            }
            status if status.is_success() => Ok(OperationHandle::completed(
                OperationVerb::Delete,
                &path.path,
                &path.api_version,
            )),
            _ => Err(failure(response).await),
        }
    }

    async fn get(&self, path: &ResourcePath) -> Result<RemoteState, RemoteFailure> {
        let response = self.get_resource(path).await?;
        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        Ok(remote_state(path, json_body(response).await?))
    }

    async fn poll(&self, handle: &OperationHandle) -> Result<PollStatus, RemoteFailure> {
        match &handle.target {
            PollTarget::None => Ok(PollStatus::Succeeded),
            PollTarget::AsyncOperation(url) => {
                let response = self.send(self.client.get(url)).await?;
                if !response.status().is_success() {
                    return Err(failure(response).await);
                }
                let hint = retry_after(response.headers());
                let body = json_body(response).await?;
                let state = body.get("status").and_then(Value::as_str).unwrap_or("");
                Ok(match progress(state) {
                    Progress::Running => PollStatus::InProgress { retry_after: hint },
                    Progress::Succeeded => PollStatus::Succeeded,
                    Progress::Failed => {
                        PollStatus::Failed(operation_failure(&body, &format!("operation {state}")))
                    }
                })
            }
            PollTarget::Location(url) => {
                let response = self.send(self.client.get(url)).await?;
                match response.status() {
                    StatusCode::ACCEPTED => Ok(PollStatus::InProgress {
                        retry_after: retry_after(response.headers()),
                    }),
                    status if status.is_success() => Ok(PollStatus::Succeeded),
                    _ => Err(failure(response).await),
                }
            }
            PollTarget::Resource => {
                let path = ResourcePath::new(&handle.resource_path, &handle.api_version);
                let response = self.get_resource(&path).await?;
                let status = response.status();
                if handle.verb == OperationVerb::Delete {
                    return match status {
                        StatusCode::NOT_FOUND => Ok(PollStatus::Succeeded),
                        s if s.is_success() => Ok(PollStatus::InProgress {
                            retry_after: retry_after(response.headers()),
                        }),
                        _ => Err(failure(response).await),
                    };
                }
                if !status.is_success() {
                    return Err(failure(response).await);
                }
                let hint = retry_after(response.headers());
                let body = json_body(response).await?;
                Ok(match provisioning_state(&body).map(progress) {
                    Some(Progress::Running) => PollStatus::InProgress { retry_after: hint },
                    Some(Progress::Failed) => {
                        PollStatus::Failed(operation_failure(&body, "provisioning failed"))
                    }
                    Some(Progress::Succeeded) | None => PollStatus::Succeeded,
                })
            }
            PollTarget::Opaque(token) => Err(RemoteFailure::http(
                400,
                None,
                format!("operation token {token} was not issued by this channel"),
            )),
        }
    }

    async fn check_name(&self, check: &NameCheck) -> Result<NameAvailability, RemoteFailure> {
        match check {
            NameCheck::Action {
                path,
                resource_type,
                name,
            } => {
                let body = json!({ "name": name, "type": resource_type });
                let response = self
                    .send(self.request(Method::POST, path).json(&body))
                    .await?;
                if !response.status().is_success() {
                    return Err(failure(response).await);
                }
                let body = json_body(response).await?;
                let available = body
                    .get("nameAvailable")
                    .or_else(|| body.get("available"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if available {
                    return Ok(NameAvailability::available());
                }
                let reason = match body.get("reason").and_then(Value::as_str) {
                    Some("Invalid") | Some("AccountNameInvalid") => NameReason::Invalid,
                    _ => NameReason::AlreadyExists,
                };
                let message = body
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(NameAvailability::taken(reason, message))
            }
            NameCheck::ExistsProbe { path, name, .. } => {
                let response = self.send(self.request(Method::HEAD, path)).await?;
                match response.status() {
                    StatusCode::NOT_FOUND => Ok(NameAvailability::available()),
                    status if status.is_success() => Ok(NameAvailability::taken(
                        NameReason::AlreadyExists,
                        Some(format!("{name} is already in use")),
                    )),
                    _ => Err(failure(response).await),
                }
            }
        }
    }
}
