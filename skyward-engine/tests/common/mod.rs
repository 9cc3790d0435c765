//! Shared test utilities for skyward-engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use skyward_engine::controller::{ConvergenceController, Outcome, StatusDelta, StatusSink};
use skyward_engine::manager::ManagerRegistry;
use skyward_engine::model::{
    DesiredSpec, InstanceKey, ResourceKind, ResourceStatus, SERVER_REFERENCE, SOURCE_REFERENCE,
};
use skyward_engine::{Cancellation, EngineConfig, InstanceStore, SimulatedControlPlane};
use tokio::net::TcpListener;

pub const SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000001";
pub const GROUP: &str = "rg-skyward-test";

/// Engine settings with millisecond timings.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        subscription_id: SUBSCRIPTION.to_string(),
        tenant_id: "00000000-0000-0000-0000-0000000000aa".to_string(),
        client_id: "skyward-tests".to_string(),
        poll_interval_ms: 1,
        max_poll_interval_ms: 5,
        operation_timeout_ms: 5_000,
        base_backoff_ms: 10,
        max_backoff_ms: 50,
        max_retries: 3,
        workers: 4,
        ..Default::default()
    }
}

pub fn key(kind: ResourceKind, name: &str) -> InstanceKey {
    InstanceKey::new(kind, SUBSCRIPTION, GROUP, name)
}

pub fn sql_server_spec() -> DesiredSpec {
    DesiredSpec::new()
        .attribute("location", "westus2")
        .attribute("administratorLogin", "sqladmin")
        .attribute("administratorLoginPassword", "Str0ng-Passw0rd!")
}

pub fn mysql_server_spec() -> DesiredSpec {
    DesiredSpec::new()
        .attribute("location", "eastus2")
        .attribute("administratorLogin", "myadmin")
        .attribute("administratorLoginPassword", "Str0ng-Passw0rd!")
        .attribute("sku", "GP_Gen5_2")
}

pub fn sql_database_spec(server: &str) -> DesiredSpec {
    DesiredSpec::new()
        .attribute("location", "westus2")
        .reference(SERVER_REFERENCE, key(ResourceKind::SqlServer, server))
}

pub fn mysql_child_spec(server: &str) -> DesiredSpec {
    DesiredSpec::new().reference(SERVER_REFERENCE, key(ResourceKind::MySqlServer, server))
}

pub fn mysql_replica_spec(source: &str) -> DesiredSpec {
    DesiredSpec::new()
        .attribute("location", "eastus2")
        .reference(SOURCE_REFERENCE, key(ResourceKind::MySqlServer, source))
}

/// Records every committed delta before handing it to the store.
pub struct RecordingSink {
    store: Arc<InstanceStore>,
    commits: Mutex<Vec<StatusDelta>>,
}

impl RecordingSink {
    pub fn commits(&self) -> Vec<StatusDelta> {
        self.commits.lock().unwrap().clone()
    }

    pub fn commits_for(&self, key: &InstanceKey) -> usize {
        self.commits
            .lock()
            .unwrap()
            .iter()
            .filter(|d| &d.key == key)
            .count()
    }
}

impl StatusSink for RecordingSink {
    fn commit(&self, delta: StatusDelta) {
        self.commits.lock().unwrap().push(delta.clone());
        self.store.commit(delta);
    }
}

/// Controller wired to a simulated control plane and an in-memory store.
pub struct Harness {
    pub sim: Arc<SimulatedControlPlane>,
    pub store: Arc<InstanceStore>,
    pub sink: Arc<RecordingSink>,
    pub controller: Arc<ConvergenceController>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_sim(SimulatedControlPlane::new(), test_config())
    }

    pub fn with_sim(sim: SimulatedControlPlane, config: EngineConfig) -> Self {
        let sim = Arc::new(sim);
        let store = Arc::new(InstanceStore::new());
        let sink = Arc::new(RecordingSink {
            store: store.clone(),
            commits: Mutex::new(Vec::new()),
        });
        let managers = ManagerRegistry::standard(sim.clone(), &config);
        let controller = Arc::new(ConvergenceController::new(
            &config,
            managers,
            store.clone(),
            sink.clone(),
        ));
        Self {
            sim,
            store,
            sink,
            controller,
        }
    }

    /// One pass for a tracked instance.
    pub async fn pass(&self, key: &InstanceKey) -> Outcome {
        let instance = self.store.get(key).expect("instance is tracked");
        self.controller
            .reconcile(&instance, &Cancellation::never())
            .await
    }

    pub fn status(&self, key: &InstanceKey) -> ResourceStatus {
        self.store.status(key).expect("instance is tracked")
    }
}

/// A request seen by [`MockArm`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub authorization: Option<String>,
    pub user_agent: Option<String>,
}

struct Injected {
    status: StatusCode,
    body: Value,
    retry_after: Option<u64>,
}

#[derive(Default)]
struct MockState {
    base_url: String,
    resources: HashMap<String, Value>,
    /// Operation id to (resource path, polls left).
    operations: HashMap<String, (String, u32)>,
    requests: Vec<Recorded>,
    failures: Vec<Injected>,
    latency: u32,
    next_op: u64,
}

type Shared = Arc<Mutex<MockState>>;

/// Minimal ARM-style control plane served over HTTP.
pub struct MockArm {
    pub addr: SocketAddr,
    state: Shared,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl MockArm {
    /// Spawn a server whose PUTs complete after `latency` status polls.
    pub async fn spawn(latency: u32) -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState {
            latency,
            ..Default::default()
        }));
        let router = Router::new().fallback(handle).with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();
        state.lock().unwrap().base_url = format!("http://{addr}");

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            state,
            shutdown_tx,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answer the next request with `status` and an ARM error body.
    pub fn fail_next(&self, status: StatusCode, code: &str, retry_after: Option<u64>) {
        self.state.lock().unwrap().failures.push(Injected {
            status,
            body: json!({"error": {"code": code, "message": format!("injected {code}")}}),
            retry_after,
        });
    }

    pub fn insert(&self, path: &str, body: Value) {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(path.to_string(), body);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().unwrap().resources.contains_key(path)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count(&self, method: Method) -> usize {
        self.requests().iter().filter(|r| r.method == method).count()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn not_found(path: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(json!({"error": {"code": "ResourceNotFound", "message": format!("{path} not found")}})),
    )
        .into_response()
}

async fn handle(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let mut state = state.lock().unwrap();
    state.requests.push(Recorded {
        method: method.clone(),
        path: path.clone(),
        query: uri.query().unwrap_or_default().to_string(),
        authorization: header("authorization"),
        user_agent: header("user-agent"),
    });

    if !state.failures.is_empty() {
        let injected = state.failures.remove(0);
        let mut response = (injected.status, axum::Json(injected.body)).into_response();
        if let Some(secs) = injected.retry_after {
            response
                .headers_mut()
                .insert("retry-after", secs.to_string().parse().unwrap());
        }
        return response;
    }

    if let Some(id) = path.strip_prefix("/operations/") {
        let Some((resource, left)) = state.operations.get_mut(id) else {
            return not_found(&path);
        };
        *left = left.saturating_sub(1);
        if *left > 0 {
            return axum::Json(json!({"status": "InProgress"})).into_response();
        }
        let resource = resource.clone();
        state.operations.remove(id);
        if let Some(body) = state.resources.get_mut(&resource) {
            body["properties"]["provisioningState"] = json!("Succeeded");
        }
        return axum::Json(json!({"status": "Succeeded"})).into_response();
    }

    if path.ends_with("/checkNameAvailability") {
        let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        let name = request["name"].as_str().unwrap_or_default();
        let taken = state
            .resources
            .keys()
            .any(|p| p.rsplit('/').next() == Some(name));
        return if taken {
            axum::Json(json!({"nameAvailable": false, "reason": "AlreadyExists", "message": "in use"}))
                .into_response()
        } else {
            axum::Json(json!({"nameAvailable": true})).into_response()
        };
    }

    match method {
        Method::HEAD => {
            let name = path.rsplit('/').next().unwrap_or_default().to_string();
            let taken = state.resources.keys().any(|p| p.ends_with(&format!("/{name}")));
            if taken {
                StatusCode::OK.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        Method::GET => match state.resources.get(&path) {
            Some(resource) => axum::Json(resource.clone()).into_response(),
            None => not_found(&path),
        },
        Method::PUT => {
            let request: Value = serde_json::from_slice(&body).unwrap_or(json!({}));
            let mut resource = request.clone();
            resource["id"] = json!(path);
            resource["name"] = json!(path.rsplit('/').next().unwrap_or_default());
            if !resource["properties"].is_object() {
                resource["properties"] = json!({});
            }

            if state.latency == 0 {
                resource["properties"]["provisioningState"] = json!("Succeeded");
                state.resources.insert(path, resource.clone());
                return (StatusCode::OK, axum::Json(resource)).into_response();
            }

            resource["properties"]["provisioningState"] = json!("Creating");
            state.resources.insert(path.clone(), resource.clone());
            state.next_op += 1;
            let id = format!("op-{}", state.next_op);
            let latency = state.latency;
            state.operations.insert(id.clone(), (path, latency));

            let mut response = (StatusCode::CREATED, axum::Json(resource)).into_response();
            let url = format!("{}/operations/{id}", state.base_url);
            response
                .headers_mut()
                .insert("azure-asyncoperation", url.parse().unwrap());
            response
                .headers_mut()
                .insert("retry-after", "0".parse().unwrap());
            response
        }
        Method::DELETE => {
            let prefix = format!("{path}/");
            let existed = state.resources.remove(&path).is_some();
            state.resources.retain(|p, _| !p.starts_with(&prefix));
            if existed {
                StatusCode::OK.into_response()
            } else {
                StatusCode::NO_CONTENT.into_response()
            }
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}
