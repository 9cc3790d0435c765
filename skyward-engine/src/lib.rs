//! Skyward convergence engine.
//!
//! Drives cloud resources towards a declared desired state. Each
//! reconciliation pass resolves an instance's dependencies from tracked
//! state, calls the kind's resource manager, waits for the remote operation
//! to finish and commits the resulting status exactly once.

pub mod audit;
pub mod backoff;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod model;
pub mod naming;
pub mod operation;
pub mod remote;
pub mod resolver;
pub mod runner;
pub mod store;

pub use cancel::{CancelHandle, Cancellation, cancellation};
pub use config::{ConfigError, EngineConfig};
pub use controller::{ConvergenceController, Outcome, StatusDelta, StatusSink};
pub use credentials::{Authorizer, CredentialProvider, EnvironmentToken, StaticToken};
pub use error::{ClassifiedError, ErrorKind, RemoteFailure};
pub use manager::{ManagerRegistry, ResourceManager};
pub use model::{
    DependencyReference, DesiredSpec, InstanceKey, ProvisioningState, ResourceInstance,
    ResourceKind, ResourceStatus,
};
pub use remote::ControlPlane;
pub use remote::http::HttpControlPlane;
pub use remote::sim::SimulatedControlPlane;
pub use runner::{Engine, ReconcileEvent};
pub use store::InstanceStore;
