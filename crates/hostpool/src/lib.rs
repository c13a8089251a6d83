//! hostpool: bounded pool of short-lived CI hosts behind a blocking HTTP API.
//!
//! Each `GET /hosts` waits for one of `capacity` slots, provisions a host on
//! the backend, answers with its IP address and destroys it once the caller
//! disconnects or the post-activation timeout elapses.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod gate;
pub mod host;
pub mod lifecycle;
pub mod reconcile;
pub mod signal;
pub mod transport;

pub use backend::{BackendError, DigitalOceanClient, ProvisioningBackend};
pub use config::{ConfigError, PoolConfig};
pub use coordinator::{
    CoordinatorConfig, HostGrant, HostSnapshot, RequestCoordinator, RequestError,
};
pub use gate::{AdmissionGate, GateError, Slot};
pub use host::{Host, HostId, HostStatus};
pub use lifecycle::{HostLifecycle, LifecycleConfig, LifecycleError, LifecycleHandle};
pub use reconcile::{ReconcileError, ReconcileReport, StartupReconciler};
pub use signal::{CancelReason, CancelSignal, DisconnectGuard, DisconnectNotice};
pub use transport::{ServerConfig, serve};
