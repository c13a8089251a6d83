//! RequestCoordinator: turns one caller request into one host lifecycle.
//!
//! Owns the admission gate, the live-host registry and the shutdown state.
//! Transports call `request_host` with a `DisconnectNotice` tied to the
//! caller's connection and relay the returned grant or error.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::backend::ProvisioningBackend;
use crate::gate::AdmissionGate;
use crate::host::{HostStatus, host_name};
use crate::lifecycle::{HostLifecycle, LifecycleConfig, LifecycleError, LifecycleHandle};
use crate::signal::{CancelReason, CancelSignal, DisconnectNotice};

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The caller is gone; nothing should be written back.
    #[error("Client disconnected")]
    Disconnected,

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub pool_name: String,
    /// Host lifetime after hand-over.
    pub timeout: Duration,
    pub lifecycle: LifecycleConfig,
}

/// A host handed to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostGrant {
    pub name: String,
    pub ip_address: String,
    pub expires_in: Duration,
}

/// Point-in-time view of one live host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    pub name: String,
    pub status: HostStatus,
}

struct LiveHost {
    cancel: CancelSignal,
    status: watch::Receiver<HostStatus>,
}

pub struct RequestCoordinator {
    gate: AdmissionGate,
    backend: Arc<dyn ProvisioningBackend>,
    config: CoordinatorConfig,
    live: Arc<DashMap<String, LiveHost>>,
    tracker: TaskTracker,
    shutdown_tx: watch::Sender<bool>,
}

impl RequestCoordinator {
    pub fn new(
        gate: AdmissionGate,
        backend: Arc<dyn ProvisioningBackend>,
        config: CoordinatorConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            gate,
            backend,
            config,
            live: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            shutdown_tx,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Wait for a slot, provision a host, and hand it over.
    ///
    /// On success the host's expiry timer is armed; the host is destroyed
    /// after `timeout` or as soon as `notice` fires, whichever is first.
    pub async fn request_host(&self, notice: DisconnectNotice) -> Result<HostGrant, RequestError> {
        if self.is_shutting_down() {
            return Err(RequestError::ShuttingDown);
        }
        info!(
            slots = self.gate.outstanding(),
            capacity = self.gate.capacity(),
            "Request to create host"
        );

        let slot = tokio::select! {
            biased;
            _ = notice.disconnected() => {
                info!("Client disconnected while in queue");
                return Err(RequestError::Disconnected);
            }
            slot = self.gate.acquire() => slot.map_err(|_| RequestError::ShuttingDown)?,
        };
        if notice.is_disconnected() {
            slot.release();
            info!("Client disconnected while in queue");
            return Err(RequestError::Disconnected);
        }

        let name = host_name(&self.config.pool_name);
        info!(
            host = %name,
            slots = self.gate.outstanding(),
            capacity = self.gate.capacity(),
            "Proceeding with host creation"
        );
        let lifecycle =
            HostLifecycle::new(Arc::clone(&self.backend), self.config.lifecycle.clone(), name);
        let mut handle = lifecycle.spawn(slot, &self.tracker);
        self.register(&handle);
        self.relay_disconnect(&notice, &handle);

        let ip = tokio::select! {
            result = handle.result() => result?,
            _ = notice.disconnected() => return Err(RequestError::Disconnected),
        };
        if notice.is_disconnected() {
            return Err(RequestError::Disconnected);
        }

        self.tracker
            .spawn(handle.cancel_signal().raise_after(self.config.timeout));
        info!(
            host = %handle.name(),
            ip = %ip,
            expires_in = ?self.config.timeout,
            "Host handed over"
        );
        Ok(HostGrant {
            name: handle.name().to_string(),
            ip_address: ip,
            expires_in: self.config.timeout,
        })
    }

    fn register(&self, handle: &LifecycleHandle) {
        let name = handle.name().to_string();
        self.live.insert(
            name.clone(),
            LiveHost {
                cancel: handle.cancel_signal(),
                status: handle.status_rx(),
            },
        );

        let live = Arc::clone(&self.live);
        let done = handle.done_token();
        self.tracker.spawn(async move {
            done.cancelled().await;
            live.remove(&name);
        });

        // Shutdown may have swept the registry before this insert.
        if self.is_shutting_down() {
            handle.cancel(CancelReason::Shutdown);
        }
    }

    /// Hosts whose lifecycle has not finished yet.
    pub fn snapshot(&self) -> Vec<HostSnapshot> {
        let mut hosts: Vec<_> = self
            .live
            .iter()
            .map(|entry| HostSnapshot {
                name: entry.key().clone(),
                status: *entry.value().status.borrow(),
            })
            .collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stop admitting and cancel every live host. Returns immediately.
    pub fn trigger_shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        self.gate.close();
        for entry in self.live.iter() {
            entry.value().cancel.raise(CancelReason::Shutdown);
        }
        self.tracker.close();
        info!(live = self.live.len(), "Shutdown triggered, destroying live hosts");
    }

    /// Trigger shutdown and wait up to `grace` for every lifecycle to finish.
    ///
    /// Returns `false` if some hosts were still being torn down at the deadline.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.trigger_shutdown();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                for host in self.snapshot() {
                    warn!(host = %host.name, status = %host.status, "Host still live at shutdown deadline");
                }
                false
            }
        }
    }

    /// Forward a caller disconnect to the host's cancel signal.
    ///
    /// Ends when the signal is raised for any reason or the lifecycle finishes.
    fn relay_disconnect(&self, notice: &DisconnectNotice, handle: &LifecycleHandle) {
        let notice = notice.clone();
        let cancel = handle.cancel_signal();
        let done = handle.done_token();
        let name = handle.name().to_string();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = notice.disconnected() => {
                    if cancel.raise(CancelReason::Disconnect) {
                        info!(host = %name, "Client disconnected, cancelling host");
                    }
                }
                _ = cancel.raised() => {}
                _ = done.cancelled() => {}
            }
        });
    }
}
