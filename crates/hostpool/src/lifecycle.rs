//! Host lifecycle: drives one host from slot acquisition to teardown.
//!
//! Flow (one spawned task per host):
//! 1. `Provisioning`: create, settle, poll the provisioning event until 100%,
//!    then describe the host and require status "active".
//! 2. On failure: `Failed`, report the error, release the slot. No destroy.
//! 3. On success with the cancel signal already raised: `Abandoned`, destroy,
//!    release the slot. The caller never sees the address.
//! 4. Otherwise: `Active`, hand the address to the caller, wait for the
//!    cancel signal, then `Destroying` -> destroy -> `Destroyed`, release.
//!
//! The cancel signal is only consulted between phases. A create/poll sequence
//! that has started always runs to completion, since a half-created host has
//! no id to destroy by.
//!
//! A host that fails after `create` returned its id is not destroyed here: it
//! keeps running until the next startup reconciliation removes it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, HostSpec, ProvisioningBackend};
use crate::gate::Slot;
use crate::host::{Host, HostId, HostStatus};
use crate::signal::{CancelReason, CancelSignal};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Host not active: {name} (status: {status})")]
    ProvisioningFailed { name: String, status: String },

    #[error("Host active without an IP address: {name}")]
    MissingAddress { name: String },

    #[error("Host request cancelled ({0})")]
    Cancelled(CancelReason),

    #[error("Host lifecycle ended without a result")]
    Lost,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Wait before the first event poll.
    pub settle_delay: Duration,
    /// Wait between event polls.
    pub poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
        }
    }
}

type HostResult = Result<String, LifecycleError>;

/// State owned by the lifecycle task. Consumed by `spawn`.
pub struct HostLifecycle {
    backend: Arc<dyn ProvisioningBackend>,
    config: LifecycleConfig,
    host: Host,
    cancel: CancelSignal,
    status_tx: watch::Sender<HostStatus>,
    done: CancellationToken,
}

/// The coordinator's view of a running lifecycle.
pub struct LifecycleHandle {
    name: String,
    cancel: CancelSignal,
    status: watch::Receiver<HostStatus>,
    done: CancellationToken,
    result: Option<oneshot::Receiver<HostResult>>,
    task: JoinHandle<HostStatus>,
}

impl LifecycleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Raise the host's cancel signal. Idempotent.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.cancel.raise(reason)
    }

    pub fn status(&self) -> HostStatus {
        *self.status.borrow()
    }

    pub fn status_rx(&self) -> watch::Receiver<HostStatus> {
        self.status.clone()
    }

    /// Token cancelled when the lifecycle task has finished (slot released).
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Wait for the provisioning outcome. Yields the IP address on success.
    ///
    /// Cancel-safe; calling again after it resolved returns `Lost`.
    pub async fn result(&mut self) -> HostResult {
        let Some(rx) = self.result.as_mut() else {
            return Err(LifecycleError::Lost);
        };
        let outcome = rx.await.unwrap_or(Err(LifecycleError::Lost));
        self.result = None;
        outcome
    }

    /// Wait for the task to finish and return the final host status.
    pub async fn finished(self) -> HostStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                error!(host = %self.name, error = %e, "Lifecycle task panicked");
                HostStatus::Failed
            }
        }
    }
}

impl HostLifecycle {
    pub fn new(
        backend: Arc<dyn ProvisioningBackend>,
        config: LifecycleConfig,
        name: String,
    ) -> Self {
        let (status_tx, _) = watch::channel(HostStatus::Requested);
        Self {
            backend,
            config,
            host: Host::new(name),
            cancel: CancelSignal::new(),
            status_tx,
            done: CancellationToken::new(),
        }
    }

    /// Start the lifecycle on `tracker`, taking ownership of `slot`.
    pub fn spawn(self, slot: Slot, tracker: &TaskTracker) -> LifecycleHandle {
        let (result_tx, result_rx) = oneshot::channel();
        let name = self.host.name().to_string();
        let cancel = self.cancel.clone();
        let status = self.status_tx.subscribe();
        let done = self.done.clone();

        let task = tracker.spawn(self.run(slot, result_tx));

        LifecycleHandle {
            name,
            cancel,
            status,
            done,
            result: Some(result_rx),
            task,
        }
    }

    fn set_status(&mut self, status: HostStatus) {
        debug_assert!(
            !self.host.status().is_terminal(),
            "transition out of terminal state {}",
            self.host.status()
        );
        match status {
            HostStatus::Provisioning => self.host.set_provisioning(),
            HostStatus::Failed => self.host.set_failed(),
            HostStatus::Abandoned => self.host.set_abandoned(),
            HostStatus::Destroying => self.host.set_destroying(),
            HostStatus::Destroyed => self.host.set_destroyed(),
            HostStatus::Requested | HostStatus::Active => {}
        }
        self.status_tx.send_replace(self.host.status());
    }

    async fn run(mut self, slot: Slot, result_tx: oneshot::Sender<HostResult>) -> HostStatus {
        let _done = self.done.clone().drop_guard();
        self.set_status(HostStatus::Provisioning);

        let ip = match self.provision().await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(host = %self.host.name(), error = %e, "Host provisioning failed");
                if let Some(id) = self.host.id() {
                    warn!(
                        host = %self.host.name(),
                        host_id = %id,
                        "Host left in place; startup reconciliation will remove it"
                    );
                }
                self.set_status(HostStatus::Failed);
                slot.release();
                let _ = result_tx.send(Err(e));
                return HostStatus::Failed;
            }
        };

        if let Some(reason) = self.cancel.reason() {
            info!(host = %self.host.name(), %reason, "Host cancelled during creation");
            self.set_status(HostStatus::Abandoned);
            let _ = result_tx.send(Err(LifecycleError::Cancelled(reason)));
            self.destroy().await;
            slot.release();
            return HostStatus::Abandoned;
        }

        self.host.set_active(ip.clone());
        self.status_tx.send_replace(HostStatus::Active);
        info!(host = %self.host.name(), ip = %ip, elapsed = ?self.host.elapsed(), "Host active");

        if result_tx.send(Ok(ip)).is_err() {
            // Nobody is waiting for the address.
            self.cancel.raise(CancelReason::Disconnect);
        }

        self.cancel.raised().await;
        let reason = self.cancel.reason().unwrap_or(CancelReason::Disconnect);
        info!(
            host = %self.host.name(),
            %reason,
            active_for = ?self.host.active_for().unwrap_or_default(),
            "Destroying host"
        );

        self.set_status(HostStatus::Destroying);
        self.destroy().await;
        self.set_status(HostStatus::Destroyed);
        slot.release();
        HostStatus::Destroyed
    }

    async fn provision(&mut self) -> HostResult {
        let spec = HostSpec {
            name: self.host.name().to_string(),
        };
        let created = self.backend.create(&spec).await?;
        self.host.set_id(created.id.clone());
        debug!(
            host = %spec.name,
            host_id = %created.id,
            event_id = %created.event_id,
            "Create accepted, waiting for provisioning event"
        );

        tokio::time::sleep(self.config.settle_delay).await;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let percent = self.backend.poll_event(&created.event_id).await?;
            if percent >= 100 {
                break;
            }
            debug!(host = %spec.name, percent, "Provisioning in progress");
        }

        let info = self.backend.describe(&created.id).await?;
        if !info.is_active() {
            return Err(LifecycleError::ProvisioningFailed {
                name: info.name,
                status: info.status,
            });
        }
        info.ip_address
            .ok_or(LifecycleError::MissingAddress { name: info.name })
    }

    /// Single destroy attempt. Failures are logged, never returned.
    async fn destroy(&mut self) {
        let Some(id) = self.host.id().cloned() else {
            return;
        };
        match self.backend.destroy(&id).await {
            Ok(()) => info!(host = %self.host.name(), host_id = %id, "Host destroyed"),
            Err(e) => log_destroy_failure(self.host.name(), &id, &e),
        }
    }
}

fn log_destroy_failure(name: &str, id: &HostId, e: &BackendError) {
    error!(host = %name, host_id = %id, error = %e, "Failed to destroy host");
}
