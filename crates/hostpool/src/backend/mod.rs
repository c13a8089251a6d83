//! Provisioning backend abstraction.
//!
//! The lifecycle and reconciler depend only on `ProvisioningBackend`; the
//! concrete HTTP client lives in `digitalocean`.

pub mod digitalocean;

use async_trait::async_trait;

use crate::host::HostId;

pub use digitalocean::DigitalOceanClient;

/// What to create. Image, size, region and key come from the backend's own config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub name: String,
}

/// Result of a create call: the host id and the event tracking its provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedHost {
    pub id: HostId,
    pub event_id: String,
}

/// Host as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub status: String,
    pub ip_address: Option<String>,
    pub name: String,
}

impl HostInfo {
    pub const ACTIVE: &'static str = "active";

    pub fn is_active(&self) -> bool {
        self.status == Self::ACTIVE
    }
}

/// Entry in a backend listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSummary {
    pub id: HostId,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API request returned {status}{}", fmt_body(.body))]
    Status { status: String, body: String },

    #[error("API response status not OK: {status}{}", fmt_body(.message))]
    Api { status: String, message: String },

    #[error("unexpected API response: {0}")]
    Decode(String),
}

fn fmt_body(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(" ({body})")
    }
}

/// The four host operations plus listing.
///
/// None of these are retried; a failure is reported once to the caller.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Begin provisioning a host.
    async fn create(&self, spec: &HostSpec) -> Result<CreatedHost, BackendError>;

    /// Percent complete (0-100) of a provisioning event.
    async fn poll_event(&self, event_id: &str) -> Result<u8, BackendError>;

    async fn describe(&self, id: &HostId) -> Result<HostInfo, BackendError>;

    async fn destroy(&self, id: &HostId) -> Result<(), BackendError>;

    async fn list(&self) -> Result<Vec<HostSummary>, BackendError>;
}
