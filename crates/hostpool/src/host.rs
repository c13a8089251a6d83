//! Host state tracking.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Backend-assigned host identifier.
///
/// Some backends hand out numeric ids; they are carried as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Requested,
    Provisioning,
    Active,
    Destroying,
    Destroyed,
    /// Provisioning error; nothing to destroy.
    Failed,
    /// Caller left before the host was handed over; destroyed right after creation.
    Abandoned,
}

impl HostStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed | Self::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote host, owned by its lifecycle task.
#[derive(Debug)]
pub struct Host {
    name: String,
    id: Option<HostId>,
    ip_address: Option<String>,
    status: HostStatus,
    requested_at: Instant,
    activated_at: Option<Instant>,
}

impl Host {
    pub fn new(name: String) -> Self {
        Self {
            name,
            id: None,
            ip_address: None,
            status: HostStatus::Requested,
            requested_at: Instant::now(),
            activated_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<&HostId> {
        self.id.as_ref()
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    pub fn status(&self) -> HostStatus {
        self.status
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.requested_at.elapsed()
    }

    pub fn active_for(&self) -> Option<std::time::Duration> {
        self.activated_at.map(|t| t.elapsed())
    }

    pub fn set_provisioning(&mut self) {
        self.status = HostStatus::Provisioning;
    }

    pub fn set_id(&mut self, id: HostId) {
        self.id = Some(id);
    }

    pub fn set_active(&mut self, ip_address: String) {
        self.status = HostStatus::Active;
        self.ip_address = Some(ip_address);
        self.activated_at = Some(Instant::now());
    }

    pub fn set_failed(&mut self) {
        self.status = HostStatus::Failed;
    }

    pub fn set_abandoned(&mut self) {
        self.status = HostStatus::Abandoned;
    }

    pub fn set_destroying(&mut self) {
        self.status = HostStatus::Destroying;
    }

    pub fn set_destroyed(&mut self) {
        self.status = HostStatus::Destroyed;
    }
}

/// Build a host name under the pool prefix: `{pool}.{unix_seconds}-{8 hex}`.
pub fn host_name(pool: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{pool}.{}-{}", chrono::Utc::now().timestamp(), &suffix[..8])
}

/// Prefix every host of `pool` carries.
pub fn pool_prefix(pool: &str) -> String {
    format!("{pool}.")
}
