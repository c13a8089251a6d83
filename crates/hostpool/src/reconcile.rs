//! Startup reconciliation: remove hosts a previous run left behind.
//!
//! Runs once before the server accepts requests. Every listed host whose name
//! starts with the pool prefix is destroyed; any failure aborts the run so the
//! process exits instead of serving with an unknown number of stray hosts.

use std::sync::Arc;

use tracing::info;

use crate::backend::{BackendError, HostSummary, ProvisioningBackend};
use crate::host::HostId;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to list hosts: {0}")]
    List(#[source] BackendError),

    #[error("failed to destroy host {name} ({id}): {source}")]
    Destroy {
        name: String,
        id: HostId,
        #[source]
        source: BackendError,
    },
}

/// Outcome of a completed reconciliation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub destroyed: Vec<HostSummary>,
    /// Listed hosts outside the pool.
    pub skipped: usize,
}

pub struct StartupReconciler {
    backend: Arc<dyn ProvisioningBackend>,
    prefix: String,
}

impl StartupReconciler {
    pub fn new(backend: Arc<dyn ProvisioningBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// List, filter by prefix, destroy matches in listing order.
    pub async fn run(&self) -> Result<ReconcileReport, ReconcileError> {
        let hosts = self.backend.list().await.map_err(ReconcileError::List)?;
        info!(prefix = %self.prefix, listed = hosts.len(), "Reconciling existing hosts");

        let mut report = ReconcileReport::default();
        for host in hosts {
            if !host.name.starts_with(&self.prefix) {
                report.skipped += 1;
                continue;
            }

            info!(host = %host.name, host_id = %host.id, "Destroying stray host");
            if let Err(source) = self.backend.destroy(&host.id).await {
                return Err(ReconcileError::Destroy {
                    name: host.name,
                    id: host.id,
                    source,
                });
            }
            report.destroyed.push(host);
        }

        info!(
            destroyed = report.destroyed.len(),
            skipped = report.skipped,
            "Reconciliation complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    fn listing() -> MockBackend {
        MockBackend::active("unused").with_listing(&[
            ("pool.111", "a"),
            ("pool.222", "b"),
            ("other.1", "c"),
        ])
    }

    #[tokio::test]
    async fn destroys_only_prefixed_hosts() {
        let backend = Arc::new(listing());
        let report = StartupReconciler::new(backend.clone(), "pool.")
            .run()
            .await
            .unwrap();

        assert_eq!(backend.destroyed(), vec![HostId::new("a"), HostId::new("b")]);
        assert_eq!(report.destroyed.len(), 2);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn prefix_requires_separator() {
        let backend = Arc::new(MockBackend::active("unused").with_listing(&[
            ("poolside.1", "x"),
            ("pool.1", "y"),
        ]));
        StartupReconciler::new(backend.clone(), "pool.")
            .run()
            .await
            .unwrap();
        assert_eq!(backend.destroyed(), vec![HostId::new("y")]);
    }

    #[tokio::test]
    async fn empty_listing_is_a_no_op() {
        let backend = Arc::new(MockBackend::active("unused"));
        let report = StartupReconciler::new(backend.clone(), "pool.")
            .run()
            .await
            .unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(backend.destroy_count(), 0);
    }

    #[tokio::test]
    async fn list_failure_aborts() {
        let mut backend = listing();
        backend.list_fails = true;
        let backend = Arc::new(backend);

        let err = StartupReconciler::new(backend.clone(), "pool.")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::List(_)));
        assert_eq!(backend.destroy_count(), 0);
    }

    #[tokio::test]
    async fn destroy_failure_stops_at_first_error() {
        let mut backend = listing();
        backend.fail_destroy_of = Some(HostId::new("a"));
        let backend = Arc::new(backend);

        let err = StartupReconciler::new(backend.clone(), "pool.")
            .run()
            .await
            .unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"failed to destroy host pool.111 (a): API request returned 500 Internal Server Error (destroy)"
        );
        assert_eq!(backend.destroyed(), vec![HostId::new("a")]);
    }
}
