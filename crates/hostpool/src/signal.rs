//! One-shot signals shared between the request boundary and a host lifecycle.
//!
//! - `CancelSignal`: tells a lifecycle to tear its host down. Raising it any
//!   number of times has the same effect as raising it once.
//! - `DisconnectNotice`: read side of "the caller is gone". Fired by dropping
//!   the matching `DisconnectGuard`, which the transport ties to the lifetime
//!   of the caller's connection.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Why a cancel signal was raised. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller went away.
    Disconnect,
    /// The post-activation timeout elapsed.
    Timeout,
    /// The process is shutting down.
    Shutdown,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnect => "disconnect",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotent, cloneable cancel token for one host.
///
/// The first raise wins: its reason is latched and later raises are no-ops.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: std::sync::Arc<std::sync::OnceLock<CancelReason>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `true` only for the call that actually raised it.
    pub fn raise(&self, reason: CancelReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Wait until the signal is raised. Returns immediately if it already was.
    pub async fn raised(&self) {
        self.token.cancelled().await;
    }

    /// Raise the signal with `CancelReason::Timeout` once `after` elapses.
    ///
    /// Resolves early if the signal is raised for any other reason.
    pub async fn raise_after(self, after: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(after) => {
                self.raise(CancelReason::Timeout);
            }
            _ = self.raised() => {}
        }
    }
}

/// Read side of a caller disconnect. Never blocks when queried.
#[derive(Debug, Clone)]
pub struct DisconnectNotice {
    token: CancellationToken,
}

impl DisconnectNotice {
    /// Create a notice with the guard that fires it.
    pub fn pair() -> (Self, DisconnectGuard) {
        let token = CancellationToken::new();
        (
            Self {
                token: token.clone(),
            },
            DisconnectGuard { token: Some(token) },
        )
    }

    /// A notice that never fires (for callers without a connection).
    pub fn never() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn disconnected(&self) {
        self.token.cancelled().await;
    }
}

/// Fires the paired `DisconnectNotice` on drop unless disarmed.
///
/// The HTTP handler holds this for as long as the caller is owed a response.
/// When the connection drops, axum drops the handler future (or the body
/// stream) and the guard with it.
#[derive(Debug)]
pub struct DisconnectGuard {
    token: Option<CancellationToken>,
}

impl DisconnectGuard {
    /// Fire the notice now.
    pub fn fire(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    /// The response was delivered; dropping the guard no longer signals anything.
    pub fn disarm(&mut self) {
        self.token = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_is_idempotent_and_keeps_first_reason() {
        let signal = CancelSignal::new();
        assert!(!signal.is_raised());
        assert!(signal.raise(CancelReason::Disconnect));
        assert!(!signal.raise(CancelReason::Timeout));
        assert!(!signal.raise(CancelReason::Disconnect));
        assert!(signal.is_raised());
        assert_eq!(signal.reason(), Some(CancelReason::Disconnect));
    }

    #[test]
    fn clones_share_state() {
        let signal = CancelSignal::new();
        let other = signal.clone();
        other.raise(CancelReason::Shutdown);
        assert!(signal.is_raised());
        assert_eq!(signal.reason(), Some(CancelReason::Shutdown));
    }

    #[tokio::test]
    async fn raised_returns_immediately_once_raised() {
        let signal = CancelSignal::new();
        signal.raise(CancelReason::Timeout);
        signal.raised().await;
    }

    #[tokio::test(start_paused = true)]
    async fn raise_after_fires_with_timeout_reason() {
        let signal = CancelSignal::new();
        let start = tokio::time::Instant::now();
        let timer = tokio::spawn(signal.clone().raise_after(Duration::from_secs(600)));

        signal.raised().await;
        assert!(start.elapsed() >= Duration::from_secs(600));
        assert_eq!(signal.reason(), Some(CancelReason::Timeout));
        timer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn raise_after_yields_to_earlier_cancel() {
        let signal = CancelSignal::new();
        let timer = tokio::spawn(signal.clone().raise_after(Duration::from_secs(600)));

        signal.raise(CancelReason::Disconnect);
        timer.await.unwrap();
        assert_eq!(signal.reason(), Some(CancelReason::Disconnect));
    }

    #[test]
    fn guard_fires_notice_on_drop() {
        let (notice, guard) = DisconnectNotice::pair();
        assert!(!notice.is_disconnected());
        drop(guard);
        assert!(notice.is_disconnected());
    }

    #[test]
    fn disarmed_guard_does_not_fire() {
        let (notice, mut guard) = DisconnectNotice::pair();
        guard.disarm();
        drop(guard);
        assert!(!notice.is_disconnected());
    }

    #[test]
    fn never_notice_stays_connected() {
        let notice = DisconnectNotice::never();
        assert!(!notice.is_disconnected());
    }
}
