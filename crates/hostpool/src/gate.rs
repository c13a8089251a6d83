//! Admission gate: bounded counting semaphore over host capacity.
//!
//! A `Slot` is one unit of capacity. It is returned to the gate exactly once:
//! either explicitly via `Slot::release` after the host is gone, or on drop
//! (which is logged as a bug, since the lifecycle should always release
//! explicitly).

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    #[error("capacity must be at least 1")]
    ZeroCapacity,
    #[error("capacity {requested} exceeds the maximum of {max}")]
    TooLarge { requested: usize, max: usize },
    #[error("admission gate closed")]
    Closed,
}

/// Bounded admission gate shared by every request.
///
/// Waiters are served in FIFO order by the underlying tokio semaphore, so no
/// waiter starves while slots keep being released.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Result<Self, GateError> {
        if capacity == 0 {
            return Err(GateError::ZeroCapacity);
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(GateError::TooLarge {
                requested: capacity,
                max: Semaphore::MAX_PERMITS,
            });
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// Wait until fewer than `capacity` slots are outstanding, then take one.
    ///
    /// Cancel-safe: dropping the future before it resolves takes no slot.
    pub async fn acquire(&self) -> Result<Slot, GateError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;
        Ok(Slot {
            permit: Some(permit),
        })
    }

    #[cfg(test)]
    fn try_acquire(&self) -> Option<Slot> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot {
                permit: Some(permit),
            })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held (provisioning, active, or being destroyed).
    pub fn outstanding(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop admitting. Pending and future `acquire` calls fail with `Closed`;
    /// held slots are unaffected.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// One unit of capacity, owned by a single lifecycle.
#[must_use = "a slot must be released once its host is destroyed"]
#[derive(Debug)]
pub struct Slot {
    permit: Option<OwnedSemaphorePermit>,
}

impl Slot {
    /// Return the slot to the gate.
    pub fn release(mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            tracing::debug!("Slot released");
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.permit.is_some() {
            tracing::error!("Slot dropped without explicit release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_capacity_rejected() {
        assert!(matches!(AdmissionGate::new(0), Err(GateError::ZeroCapacity)));
    }

    #[test]
    fn capacity_above_semaphore_limit_rejected() {
        let err = AdmissionGate::new(1usize << 62).unwrap_err();
        assert!(matches!(err, GateError::TooLarge { max, .. } if max == Semaphore::MAX_PERMITS));

        let gate = AdmissionGate::new(Semaphore::MAX_PERMITS).unwrap();
        assert_eq!(gate.capacity(), Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn acquire_up_to_capacity() {
        let gate = AdmissionGate::new(2).unwrap();

        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        assert_eq!(gate.outstanding(), 2);
        assert!(gate.try_acquire().is_none());

        a.release();
        assert_eq!(gate.outstanding(), 1);
        b.release();
        assert_eq!(gate.outstanding(), 0);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_proceeds_only_after_release() {
        let gate = Arc::new(AdmissionGate::new(1).unwrap());
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire().await.map(Slot::release) })
        };

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!waiter.is_finished());
        assert_eq!(gate.outstanding(), 1);

        held.release();
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.outstanding(), 0);
    }

    #[tokio::test]
    async fn dropped_acquire_takes_no_slot() {
        let gate = AdmissionGate::new(1).unwrap();
        let held = gate.acquire().await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(10), gate.acquire()).await;
        assert!(attempt.is_err());

        held.release();
        assert_eq!(gate.outstanding(), 0);
    }

    #[tokio::test]
    async fn dropped_slot_still_returns_capacity() {
        let gate = AdmissionGate::new(1).unwrap();
        {
            let _slot = gate.acquire().await.unwrap();
        }
        assert!(gate.try_acquire().is_some_and(|s| {
            s.release();
            true
        }));
    }

    #[tokio::test]
    async fn close_fails_pending_acquire() {
        let gate = Arc::new(AdmissionGate::new(1).unwrap());
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire().await.map(Slot::release) })
        };
        tokio::task::yield_now().await;

        gate.close();
        assert!(matches!(waiter.await.unwrap(), Err(GateError::Closed)));
        held.release();
    }
}
