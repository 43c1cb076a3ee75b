use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Returned by [`ConcurrencyGate::acquire`] once the gate has been closed.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("concurrency gate is closed")]
pub struct GateClosed;

/// Caps the number of simultaneous outbound calls.
///
/// Backed by a tokio semaphore, so waiters queue in FIFO order and suspend
/// rather than spin. Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Permission to run one call. Dropping the slot returns it to the pool,
/// which also covers panics and cancelled futures.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    /// Give the slot back explicitly. Consumes it, so it cannot be
    /// released twice.
    pub fn release(self) {}
}

impl ConcurrencyGate {
    /// `limit` is clamped to at least one slot.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<Slot, GateClosed> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateClosed)?;
        Ok(Slot { _permit: permit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    /// Reject every pending and future `acquire`. Held slots stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn slots_are_counted_and_returned() {
        let gate = ConcurrencyGate::new(2);
        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_use(), 2);

        a.release();
        assert_eq!(gate.in_use(), 1);
        drop(b);
        assert_eq!(gate.in_use(), 0);
    }

    #[tokio::test]
    async fn zero_limit_becomes_one() {
        let gate = ConcurrencyGate::new(0);
        assert_eq!(gate.limit(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_release() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_gate_rejects_acquire() {
        let gate = ConcurrencyGate::new(1);
        gate.close();
        assert!(gate.is_closed());
        assert_eq!(gate.acquire().await.unwrap_err(), GateClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_does_not_leak() {
        let gate = ConcurrencyGate::new(1);
        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _slot = gate.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(gate.in_use(), 1);

        holder.abort();
        let _ = holder.await;
        assert_eq!(gate.in_use(), 0);
    }
}
