use crate::errors::CoreError;
use crate::metrics;
use crate::settings;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Process-wide ceiling on outstanding remote calls.
///
/// One limiter is built at startup and handed to every component that talks to the node;
/// clones share the same permits. Waiting for a permit is the backpressure: callers block,
/// nothing is queued beyond the tasks already awaiting.
#[derive(Clone, Debug)]
pub struct CallLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
}

impl CallLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_settings(rpc: &settings::Rpc) -> Self {
        Self::new(rpc.max_concurrent_calls)
    }

    /// Waits for a free slot. The slot is returned when the permit is dropped, including when
    /// the owning future is cancelled.
    pub async fn acquire(&self) -> Result<CallPermit, CoreError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| CoreError::TransportFault("call limiter closed".to_string()))?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_rpc_calls_in_flight(now as f64);
        trace!(in_flight = now, capacity = self.capacity, "call permit acquired");
        Ok(CallPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One slot of the [`CallLimiter`].
#[derive(Debug)]
pub struct CallPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        let now = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_rpc_calls_in_flight(now as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permits_are_returned_on_drop() {
        let limiter = CallLimiter::new(2);
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);
        assert_eq!(limiter.in_flight(), 2);

        drop(a);
        assert_eq!(limiter.available(), 1);
        assert_eq!(limiter.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let limiter = CallLimiter::new(1);
        let held = limiter.acquire().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(waiting.is_err());
        drop(held);
        assert!(limiter.acquire().await.is_ok());
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        assert_eq!(CallLimiter::new(0).capacity(), 1);
    }
}
