//! Bounded dispatch: an inflight semaphore with a capped wait queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// The wait queue is full; the caller should fail fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Dispatch queue is full ({queue_depth} waiting)")]
pub struct QueueFull {
    pub queue_depth: usize,
}

/// Limits concurrent calls to `max_inflight`; up to `queue_depth` callers
/// may wait for a permit, later ones are refused.
#[derive(Debug)]
pub struct Dispatcher {
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_depth: usize,
}

/// Held for the duration of one attempt.
#[derive(Debug)]
pub struct DispatchPermit {
    _permit: OwnedSemaphorePermit,
}

/// One occupied queue position, released on drop even when the waiting
/// future is cancelled.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Dispatcher {
    pub fn new(max_inflight: usize, queue_depth: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_inflight.max(1))),
            waiting: AtomicUsize::new(0),
            queue_depth,
        }
    }

    pub async fn acquire(&self) -> Result<DispatchPermit, QueueFull> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(DispatchPermit { _permit: permit });
        }

        let full = QueueFull {
            queue_depth: self.queue_depth,
        };
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_depth {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(full);
        }
        let queued = QueueSlot(&self.waiting);
        let permit = self.semaphore.clone().acquire_owned().await;
        drop(queued);
        // The semaphore is never closed; treat closure as saturation.
        permit
            .map(|permit| DispatchPermit { _permit: permit })
            .map_err(|_| full)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queues_up_to_depth_then_refuses() {
        let dispatcher = Arc::new(Dispatcher::new(1, 1));
        let first = dispatcher.acquire().await.unwrap();
        assert_eq!(dispatcher.available(), 0);

        let queued = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.acquire().await.map(|_| ()) })
        };
        while dispatcher.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(dispatcher.acquire().await.unwrap_err(), QueueFull { queue_depth: 1 });

        drop(first);
        assert!(queued.await.unwrap().is_ok());
        assert_eq!(dispatcher.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_waiter_frees_its_queue_slot() {
        let dispatcher = Dispatcher::new(1, 1);
        let _held = dispatcher.acquire().await.unwrap();

        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(10), dispatcher.acquire()).await;
        assert!(waited.is_err());
        assert_eq!(dispatcher.waiting(), 0);

        // The queue has room again: this caller waits instead of failing.
        let queued =
            tokio::time::timeout(std::time::Duration::from_millis(10), dispatcher.acquire()).await;
        assert!(queued.is_err(), "expected the caller to queue, got {queued:?}");
        assert_eq!(dispatcher.waiting(), 0);
    }

    #[tokio::test]
    async fn zero_depth_fails_fast_when_saturated() {
        let dispatcher = Dispatcher::new(1, 0);
        let _held = dispatcher.acquire().await.unwrap();
        assert!(dispatcher.acquire().await.is_err());
    }
}
