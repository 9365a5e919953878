//! Bounded concurrent task admission.
//!
//! A [`Throttler`] limits how many tasks of a [`TaskGroup`] run at once.
//! [`Throttler::schedule`] suspends until a permit is free, then spawns the
//! task with the permit attached. The permit is returned when the task
//! finishes, or earlier if the task calls [`yield_slot`] from its own
//! context; the release happens exactly once either way.

use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::task_group::TaskGroup;

#[derive(Debug, Error)]
pub enum ThrottlerError {
    #[error("throttler closed")]
    Closed,

    #[error("yield_slot called outside a throttled task")]
    NotThrottled,
}

/// Ownership of one concurrency permit for a single running task.
struct Slot {
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Slot {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Mutex::new(Some(permit)),
        }
    }

    /// Idempotent: only the first call drops the permit.
    fn release(&self) {
        let _ = self.permit.lock().unwrap().take();
    }
}

tokio::task_local! {
    static CURRENT_SLOT: Arc<Slot>;
}

/// Release the calling task's concurrency slot early, letting another task
/// start while the current one keeps running. Must be called from a task
/// scheduled through a [`Throttler`].
pub fn yield_slot() -> Result<(), ThrottlerError> {
    CURRENT_SLOT
        .try_with(|slot| slot.release())
        .map_err(|_| ThrottlerError::NotThrottled)
}

/// Concurrency throttler over a supervised task group.
pub struct Throttler<E> {
    group: Arc<TaskGroup<E>>,
    semaphore: Arc<Semaphore>,
}

impl<E> Throttler<E>
where
    E: std::error::Error + Send + 'static,
{
    pub fn new(group: Arc<TaskGroup<E>>, concurrency: usize) -> Self {
        Self {
            group,
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    /// Acquire a permit, then spawn `future` bound to the group.
    ///
    /// The permit travels inside the spawned task, so a task that is never
    /// polled (group cancelled) still returns its capacity on drop.
    pub async fn schedule<F>(&self, future: F) -> Result<(), ThrottlerError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ThrottlerError::Closed)?;

        let slot = Arc::new(Slot::new(permit));
        let task_slot = Arc::clone(&slot);
        self.group.spawn(CURRENT_SLOT.scope(task_slot, async move {
            let result = future.await;
            slot.release();
            result
        }));

        Ok(())
    }
}
