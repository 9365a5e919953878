//! Directory completion listeners.
//!
//! The analyzer walks an input tree top-down but must reduce results
//! bottom-up: a directory's reduction can only run once every child —
//! including nested subtrees — has produced a result. A
//! [`DirectoryListener`] collects one result channel per child; when the
//! walker leaves the directory the listener is completed, and a task owned
//! by the [`ListenerCoordinator`]'s group awaits every child, wraps failures
//! in a tagged variant, and runs the reduction callback under a global
//! listener gate (one callback body at a time).

use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tracing::trace;

use crate::task_group::TaskGroup;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("cannot add a child after directory is completed")]
    CompletedDirectory,

    #[error("listener callback already scheduled")]
    AlreadyScheduled,
}

/// One child's contribution to a directory reduction.
#[derive(Debug)]
pub enum ChildOutcome<T> {
    Completed(T),
    /// The child task died (failed or was cancelled) without delivering.
    Failed,
}

type Children<T> = Vec<oneshot::Receiver<T>>;

struct Inner<T> {
    /// `Some` while collecting; taken at completion.
    children: Mutex<Option<Children<T>>>,
    /// Fires once with the collected children.
    complete_tx: Mutex<Option<oneshot::Sender<Children<T>>>>,
    /// Consumed by `schedule_callback`.
    complete_rx: Mutex<Option<oneshot::Receiver<Children<T>>>>,
}

/// Handle to a directory's completion state.
///
/// Cloneable; one clone typically lives in the walker's `FileContext`
/// attachment slot so children can register themselves through their parent
/// back-reference.
pub struct DirectoryListener<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DirectoryListener<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> DirectoryListener<T> {
    fn new() -> Self {
        let (complete_tx, complete_rx) = oneshot::channel();
        Self {
            inner: Arc::new(Inner {
                children: Mutex::new(Some(Vec::new())),
                complete_tx: Mutex::new(Some(complete_tx)),
                complete_rx: Mutex::new(Some(complete_rx)),
            }),
        }
    }

    /// Register a child's result channel. Fails once the directory has been
    /// completed.
    pub fn add_child(&self, receiver: oneshot::Receiver<T>) -> Result<(), ListenerError> {
        match self.inner.children.lock().unwrap().as_mut() {
            Some(children) => {
                children.push(receiver);
                Ok(())
            }
            None => Err(ListenerError::CompletedDirectory),
        }
    }

    /// Mark the directory fully enumerated; no further children may be
    /// added. Idempotent.
    pub fn complete(&self) {
        let children = self.inner.children.lock().unwrap().take();
        if let Some(children) = children {
            trace!(children = children.len(), "directory listener completed");
            if let Some(tx) = self.inner.complete_tx.lock().unwrap().take() {
                let _ = tx.send(children);
            }
        }
    }
}

/// Creates listeners bound to one task group and serializes their callback
/// bodies through a single-permit gate.
pub struct ListenerCoordinator<E> {
    group: Arc<TaskGroup<E>>,
    callback_gate: Arc<Semaphore>,
}

impl<E> ListenerCoordinator<E>
where
    E: std::error::Error + Send + 'static,
{
    pub fn new(group: Arc<TaskGroup<E>>) -> Self {
        Self {
            group,
            callback_gate: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn register_directory<T: Send + 'static>(&self) -> DirectoryListener<T> {
        DirectoryListener::new()
    }

    /// Spawn the task that waits for the listener to complete, gathers every
    /// child outcome, and invokes `callback` under the global listener gate.
    ///
    /// Returns the channel carrying the callback's value; the caller
    /// registers it with the parent directory's listener. If the listener is
    /// abandoned (never completed, e.g. on cancellation) the callback does
    /// not run and the channel closes without a value. If the callback
    /// fails, its error fails the task group.
    pub fn schedule_callback<T, F, Fut>(
        &self,
        listener: &DirectoryListener<T>,
        callback: F,
    ) -> Result<oneshot::Receiver<T>, ListenerError>
    where
        T: Send + 'static,
        F: FnOnce(Vec<ChildOutcome<T>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let complete_rx = listener
            .inner
            .complete_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(ListenerError::AlreadyScheduled)?;

        let gate = Arc::clone(&self.callback_gate);
        let (result_tx, result_rx) = oneshot::channel();

        self.group.spawn(async move {
            let children = match complete_rx.await {
                Ok(children) => children,
                // Completion never fired: the walk was abandoned, so the
                // callback is abandoned too.
                Err(_) => return Ok(()),
            };

            let mut outcomes = Vec::with_capacity(children.len());
            for child in children {
                outcomes.push(match child.await {
                    Ok(value) => ChildOutcome::Completed(value),
                    Err(_) => ChildOutcome::Failed,
                });
            }

            let _permit = gate.acquire().await.expect("listener gate closed");
            let value = callback(outcomes).await?;
            let _ = result_tx.send(value);
            Ok(())
        });

        Ok(result_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("callback failed")]
    struct CallbackFailed;

    fn coordinator() -> (Arc<TaskGroup<CallbackFailed>>, ListenerCoordinator<CallbackFailed>) {
        let group = Arc::new(TaskGroup::new());
        let coordinator = ListenerCoordinator::new(Arc::clone(&group));
        (group, coordinator)
    }

    #[tokio::test]
    async fn callback_receives_child_results() {
        let (group, coordinator) = coordinator();
        let listener = coordinator.register_directory::<u32>();

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        listener.add_child(rx1).unwrap();
        listener.add_child(rx2).unwrap();

        let result_rx = coordinator
            .schedule_callback(&listener, |outcomes| async move {
                let sum = outcomes
                    .iter()
                    .map(|o| match o {
                        ChildOutcome::Completed(v) => *v,
                        ChildOutcome::Failed => 0,
                    })
                    .sum();
                Ok(sum)
            })
            .unwrap();

        tx1.send(3).unwrap();
        tx2.send(4).unwrap();
        listener.complete();

        group.join_all().await.unwrap();
        assert_eq!(result_rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn failed_children_are_tagged() {
        let (group, coordinator) = coordinator();
        let listener = coordinator.register_directory::<u32>();

        let (tx, rx) = oneshot::channel();
        let (dead_tx, dead_rx) = oneshot::channel::<u32>();
        listener.add_child(rx).unwrap();
        listener.add_child(dead_rx).unwrap();

        let result_rx = coordinator
            .schedule_callback(&listener, |outcomes| async move {
                let failed = outcomes
                    .iter()
                    .filter(|o| matches!(o, ChildOutcome::Failed))
                    .count() as u32;
                Ok(failed)
            })
            .unwrap();

        tx.send(1).unwrap();
        drop(dead_tx);
        listener.complete();

        group.join_all().await.unwrap();
        assert_eq!(result_rx.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn add_child_after_complete_fails() {
        let (_group, coordinator) = coordinator();
        let listener = coordinator.register_directory::<u32>();
        listener.complete();

        let (_tx, rx) = oneshot::channel();
        assert!(matches!(
            listener.add_child(rx),
            Err(ListenerError::CompletedDirectory)
        ));
    }

    #[tokio::test]
    async fn callbacks_fire_after_nested_children() {
        let (group, coordinator) = coordinator();

        // parent <- child directory <- grandchild file
        let parent = coordinator.register_directory::<u32>();
        let child = coordinator.register_directory::<u32>();

        let (leaf_tx, leaf_rx) = oneshot::channel();
        child.add_child(leaf_rx).unwrap();

        let child_rx = coordinator
            .schedule_callback(&child, |outcomes| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let sum = outcomes
                    .iter()
                    .map(|o| match o {
                        ChildOutcome::Completed(v) => *v,
                        ChildOutcome::Failed => 0,
                    })
                    .sum::<u32>();
                Ok(sum + 1)
            })
            .unwrap();
        parent.add_child(child_rx).unwrap();

        let parent_rx = coordinator
            .schedule_callback(&parent, |outcomes| async move {
                match &outcomes[0] {
                    ChildOutcome::Completed(v) => Ok(*v + 10),
                    ChildOutcome::Failed => Ok(0),
                }
            })
            .unwrap();

        child.complete();
        parent.complete();
        leaf_tx.send(100).unwrap();

        group.join_all().await.unwrap();
        assert_eq!(parent_rx.await.unwrap(), 111);
    }

    #[tokio::test]
    async fn callback_error_fails_the_group() {
        let (group, coordinator) = coordinator();
        let listener = coordinator.register_directory::<u32>();

        let _result_rx = coordinator
            .schedule_callback(&listener, |_outcomes| async move { Err(CallbackFailed) })
            .unwrap();
        listener.complete();

        assert!(group.join_all().await.is_err());
    }

    #[tokio::test]
    async fn abandoned_listener_abandons_callback() {
        let (group, coordinator) = coordinator();
        let listener = coordinator.register_directory::<u32>();

        let result_rx = coordinator
            .schedule_callback(&listener, |_outcomes| async move { Ok(42) })
            .unwrap();

        // Never completed: drop the listener instead.
        drop(listener);

        group.join_all().await.unwrap();
        assert!(result_rx.await.is_err());
    }
}
