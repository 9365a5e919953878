//! Supervised task groups.
//!
//! A [`TaskGroup`] collects spawned tasks and joins them as one unit: the
//! first task failure aborts every sibling still running, and the failure is
//! reported from [`TaskGroup::join_all`]. Panics are reported distinctly from
//! task errors.

use std::future::Future;
use std::sync::Mutex;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::debug;

/// Failure of a supervised group.
#[derive(Debug, Error)]
pub enum GroupError<E: std::error::Error> {
    #[error(transparent)]
    Task(E),

    #[error("task panicked: {0}")]
    Panic(String),
}

/// A set of supervised tasks joined (and cancelled) together.
///
/// Tasks are spawned while the group is being driven elsewhere; calling
/// [`TaskGroup::join_all`] drains the set, including tasks spawned after the
/// drain started. Dropping the group aborts everything still running.
pub struct TaskGroup<E> {
    set: Mutex<JoinSet<Result<(), E>>>,
}

impl<E> TaskGroup<E>
where
    E: std::error::Error + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            set: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn a task bound to this group.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.set.lock().unwrap().spawn(future);
    }

    /// Await every task in the group.
    ///
    /// On the first task error or panic the remaining tasks are aborted, the
    /// drain continues (ignoring cancellations), and the first failure is
    /// returned.
    pub async fn join_all(&self) -> Result<(), GroupError<E>> {
        let mut first_failure: Option<GroupError<E>> = None;

        loop {
            let mut set = std::mem::take(&mut *self.set.lock().unwrap());
            if set.is_empty() {
                break;
            }
            if first_failure.is_some() {
                set.abort_all();
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        if first_failure.is_none() {
                            debug!(%error, "task failed, cancelling group");
                            first_failure = Some(GroupError::Task(error));
                            set.abort_all();
                        }
                    }
                    Err(join_error) if join_error.is_cancelled() => {}
                    Err(join_error) => {
                        if first_failure.is_none() {
                            first_failure = Some(GroupError::Panic(join_error.to_string()));
                            set.abort_all();
                        }
                    }
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some(failure) => Err(failure),
        }
    }
}

impl<E> Default for TaskGroup<E>
where
    E: std::error::Error + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
