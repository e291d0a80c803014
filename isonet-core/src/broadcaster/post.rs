//! Deferred results of `post` dispatches

use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Why a posted result is not available
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PostError {
    #[error("Post was cancelled")]
    Cancelled,

    #[error("Post worker panicked")]
    Panicked,

    #[error("Post result not ready after {0:?}")]
    TimedOut(Duration),

    #[error("Post result already taken")]
    Consumed,

    #[error("No runtime to run the post on")]
    NotScheduled,
}

/// Handle on a dispatch running on a worker task
///
/// Dropping the handle does not stop the dispatch.
pub struct PostHandle<T> {
    handle: Option<JoinHandle<T>>,
    /// Reported once no worker is left to wait for
    missing: PostError,
}

impl<T> PostHandle<T> {
    pub(crate) fn new(handle: JoinHandle<T>) -> Self {
        Self {
            handle: Some(handle),
            missing: PostError::Consumed,
        }
    }

    /// A post whose worker could not be spawned
    pub(crate) fn not_scheduled() -> Self {
        Self {
            handle: None,
            missing: PostError::NotScheduled,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Best-effort cancellation
    ///
    /// The worker is aborted at its next suspension point: a signal already
    /// handed to a transport may still reach its target.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    /// Wait for the dispatch to complete
    pub async fn wait(mut self) -> Result<T, PostError> {
        let handle = self.handle.take().ok_or_else(|| self.missing.clone())?;
        handle.await.map_err(join_error)
    }

    /// Wait at most `timeout`; the handle stays usable when it elapses
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<T, PostError> {
        let handle = self.handle.as_mut().ok_or_else(|| self.missing.clone())?;
        match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => {
                self.handle = None;
                joined.map_err(join_error)
            }
            Err(_) => Err(PostError::TimedOut(timeout)),
        }
    }
}

fn join_error(err: tokio::task::JoinError) -> PostError {
    if err.is_cancelled() {
        PostError::Cancelled
    } else {
        PostError::Panicked
    }
}
