//! Caller-supplied deadlines.
//!
//! Every entry point takes a `Deadline` and refuses to start once it has
//! elapsed. MFA delivery and approval notification run under it and surface
//! `ElevationError::Timeout` instead of hanging the request.

use std::{future::Future, time::Duration};
use tokio::time::Instant;

use super::error::ElevationError;

#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline; the call may take as long as its collaborators do.
    #[must_use]
    pub const fn none() -> Self {
        Self { at: None }
    }

    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
        }
    }

    #[must_use]
    pub fn is_elapsed(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Run `future` until it completes or the deadline passes.
    ///
    /// # Errors
    /// Returns `ElevationError::Timeout` when the deadline elapses first, or
    /// the future's own error.
    pub async fn run<T, F>(&self, operation: &'static str, future: F) -> Result<T, ElevationError>
    where
        F: Future<Output = Result<T, ElevationError>>,
    {
        match self.at {
            None => future.await,
            Some(at) => tokio::time::timeout_at(at, future)
                .await
                .map_err(|_| ElevationError::Timeout {
                    operation,
                    elevation_id: None,
                })?,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}
