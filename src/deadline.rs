//! Call deadlines and cooperative cancellation checks.
//!
//! A [`Deadline`] is fixed when a call is opened and never changes afterwards.
//! The caller enforces it on its own wait for responses; handlers doing
//! long-running work poll [`CallContext::check_deadline`] between increments
//! (see [`run_steps`]) so cancellation is noticed before the work is done.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::channel::CallContext;
use crate::status::Status;

/// Absolute point in time after which a call is treated as failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline: the call may run forever.
    pub fn none() -> Self {
        Self(None)
    }

    /// A deadline `timeout` from now. Timeouts too large to represent mean no
    /// deadline at all.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        timeout.map(Self::after).unwrap_or_default()
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// Non-blocking check.
    pub fn is_elapsed(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before the deadline, zero once elapsed.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

impl CallContext {
    /// Fails with `Cancelled` once the deadline has elapsed or the call has
    /// already been terminated by either side.
    pub fn check_deadline(&self) -> Result<(), Status> {
        if self.deadline().is_elapsed() {
            return Err(Status::cancelled("deadline elapsed, abandoning work"));
        }
        if self.is_cancelled() {
            return Err(Status::cancelled("call was cancelled by the caller"));
        }
        Ok(())
    }
}

/// Performs `steps` sequential waits of `step` each, checking the call's
/// deadline before every one of them.
pub async fn run_steps(ctx: &CallContext, steps: u32, step: Duration) -> Result<(), Status> {
    for index in 0..steps {
        if let Err(status) = ctx.check_deadline() {
            debug!(step = index, total = steps, "bounded work interrupted");
            return Err(status);
        }
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            _ = ctx.terminated() => {}
        }
    }
    Ok(())
}
