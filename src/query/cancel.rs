//! Cooperative cancellation for queries.
//!
//! One token is shared by every per-segment search of a query. Cancelling it
//! (explicitly or by passing the deadline) makes all in-flight searches stop at
//! their next check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{QuiverError, Result};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that cancels itself once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.cancelled.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Fail with `OperationCancelled` once the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(QuiverError::cancelled(if self.deadline.is_some() {
                "query cancelled or timed out"
            } else {
                "query cancelled"
            }))
        } else {
            Ok(())
        }
    }
}
