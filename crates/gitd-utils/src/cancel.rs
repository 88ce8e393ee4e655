//! Cooperative cancellation for long-running requests.
//!
//! Blocking work (indexing a pack, a negotiation round) polls a
//! [`CancelToken`] between units of work. The token is cheap to clone and
//! safe to trip from another thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::UtilError;

/// A cancellation flag shared between a request driver and its workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    tripped: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Workers observe it at their next poll point.
    pub fn cancel(&self) {
        self.tripped.store(true, Ordering::Relaxed);
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }

    /// Return `Err(UtilError::Cancelled)` if the token has tripped.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(UtilError::Cancelled)
        } else {
            Ok(())
        }
    }
}
