//! Cooperative cancellation
//!
//! A `CancelToken` is a cheap cloneable handle shared between the CLI, the
//! scanner tasks, and the rebuild pipeline. Long loops call [`CancelToken::check`]
//! at their boundaries; everything else is ordinary synchronous code.

use crate::core::{RescueError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that has not been cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; all clones observe it
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `Err(RescueError::Cancelled)` once cancellation is requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RescueError::Cancelled)
        } else {
            Ok(())
        }
    }
}
