use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::{GraphFsError, Result};

/// Cancellation context threaded through every public operation and every
/// backing-store call.
///
/// Lock waits inside the crate are not interrupted; the context is checked on
/// entry to each operation and handed to adapters so long-running I/O can
/// observe it.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancel_token: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context cancelled when `token` is set.
    pub fn with_cancel(token: Arc<AtomicBool>) -> Self {
        Self {
            cancel_token: Some(token),
            deadline: None,
        }
    }

    /// Returns a copy of this context that also expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            cancel_token: self.cancel_token.clone(),
            deadline: Some(deadline),
        }
    }

    /// True once the token is set or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        if let Some(flag) = &self.cancel_token {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
        }
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Fails with [`GraphFsError::Cancelled`] when the context is cancelled.
    pub fn check_cancel(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(GraphFsError::Cancelled);
        }
        Ok(())
    }
}
