// src/cancel.rs

//! Cooperative cancellation for long-running operations
//!
//! Deep verification, migration, and incremental builds check a token
//! between per-chunk or per-asset units of work. Cancellation is a flag,
//! never thread interruption: an in-flight unit always runs to completion,
//! so shared state is never left half-written.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Cloneable cancellation flag shared between a controller and workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` when cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Wall-clock deadline derived from an optional timeout
///
/// `None` means unbounded; checks then always pass.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    deadline: Option<Instant>,
}

impl Deadline {
    pub fn after(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Return `Err(Timeout)` once the deadline has passed
    pub fn check(&self, what: &str) -> Result<()> {
        match self.deadline {
            Some(d) if Instant::now() > d => Err(Error::Timeout(what.to_string())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_clear() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let worker_view = token.clone();
        token.cancel();
        assert!(worker_view.is_cancelled());
        assert!(matches!(worker_view.check().unwrap_err(), Error::Cancelled));
    }

    #[test]
    fn test_deadline_none_never_fires() {
        let d = Deadline::after(None);
        assert!(d.check("anything").is_ok());
    }

    #[test]
    fn test_deadline_fires_after_elapsed() {
        let d = Deadline::after(Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            d.check("deep verify").unwrap_err(),
            Error::Timeout(_)
        ));
    }
}
