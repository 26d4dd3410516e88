use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::IngestStage;
use crate::error::{Result, TempographError};

/// Cooperative cancellation for one ingestion call: a shared flag plus an optional deadline.
///
/// Clones share the flag, so any clone can cancel the run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with [`TempographError::Cancelled`] if cancelled before `stage` starts.
    pub fn check(&self, stage: IngestStage) -> Result<()> {
        if self.is_cancelled() {
            log::warn!("Ingestion cancelled before {}", stage);
            return Err(TempographError::Cancelled(stage));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check(IngestStage::Chunk).is_ok());
        other.cancel();
        assert!(matches!(
            token.check(IngestStage::Chunk),
            Err(TempographError::Cancelled(IngestStage::Chunk))
        ));
    }

    #[test]
    fn test_deadline() {
        let past = CancelToken::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(past.is_cancelled());
        let future = CancelToken::new().with_timeout(Duration::from_secs(60));
        assert!(!future.is_cancelled());
    }
}
