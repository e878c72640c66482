//! Operation context: event sink and cooperative cancellation
//!
//! Every engine operation receives a [`DiagContext`]. It carries the event
//! sink the orchestration layer listens on and the cancellation token the
//! engine polls at frame-wait, retry and tick boundaries.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
pub use tracing::Level;

use crate::error::{DiagnosticError, DiagnosticResult};

/// Longest uninterrupted sleep before the token is checked again
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Receiver of log lines and progress updates from an operation
pub trait EventSink: Send + Sync {
    fn log(&self, level: Level, message: &str);

    /// Report progress in percent (0-100)
    fn progress(&self, percent: u8, message: &str);
}

/// Sink that forwards everything to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!("{}", message),
            Level::WARN => tracing::warn!("{}", message),
            Level::INFO => tracing::info!("{}", message),
            Level::DEBUG => tracing::debug!("{}", message),
            Level::TRACE => tracing::trace!("{}", message),
        }
    }

    fn progress(&self, percent: u8, message: &str) {
        tracing::debug!(percent, "{}", message);
    }
}

/// Cooperative cancellation flag shared between a caller and an operation
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Event sink plus cancellation token, injected into every operation
#[derive(Clone)]
pub struct DiagContext {
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl DiagContext {
    pub fn new(sink: Arc<dyn EventSink>, cancel: CancellationToken) -> Self {
        Self { sink, cancel }
    }

    /// Context logging to `tracing` with a fresh, never-cancelled token
    pub fn detached() -> Self {
        Self::new(Arc::new(TracingSink), CancellationToken::new())
    }

    pub fn log(&self, level: Level, message: &str) {
        self.sink.log(level, message);
    }

    pub fn info(&self, message: &str) {
        self.sink.log(Level::INFO, message);
    }

    pub fn warn(&self, message: &str) {
        self.sink.log(Level::WARN, message);
    }

    pub fn progress(&self, percent: u8, message: &str) {
        self.sink.progress(percent.min(100), message);
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`DiagnosticError::Cancelled`] once cancellation was requested
    pub fn checkpoint(&self) -> DiagnosticResult<()> {
        if self.cancel.is_cancelled() {
            Err(DiagnosticError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early to honour cancellation
    pub async fn sleep(&self, duration: Duration) -> DiagnosticResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let slice = (deadline - now).min(CANCEL_POLL);
            tokio::time::sleep(slice).await;
        }
    }
}

impl fmt::Debug for DiagContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_stops_early_on_cancel() {
        let ctx = DiagContext::detached();
        let token = ctx.token().clone();
        let started = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            token.cancel();
        });

        let result = ctx.sleep(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(DiagnosticError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_checkpoint_reflects_token() {
        let ctx = DiagContext::detached();
        assert!(ctx.checkpoint().is_ok());
        ctx.token().cancel();
        assert!(ctx.checkpoint().is_err());
    }

    #[test]
    fn test_progress_is_clamped() {
        let sink = Arc::new(testing::RecordingSink::default());
        let ctx = DiagContext::new(sink.clone(), CancellationToken::new());
        ctx.progress(150, "done");
        assert_eq!(sink.progress.lock()[0].0, 100);
    }
}
