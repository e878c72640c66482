//! Bounded retry around UDS operations
//!
//! The scheduler is the only place that decides whether a failed exchange is
//! worth repeating. See [`DiagnosticError::is_retryable`] for the
//! classification.

use std::time::Duration;

use tracing::{debug, info};

use crate::config::RetryConfig;
use crate::context::{DiagContext, Level};
use crate::error::{DiagnosticError, DiagnosticResult};
use crate::transport::Transport;
use crate::uds::{DataIdentifier, Exchange, Reading, UdsClient, UdsOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryScheduler {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryScheduler {
    /// `max_attempts` of 0 is treated as a single attempt
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Pause after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Run `operation` until it succeeds, fails for good, or attempts run out
    ///
    /// Returns the last error when every attempt failed.
    pub async fn run(
        &self,
        client: &UdsClient,
        transport: &mut dyn Transport,
        operation: UdsOperation,
        ctx: &DiagContext,
    ) -> DiagnosticResult<Exchange> {
        let mut attempt = 1;
        loop {
            ctx.checkpoint()?;

            match client.execute(transport, operation, ctx).await {
                Ok(exchange) => {
                    if attempt > 1 {
                        info!(operation = %operation, attempt, "Succeeded after retry");
                    }
                    return Ok(exchange);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    ctx.log(
                        Level::WARN,
                        &format!(
                            "{} failed (attempt {}/{}): {}; retrying in {} ms",
                            operation,
                            attempt,
                            self.max_attempts,
                            e,
                            delay.as_millis()
                        ),
                    );
                    ctx.sleep(delay).await?;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        ctx.log(
                            Level::WARN,
                            &format!("{} failed after {} attempts: {}", operation, attempt, e),
                        );
                    } else {
                        debug!(operation = %operation, error = %e, "Not retrying");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Read and decode a DID with retries
    ///
    /// Decoding happens once, after the exchange succeeded; a value that fails
    /// validation is not re-read.
    pub async fn read<T>(
        &self,
        client: &UdsClient,
        transport: &mut dyn Transport,
        did: &DataIdentifier<T>,
        ctx: &DiagContext,
    ) -> DiagnosticResult<Reading<T>> {
        let exchange = self.run(client, transport, did.operation(), ctx).await?;
        let value = did.decode(&exchange.data).map_err(|e| {
            ctx.log(Level::WARN, &format!("{}: {}", did, e));
            e
        })?;
        Ok(Reading { value, exchange })
    }
}
