//! Exclusive access to a transport
//!
//! The request and response IDs are fixed, so two exchanges interleaved on
//! the same bus cannot be told apart. Every exchange (or a whole stream run)
//! therefore holds a [`BusLease`]; dropping the lease releases the bus on any
//! exit path.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{Transport, TransportError};
use crate::context::DiagContext;
use crate::error::DiagnosticResult;

/// How long to wait for the lock before checking cancellation again
const ACQUIRE_POLL: Duration = Duration::from_millis(50);

/// Shared handle to one physical (or virtual) CAN bus
#[derive(Clone)]
pub struct Bus {
    transport: Arc<Mutex<Box<dyn Transport>>>,
    label: Arc<str>,
}

impl Bus {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let label: Arc<str> = transport.describe().into();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            label,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait for exclusive use of the bus
    ///
    /// The wait is cooperative: cancellation of `ctx` is honoured between
    /// polls of the lock.
    pub async fn acquire(&self, ctx: &DiagContext) -> DiagnosticResult<BusLease> {
        loop {
            ctx.checkpoint()?;
            let lock = self.transport.clone().lock_owned();
            if let Ok(guard) = tokio::time::timeout(ACQUIRE_POLL, lock).await {
                debug!(bus = %self.label, "Bus acquired");
                return Ok(BusLease {
                    guard,
                    label: self.label.clone(),
                });
            }
        }
    }

    /// Take the bus only if nobody else holds it
    pub fn try_acquire(&self) -> Option<BusLease> {
        self.transport
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| BusLease {
                guard,
                label: self.label.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.transport.try_lock().is_err()
    }

    /// Close the underlying adapter once the current holder is done
    pub async fn close(&self) -> Result<(), TransportError> {
        let mut transport = self.transport.lock().await;
        transport.close().await
    }
}

/// Exclusive use of a [`Bus`] until dropped
pub struct BusLease {
    guard: OwnedMutexGuard<Box<dyn Transport>>,
    label: Arc<str>,
}

impl Deref for BusLease {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &**self.guard
    }
}

impl DerefMut for BusLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.guard
    }
}

impl Drop for BusLease {
    fn drop(&mut self) {
        debug!(bus = %self.label, "Bus released");
    }
}
