//! Stream pump task

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{PumpState, StreamEvent};
use crate::config::StreamConfig;
use crate::context::{CancellationToken, DiagContext, Level};
use crate::error::DiagnosticError;
use crate::retry::RetryScheduler;
use crate::transport::Bus;
use crate::uds::{DataIdentifier, UdsClient};

/// Events buffered between the pump and a slow consumer
const EVENT_BUFFER: usize = 32;

/// How long to wait for room in a full channel before checking cancellation again
const DELIVERY_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct PumpCounters {
    ticks: AtomicU64,
    samples: AtomicU64,
    failures: AtomicU64,
}

/// Repeated reads of one DID on a fixed cadence
pub struct StreamPump<T> {
    bus: Bus,
    client: UdsClient,
    scheduler: RetryScheduler,
    read: DataIdentifier<T>,
    settings: StreamConfig,
    ctx: DiagContext,
    state: Arc<Mutex<PumpState>>,
    counters: Arc<PumpCounters>,
}

impl<T: Send + 'static> StreamPump<T> {
    /// Start a pump on its own task
    ///
    /// The pump takes the bus lease before its first tick and keeps it until
    /// it stops. Cancel through [`StreamHandle::cancel`] or the token in `ctx`.
    pub fn spawn(
        bus: Bus,
        client: UdsClient,
        scheduler: RetryScheduler,
        read: DataIdentifier<T>,
        settings: StreamConfig,
        ctx: DiagContext,
    ) -> StreamHandle<T> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let state = Arc::new(Mutex::new(PumpState::Idle));
        let cancel = ctx.token().clone();

        let pump = Self {
            bus,
            client,
            scheduler,
            read,
            settings,
            ctx,
            state: state.clone(),
            counters: Arc::new(PumpCounters::default()),
        };
        let task = tokio::spawn(pump.run(tx));

        StreamHandle {
            events: rx,
            state,
            cancel,
            task,
        }
    }

    fn set_state(&self, state: PumpState) {
        *self.state.lock() = state;
    }

    async fn run(self, tx: mpsc::Sender<StreamEvent<T>>) -> PumpState {
        self.set_state(PumpState::Running);
        info!(did = %self.read, bus = %self.bus.label(), "Stream started");

        let mut lease = match self.bus.acquire(&self.ctx).await {
            Ok(lease) => lease,
            Err(e) => return self.finish(&tx, terminal_for(e, 0)).await,
        };

        let heartbeat = self.spawn_heartbeat();
        let mut consecutive_failures = 0u32;
        let mut sequence = 0u64;

        let terminal = loop {
            if self.ctx.is_cancelled() {
                break StreamEvent::Stopped;
            }
            sequence += 1;
            self.counters.ticks.fetch_add(1, Ordering::Relaxed);

            let event = match self
                .scheduler
                .read(&self.client, &mut *lease, &self.read, &self.ctx)
                .await
            {
                Ok(reading) => {
                    consecutive_failures = 0;
                    self.counters.samples.fetch_add(1, Ordering::Relaxed);
                    StreamEvent::Sample {
                        sequence,
                        value: reading.value,
                        at: Instant::now(),
                    }
                }
                Err(DiagnosticError::Cancelled) => break StreamEvent::Stopped,
                Err(e) => {
                    consecutive_failures += 1;
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    if consecutive_failures >= self.settings.failure_threshold {
                        break terminal_for(e, consecutive_failures);
                    }
                    self.ctx.progress(60, "No data (retrying)");
                    StreamEvent::NoData { sequence, error: e }
                }
            };

            if !self.deliver(&tx, event).await {
                break StreamEvent::Stopped;
            }

            // Pacing is independent of how long the read took
            if self.ctx.sleep(self.settings.interval()).await.is_err() {
                break StreamEvent::Stopped;
            }
        };

        heartbeat.abort();
        drop(lease);
        self.finish(&tx, terminal).await
    }

    /// Queue one tick's event while the lease is held
    ///
    /// Returns `false` when the consumer is gone or the run was cancelled
    /// while the channel was full.
    async fn deliver(&self, tx: &mpsc::Sender<StreamEvent<T>>, event: StreamEvent<T>) -> bool {
        loop {
            if self.ctx.is_cancelled() {
                return false;
            }
            match tokio::time::timeout(DELIVERY_POLL, tx.reserve()).await {
                Ok(Ok(permit)) => {
                    permit.send(event);
                    return true;
                }
                Ok(Err(_)) => {
                    debug!("Stream consumer went away");
                    return false;
                }
                Err(_) => {}
            }
        }
    }

    /// Record the final state and emit the terminal event, bus already released
    async fn finish(&self, tx: &mpsc::Sender<StreamEvent<T>>, terminal: StreamEvent<T>) -> PumpState {
        let state = match &terminal {
            StreamEvent::Failed {
                consecutive_failures,
                last_error,
            } => {
                warn!(consecutive_failures, error = %last_error, "Stream failed");
                self.ctx.log(
                    Level::ERROR,
                    &format!(
                        "{} stream failed after {} consecutive failures: {}",
                        self.read.name, consecutive_failures, last_error
                    ),
                );
                PumpState::Failed
            }
            _ => {
                info!(
                    samples = self.counters.samples.load(Ordering::Relaxed),
                    "Stream stopped"
                );
                PumpState::Stopped
            }
        };
        self.set_state(state);
        // The consumer may already be gone; the state above is still authoritative.
        let _ = tx.send(terminal).await;
        state
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let period = self.settings.heartbeat_interval();
        let counters = self.counters.clone();
        let ctx = self.ctx.clone();
        let name = self.read.name;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                ctx.log(
                    Level::INFO,
                    &format!(
                        "{} stream alive: {} ticks, {} samples, {} failures",
                        name,
                        counters.ticks.load(Ordering::Relaxed),
                        counters.samples.load(Ordering::Relaxed),
                        counters.failures.load(Ordering::Relaxed)
                    ),
                );
            }
        })
    }
}

fn terminal_for<T>(error: DiagnosticError, consecutive_failures: u32) -> StreamEvent<T> {
    match error {
        DiagnosticError::Cancelled => StreamEvent::Stopped,
        last_error => StreamEvent::Failed {
            consecutive_failures,
            last_error,
        },
    }
}

/// Consumer side of a running [`StreamPump`]
///
/// Dropping the handle (or calling [`join`](Self::join)) closes the event
/// channel, which stops the pump at its next tick.
pub struct StreamHandle<T> {
    events: mpsc::Receiver<StreamEvent<T>>,
    state: Arc<Mutex<PumpState>>,
    cancel: CancellationToken,
    task: JoinHandle<PumpState>,
}

impl<T> StreamHandle<T> {
    /// Next event; `None` after the terminal event
    pub async fn next(&mut self) -> Option<StreamEvent<T>> {
        self.events.recv().await
    }

    /// Request a stop; the pump emits [`StreamEvent::Stopped`] and releases the bus
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> PumpState {
        *self.state.lock()
    }

    /// Wait for the pump task to end and return its final state
    pub async fn join(self) -> PumpState {
        drop(self.events);
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Stream task did not complete");
                PumpState::Failed
            }
        }
    }
}
