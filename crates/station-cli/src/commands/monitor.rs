//! Monitor command - continuous battery voltage sampling

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use station_uds::procedures;
use station_uds::uds::Voltage;
use station_uds::{DiagContext, PumpState, StreamEvent};
use tokio::time::Instant;

use super::Station;
use crate::output::OutputContext;
use crate::sink::ConsoleSink;

/// One printed line of the stream
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum MonitorLine<'a> {
    Sample {
        sequence: u64,
        elapsed_ms: u128,
        battery_voltage: &'a Voltage,
    },
    NoData {
        sequence: u64,
        error: String,
    },
    Stopped,
    Failed {
        consecutive_failures: u32,
        last_error: String,
    },
}

/// Stream battery voltage until Ctrl+C, `count` samples or a terminal failure
pub async fn monitor(station: &Station, count: Option<u64>, out: &OutputContext) -> Result<()> {
    out.info(&format!(
        "Monitoring battery voltage every {} ms on {}",
        station.settings.stream.interval_ms,
        station.bus.label()
    ));
    out.info("Press Ctrl+C to stop");

    let ctx = DiagContext::new(Arc::new(ConsoleSink::silent()), station.cancel.clone());
    let mut stream = procedures::battery_voltage_stream(&station.bus, &station.settings, ctx);
    let started = Instant::now();
    let mut samples = 0u64;
    let mut failure = None;

    while let Some(event) = stream.next().await {
        match &event {
            StreamEvent::Sample { sequence, value, at } => {
                let elapsed = at.duration_since(started);
                out.print_line(
                    &format!("[{:>8.1}s] #{:<4} Battery Voltage = {}", elapsed.as_secs_f64(), sequence, value),
                    &MonitorLine::Sample {
                        sequence: *sequence,
                        elapsed_ms: elapsed.as_millis(),
                        battery_voltage: value,
                    },
                );
                samples += 1;
                if count.is_some_and(|limit| samples >= limit) {
                    stream.cancel();
                }
            }
            StreamEvent::NoData { sequence, error } => {
                out.warn(&format!("#{:<4} no data: {}", sequence, error));
                if out.is_json() {
                    out.print_line(
                        "",
                        &MonitorLine::NoData {
                            sequence: *sequence,
                            error: error.to_string(),
                        },
                    );
                }
            }
            StreamEvent::Stopped => {
                out.print_line("Stream stopped", &MonitorLine::Stopped);
            }
            StreamEvent::Failed {
                consecutive_failures,
                last_error,
            } => {
                out.print_line(
                    "Stream failed",
                    &MonitorLine::Failed {
                        consecutive_failures: *consecutive_failures,
                        last_error: last_error.to_string(),
                    },
                );
                failure = Some((*consecutive_failures, last_error.clone()));
            }
        }
    }

    let state = stream.join().await;
    out.info(&format!("{} sample(s) received", samples));

    match (state, failure) {
        (_, Some((failures, error))) => {
            bail!("Stream failed after {} consecutive failures: {}", failures, error)
        }
        (PumpState::Failed, None) => bail!("Stream ended abnormally"),
        _ => Ok(()),
    }
}
