//! Voltage command - one battery voltage reading

use anyhow::{Context, Result};
use station_uds::procedures;

use super::{raw_pairs, Station};
use crate::output::OutputContext;

pub async fn voltage(station: &Station, out: &OutputContext) -> Result<()> {
    let (ctx, sink) = station.context(out);
    let result = procedures::read_battery_voltage(&station.bus, &station.settings, &ctx).await;
    sink.finish();
    let report = result.context("Battery voltage read failed")?;

    let mut pairs = vec![("Battery Voltage", report.battery_voltage.to_string())];
    pairs.extend(raw_pairs(&report.raw));
    out.print_result(&report, &pairs);
    Ok(())
}
