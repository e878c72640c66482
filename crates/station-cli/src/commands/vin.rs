//! VIN command - extended session, then read DID 0xF190

use anyhow::{Context, Result};
use station_uds::procedures;

use super::{raw_pairs, Station};
use crate::output::OutputContext;

pub async fn vin(station: &Station, out: &OutputContext) -> Result<()> {
    let (ctx, sink) = station.context(out);
    let result = procedures::read_vin(&station.bus, &station.settings, &ctx).await;
    sink.finish();
    let report = result.context("VIN read failed")?;

    let mut pairs = vec![("VIN", report.vin.to_string())];
    pairs.extend(raw_pairs(&report.raw));
    out.print_result(&report, &pairs);
    Ok(())
}
