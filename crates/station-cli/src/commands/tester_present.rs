//! Tester-present command

use anyhow::{Context, Result};
use station_uds::procedures;

use super::{raw_pairs, Station};
use crate::output::OutputContext;

pub async fn tester_present(station: &Station, out: &OutputContext) -> Result<()> {
    let (ctx, sink) = station.context(out);
    let result = procedures::tester_present(&station.bus, &station.settings, &ctx).await;
    sink.finish();
    let raw = result.context("TesterPresent failed")?;

    out.success(&format!(
        "ECU 0x{:03X} is present",
        station.settings.address.rx_id
    ));
    out.print_result(&raw, &raw_pairs(&raw));
    Ok(())
}
