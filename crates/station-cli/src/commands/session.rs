//! Session command - diagnostic session control

use anyhow::{Context, Result};
use station_uds::{procedures, SessionType};

use super::{raw_pairs, Station};
use crate::output::OutputContext;

/// Change diagnostic session
pub async fn session(station: &Station, session: SessionType, out: &OutputContext) -> Result<()> {
    let (ctx, sink) = station.context(out);
    let result = procedures::change_session(&station.bus, &station.settings, session, &ctx).await;
    sink.finish();
    let report = result.with_context(|| format!("Session change to {} failed", session))?;

    out.success(&format!(
        "Session changed to {} (0x{:02X})",
        session,
        session.sub_function()
    ));
    out.print_result(&report, &raw_pairs(&report.raw));
    Ok(())
}
