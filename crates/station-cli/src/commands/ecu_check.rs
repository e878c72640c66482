//! ECU check command - TesterPresent on every configured ECU

use anyhow::{bail, Context, Result};
use station_uds::config::EcuConfig;
use station_uds::procedures::{self, EcuStatus};

use super::Station;
use crate::output::{EcuRow, OutputContext};

pub async fn ecu_check(station: &Station, timeout_ms: Option<u64>, out: &OutputContext) -> Result<()> {
    let ecus: Vec<EcuConfig> = station
        .config
        .ecus
        .iter()
        .cloned()
        .map(|mut ecu| {
            if let Some(timeout_ms) = timeout_ms {
                ecu.timeout_ms = timeout_ms;
            }
            ecu
        })
        .collect();

    let (ctx, sink) = station.context(out);
    let result = procedures::check_ecus(&station.bus, &station.settings, &ecus, &ctx).await;
    sink.finish();
    let report = result.context("ECU check failed")?;

    let rows: Vec<EcuRow> = report.ecu_statuses.iter().map(row).collect();
    out.print_table(&rows, &report);

    if !report.ecus_ok {
        let inactive = report.ecu_statuses.iter().filter(|s| !s.active).count();
        bail!("{} of {} ECU(s) inactive", inactive, report.ecu_statuses.len());
    }
    out.success("All ECUs active");
    Ok(())
}

fn row(status: &EcuStatus) -> EcuRow {
    let detail = match (&status.nrc, &status.error) {
        (Some(nrc), _) => format!("NRC 0x{:02X} ({})", nrc, nrc.description()),
        (None, Some(error)) => error.clone(),
        (None, None) => String::new(),
    };
    EcuRow {
        ecu: status.ecu.clone(),
        status: if status.active { "active" } else { "inactive" }.to_string(),
        error_count: status.error_count,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use station_uds::NegativeResponseCode;

    use super::*;

    #[test]
    fn test_row_prefers_nrc_detail() {
        let status = EcuStatus {
            ecu: "BMS".to_string(),
            active: false,
            error_count: 1,
            nrc: Some(NegativeResponseCode::from(0x22)),
            error: Some("Negative response".to_string()),
        };
        let row = row(&status);
        assert_eq!(row.status, "inactive");
        assert!(row.detail.starts_with("NRC 0x22"));
    }

    #[test]
    fn test_active_row_has_no_detail() {
        let status = EcuStatus {
            ecu: "VCU".to_string(),
            active: true,
            error_count: 0,
            nrc: None,
            error: None,
        };
        assert_eq!(row(&status).detail, "");
    }
}
