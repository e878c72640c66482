//! Command implementations for diag-station

use std::sync::Arc;

use station_uds::procedures::{RawExchange, Settings};
use station_uds::{Bus, CancellationToken, DiagContext, StationConfig};

use crate::output::OutputContext;
use crate::sink::ConsoleSink;

pub mod config;
pub mod ecu_check;
pub mod monitor;
pub mod session;
pub mod tester_present;
pub mod vin;
pub mod voltage;

pub use config::show_config;
pub use ecu_check::ecu_check;
pub use monitor::monitor;
pub use session::session;
pub use tester_present::tester_present;
pub use vin::vin;
pub use voltage::voltage;

/// Open bus and engine settings shared by the commands
pub struct Station {
    pub bus: Bus,
    pub settings: Settings,
    pub config: StationConfig,
    pub cancel: CancellationToken,
}

impl Station {
    /// Context reporting through a progress bar (text mode) or logs only
    pub fn context(&self, out: &OutputContext) -> (DiagContext, Arc<ConsoleSink>) {
        let sink = if out.is_json() || out.quiet {
            Arc::new(ConsoleSink::silent())
        } else {
            Arc::new(ConsoleSink::with_progress())
        };
        let ctx = DiagContext::new(sink.clone(), self.cancel.clone());
        (ctx, sink)
    }
}

/// Raw exchange lines appended to text output
fn raw_pairs(raw: &RawExchange) -> [(&'static str, String); 3] {
    [
        ("Bus", raw.bus.clone()),
        ("Request", raw.request.clone()),
        ("Response", raw.response.clone()),
    ]
}
