//! Diagnostic procedures run by the station
//!
//! Each procedure takes the bus lease for its whole duration, reports
//! progress through the context and returns a report carrying both the
//! decoded value and the raw UDS exchange for persistence.

use serde::Serialize;
use tracing::info;

use crate::config::{ConfigError, EcuConfig, RetryConfig, StationConfig, StreamConfig, TimingConfig};
use crate::context::DiagContext;
use crate::error::{DiagnosticError, DiagnosticResult};
use crate::retry::RetryScheduler;
use crate::stream::{StreamHandle, StreamPump};
use crate::transport::{AddressInfo, Bus};
use crate::uds::{
    Exchange, NegativeResponseCode, SessionType, UdsClient, UdsOperation, Vin, Voltage,
    BATTERY_VOLTAGE, VIN,
};

/// Engine parameters shared by all procedures
#[derive(Debug, Clone)]
pub struct Settings {
    pub address: AddressInfo,
    pub timing: TimingConfig,
    pub retry: RetryConfig,
    pub stream: StreamConfig,
}

impl Settings {
    pub fn from_config(config: &StationConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            address: config.can.address_info()?,
            timing: config.timing.clone(),
            retry: config.retry.clone(),
            stream: config.stream.clone(),
        })
    }

    pub fn client(&self) -> UdsClient {
        UdsClient::new(self.address, self.timing.clone())
    }

    pub fn scheduler(&self) -> RetryScheduler {
        RetryScheduler::from_config(&self.retry)
    }
}

/// Request and response UDS payloads as upper-case hex
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawExchange {
    pub bus: String,
    pub request: String,
    pub response: String,
}

impl RawExchange {
    fn new(bus: &Bus, exchange: &Exchange) -> Self {
        Self {
            bus: bus.label().to_string(),
            request: hex::encode_upper(&exchange.request),
            response: hex::encode_upper(&exchange.response),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VinReport {
    pub vin: Vin,
    pub raw: RawExchange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoltageReport {
    pub battery_voltage: Voltage,
    pub raw: RawExchange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub session: SessionType,
    pub raw: RawExchange,
}

/// Result of the TesterPresent probe of one ECU
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EcuStatus {
    pub ecu: String,
    pub active: bool,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nrc: Option<NegativeResponseCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EcuCheckReport {
    /// True only when every probed ECU answered positively
    pub ecus_ok: bool,
    pub ecu_statuses: Vec<EcuStatus>,
}

/// Read the VIN: extended session, then DID 0xF190
pub async fn read_vin(bus: &Bus, settings: &Settings, ctx: &DiagContext) -> DiagnosticResult<VinReport> {
    ctx.progress(5, &format!("Acquiring bus {}", bus.label()));
    let mut lease = bus.acquire(ctx).await?;
    let client = settings.client();
    let scheduler = settings.scheduler();

    ctx.info("Starting extended diagnostic session (10 03)");
    scheduler
        .run(
            &client,
            &mut *lease,
            UdsOperation::SessionControl(SessionType::Extended.sub_function()),
            ctx,
        )
        .await?;

    ctx.progress(40, "Requesting VIN (22 F1 90)");
    let reading = scheduler.read(&client, &mut *lease, &VIN, ctx).await?;
    drop(lease);

    ctx.info(&format!("VIN read: {}", reading.value));
    ctx.progress(100, &format!("VIN: {}", reading.value));
    Ok(VinReport {
        raw: RawExchange::new(bus, &reading.exchange),
        vin: reading.value,
    })
}

/// One retried read of the battery voltage
pub async fn read_battery_voltage(
    bus: &Bus,
    settings: &Settings,
    ctx: &DiagContext,
) -> DiagnosticResult<VoltageReport> {
    ctx.progress(10, "Sending UDS request (22 E1 42)");
    let mut lease = bus.acquire(ctx).await?;
    let reading = settings
        .scheduler()
        .read(&settings.client(), &mut *lease, &BATTERY_VOLTAGE, ctx)
        .await?;
    drop(lease);

    ctx.progress(100, &format!("Battery Voltage: {}", reading.value));
    Ok(VoltageReport {
        raw: RawExchange::new(bus, &reading.exchange),
        battery_voltage: reading.value,
    })
}

/// Switch the ECU to `session`
pub async fn change_session(
    bus: &Bus,
    settings: &Settings,
    session: SessionType,
    ctx: &DiagContext,
) -> DiagnosticResult<SessionReport> {
    let mut lease = bus.acquire(ctx).await?;
    let exchange = settings
        .scheduler()
        .run(
            &settings.client(),
            &mut *lease,
            UdsOperation::SessionControl(session.sub_function()),
            ctx,
        )
        .await?;
    drop(lease);

    ctx.info(&format!("Diagnostic session is now {}", session));
    Ok(SessionReport {
        session,
        raw: RawExchange::new(bus, &exchange),
    })
}

/// One retried TesterPresent on the configured address
pub async fn tester_present(bus: &Bus, settings: &Settings, ctx: &DiagContext) -> DiagnosticResult<RawExchange> {
    let mut lease = bus.acquire(ctx).await?;
    let exchange = settings
        .scheduler()
        .run(&settings.client(), &mut *lease, UdsOperation::TesterPresent, ctx)
        .await?;
    Ok(RawExchange::new(bus, &exchange))
}

/// Probe every ECU with a single TesterPresent on its own id pair
///
/// An ECU that stays silent or rejects the request is reported inactive; the
/// report is produced either way. Only cancellation, an adapter failure or a
/// bad ECU address end the check early.
pub async fn check_ecus(
    bus: &Bus,
    settings: &Settings,
    ecus: &[EcuConfig],
    ctx: &DiagContext,
) -> DiagnosticResult<EcuCheckReport> {
    ctx.progress(5, &format!("Acquiring bus {}", bus.label()));
    let mut lease = bus.acquire(ctx).await?;

    let total = ecus.len().max(1);
    let mut statuses = Vec::with_capacity(ecus.len());

    for (idx, ecu) in ecus.iter().enumerate() {
        let percent = 10 + ((idx + 1) * 80 / total) as u8;
        ctx.progress(percent, &format!("ECU {}: TesterPresent", ecu.name));

        let timing = settings.timing.with_response_timeout(ecu.timeout());
        let client = UdsClient::new(ecu.address_info()?, timing);

        let status = match client.tester_present(&mut *lease, ctx).await {
            Ok(()) => EcuStatus {
                ecu: ecu.name.clone(),
                active: true,
                error_count: 0,
                nrc: None,
                error: None,
            },
            Err(e @ (DiagnosticError::Cancelled | DiagnosticError::TransportFailure(_))) => {
                return Err(e)
            }
            Err(e) => EcuStatus {
                ecu: ecu.name.clone(),
                active: false,
                error_count: 1,
                nrc: e.nrc(),
                error: Some(e.to_string()),
            },
        };
        info!(ecu = %status.ecu, active = status.active, "ECU probed");
        statuses.push(status);
    }
    drop(lease);

    let ecus_ok = !statuses.is_empty() && statuses.iter().all(|s| s.active);
    ctx.progress(100, "ECU Active Check completed");
    Ok(EcuCheckReport {
        ecus_ok,
        ecu_statuses: statuses,
    })
}

/// Continuous battery voltage sampling
pub fn battery_voltage_stream(bus: &Bus, settings: &Settings, ctx: DiagContext) -> StreamHandle<Voltage> {
    StreamPump::spawn(
        bus.clone(),
        settings.client(),
        settings.scheduler(),
        BATTERY_VOLTAGE,
        settings.stream.clone(),
        ctx,
    )
}
