//! Device driver abstraction and factory.
//!
//! Every driver is a small state machine over one bus device. Hardware
//! failures never escape a driver: connect and write report booleans, reads
//! report `None`, and the failure detail lands in the driver state where the
//! status operation can see it.

pub mod deye;
pub mod generic;
pub mod growatt;
pub mod simulation;
pub mod sma;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::core::config::{ProfileStore, SerialConfig};
use crate::core::transport::{ModbusRtuTransport, RegisterTransport};
use crate::core::types::{
    DeviceControl, DeviceData, DeviceInfo, DeviceStatus, DeviceSummary, DiscoveredDevice,
    HealthReport,
};

pub use deye::DeyeSunDriver;
pub use generic::GenericModbusDriver;
pub use growatt::GrowattSpfDriver;
pub use simulation::SimulationDriver;
pub use sma::SmaSunnyBoyDriver;

/// Consecutive connect failures before the reconnect circuit latches open
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Mutable driver state shared by all driver variants
#[derive(Debug, Clone)]
pub struct DriverState {
    pub status: DeviceStatus,
    pub last_data: Option<DeviceData>,
    pub last_error: Option<String>,
    pub connection_attempts: u32,
    pub max_retries: u32,
}

impl DriverState {
    pub fn new(status: DeviceStatus) -> Self {
        Self {
            status,
            last_data: None,
            last_error: None,
            connection_attempts: 0,
            max_retries: MAX_CONNECT_RETRIES,
        }
    }

    pub(crate) fn set_connected(&mut self) {
        self.status = DeviceStatus::Connected;
        self.last_error = None;
    }

    pub(crate) fn set_error(&mut self, message: impl Into<String>) {
        self.status = DeviceStatus::Error;
        self.last_error = Some(message.into());
    }
}

/// Capability interface implemented by every device driver
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn device_info(&self) -> &DeviceInfo;

    fn state(&self) -> &DriverState;

    fn state_mut(&mut self) -> &mut DriverState;

    /// Establish the connection; `false` on failure, never an error
    async fn connect(&mut self) -> bool;

    /// Tear down the connection; idempotent
    async fn disconnect(&mut self);

    /// Read one telemetry snapshot; `None` when the transport yields no
    /// data, leaving the status unchanged
    async fn read_data(&mut self) -> Option<DeviceData>;

    /// Apply a control payload; rejected with `false` when not connected
    async fn write_control(&mut self, control: &DeviceControl) -> bool;

    /// Liveness probe
    async fn test_connection(&mut self) -> bool;

    /// Reconnect after a failure, with a latched circuit breaker.
    ///
    /// Once the attempt counter reaches its limit no further connect is
    /// issued; only a fresh discovery scan installs a new driver and clears
    /// the condition.
    async fn auto_reconnect(&mut self) -> bool {
        match self.state().status {
            DeviceStatus::Connected | DeviceStatus::Connecting => return true,
            _ => {}
        }

        if self.state().connection_attempts >= self.state().max_retries {
            warn!(
                "Max reconnection attempts reached for {}",
                self.device_info().name
            );
            return false;
        }

        info!("Attempting to reconnect to {}", self.device_info().name);
        {
            let state = self.state_mut();
            state.status = DeviceStatus::Connecting;
            state.connection_attempts += 1;
        }

        if self.connect().await {
            let state = self.state_mut();
            state.set_connected();
            state.connection_attempts = 0;
            info!("Reconnected to {}", self.device_info().name);
            true
        } else {
            let name = self.device_info().name.clone();
            self.state_mut().status = DeviceStatus::Error;
            warn!("Failed to reconnect to {}", name);
            false
        }
    }

    /// Probe the device and fold the outcome into the driver state
    async fn health_check(&mut self) -> HealthReport {
        let responding = self.test_connection().await;
        let state = self.state_mut();
        if responding {
            state.set_connected();
        } else {
            state.set_error("Device not responding");
        }
        HealthReport {
            status: state.status,
            connected: responding,
            last_error: state.last_error.clone(),
            connection_attempts: state.connection_attempts,
        }
    }

    fn status_summary(&self) -> DeviceSummary {
        let info = self.device_info();
        let state = self.state();
        DeviceSummary {
            name: info.name.clone(),
            manufacturer: info.manufacturer.clone(),
            model: info.model.clone(),
            status: state.status,
            connected: state.status == DeviceStatus::Connected,
            last_error: state.last_error.clone(),
            connection_attempts: state.connection_attempts,
            last_data: state.last_data.as_ref().map(|d| d.timestamp),
            protocol: info.protocol.clone(),
            connection_string: info.connection_string.clone(),
        }
    }
}

/// Transport, station and state shared by the Modbus driver variants
pub(crate) struct ModbusDriverCore {
    pub info: DeviceInfo,
    pub state: DriverState,
    pub transport: Box<dyn RegisterTransport>,
    pub station: u8,
}

impl ModbusDriverCore {
    pub fn new(info: DeviceInfo, transport: Box<dyn RegisterTransport>, station: u8) -> Self {
        Self {
            info,
            state: DriverState::new(DeviceStatus::Disconnected),
            transport,
            station,
        }
    }

    pub async fn connect(&mut self) -> bool {
        self.state.status = DeviceStatus::Connecting;

        if !self.transport.open().await {
            self.state
                .set_error(format!("Failed to open {}", self.info.connection_string));
            return false;
        }

        if self.transport.test_connection(self.station).await {
            self.state.set_connected();
            info!("Connected to device: {}", self.info.name);
            true
        } else {
            self.transport.close().await;
            self.state
                .set_error(format!("Station {} not responding", self.station));
            false
        }
    }

    pub async fn disconnect(&mut self) {
        self.transport.close().await;
        self.state.status = DeviceStatus::Disconnected;
    }

    pub async fn test_connection(&mut self) -> bool {
        self.transport.is_open() && self.transport.test_connection(self.station).await
    }

    /// Store a snapshot as the driver's committed last data
    pub fn commit(&mut self, data: DeviceData) -> DeviceData {
        self.state.last_data = Some(data.clone());
        data
    }
}

/// Combine two registers into an unsigned 32-bit value, high word first
pub(crate) fn u32_from_regs(high: u16, low: u16) -> f64 {
    (((high as u32) << 16) | low as u32) as f64
}

/// Combine two registers into a signed 32-bit value, high word first
pub(crate) fn i32_from_regs(high: u16, low: u16) -> f64 {
    ((((high as u32) << 16) | low as u32) as i32) as f64
}

/// Conversion efficiency derived from the measured power flows, for vendor
/// maps without an efficiency register
pub(crate) fn derived_efficiency(
    solar_power: f64,
    battery_power: f64,
    grid_power: f64,
    load_power: f64,
) -> f64 {
    let input = solar_power + battery_power.max(0.0) + grid_power.max(0.0);
    if input <= 0.0 {
        return 0.0;
    }
    (load_power / input * 100.0).clamp(0.0, 100.0)
}

/// Map an identification tag to a concrete driver.
///
/// The vocabulary is matched case-insensitively; anything unrecognized runs
/// on the generic Modbus driver so one exotic inverter cannot fail a scan.
pub fn create_driver(
    discovered: &DiscoveredDevice,
    profiles: &ProfileStore,
    serial: &SerialConfig,
) -> Box<dyn DeviceDriver> {
    let tag = discovered.identification.to_lowercase();
    let transport = Box::new(
        ModbusRtuTransport::new(&discovered.port, discovered.baud_rate)
            .with_timeout(serial.timeout())
            .with_retries(serial.retries),
    );

    if tag.contains("growatt") || tag.contains("spf") {
        return Box::new(GrowattSpfDriver::new(discovered, transport));
    }
    // "sunny" must win over the shorter Deye keyword "sun"
    if tag.contains("sma") || tag.contains("sunny") {
        return Box::new(SmaSunnyBoyDriver::new(discovered, transport));
    }
    if tag.contains("deye") || tag.contains("sun") {
        return Box::new(DeyeSunDriver::new(discovered, transport));
    }
    if tag.contains("fronius") || tag.contains("symo") {
        warn!(
            "No dedicated driver for Fronius device '{}', using generic Modbus driver",
            discovered.identification
        );
    }
    Box::new(GenericModbusDriver::new(
        discovered,
        transport,
        profiles.get("generic_modbus"),
    ))
}

/// Connection descriptor in the canonical "port:baud:station" form
pub(crate) fn connection_string(discovered: &DiscoveredDevice) -> String {
    format!(
        "{}:{}:{}",
        discovered.port, discovered.baud_rate, discovered.station
    )
}
