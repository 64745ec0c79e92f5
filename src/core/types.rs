//! Data types shared across the hardware layer.
//!
//! Sign conventions for power flows: battery power is positive when
//! discharging and negative when charging; grid power is positive when
//! importing and negative when exporting.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Simulation,
}

impl DeviceStatus {
    /// Whether a driver in this state serves telemetry reads
    pub fn is_readable(&self) -> bool {
        matches!(self, DeviceStatus::Connected | DeviceStatus::Simulation)
    }
}

/// Supported device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    GrowattSpf,
    DeyeSun,
    SmaSunnyBoy,
    GenericModbus,
    Simulation,
}

/// Immutable device identity, created once when a driver is instantiated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub device_type: DeviceType,
    pub protocol: String,
    /// Connection descriptor, e.g. "/dev/ttyUSB0:9600:17"
    pub connection_string: String,
}

/// One telemetry snapshot, immutable once produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceData {
    pub timestamp: DateTime<Utc>,
    pub solar_power_w: f64,
    pub battery_power_w: f64,
    pub load_power_w: f64,
    pub grid_power_w: f64,
    pub battery_soc_percent: f64,
    pub battery_voltage_v: f64,
    pub system_efficiency_percent: f64,
    pub temperature_c: f64,
    pub device_status: DeviceStatus,
    pub error_code: Option<String>,
}

/// Output source priority for hybrid inverters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPriority {
    Solar,
    Battery,
    Grid,
}

impl OutputPriority {
    /// Register encoding shared by the vendor register maps
    pub fn register_value(&self) -> u16 {
        match self {
            OutputPriority::Solar => 0,
            OutputPriority::Battery => 1,
            OutputPriority::Grid => 2,
        }
    }
}

/// Control command payload, consumed by a single write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceControl {
    pub output_priority: OutputPriority,
    /// Battery charge limit, 0-100 %
    pub battery_charge_limit: f64,
    /// Battery discharge limit, 0-100 %
    pub battery_discharge_limit: f64,
    /// Grid export limit, W
    pub grid_export_limit: f64,
    pub emergency_power: bool,
}

impl Default for DeviceControl {
    fn default() -> Self {
        Self {
            output_priority: OutputPriority::Solar,
            battery_charge_limit: 100.0,
            battery_discharge_limit: 0.0,
            grid_export_limit: 0.0,
            emergency_power: false,
        }
    }
}

/// Per-device status summary for the external status operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub status: DeviceStatus,
    pub connected: bool,
    pub last_error: Option<String>,
    pub connection_attempts: u32,
    pub last_data: Option<DateTime<Utc>>,
    pub protocol: String,
    pub connection_string: String,
}

/// Result of a driver health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: DeviceStatus,
    pub connected: bool,
    pub last_error: Option<String>,
    pub connection_attempts: u32,
}

/// An OS-visible serial port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortSummary {
    pub path: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
}

/// A serial port recognized as a USB-to-RS485 bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rs485Adapter {
    pub path: String,
    pub chip: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
}

/// A responding bus station found during discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub port: String,
    pub baud_rate: u32,
    pub station: u8,
    /// Heuristically decoded identification tag
    pub identification: String,
    /// First registers of the identification window, kept for diagnostics
    pub registers: Vec<u16>,
}

/// Outcome classification of a scan request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Completed,
    Scanning,
    Failed,
}

/// Result of one discovery scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub status: ScanStatus,
    pub devices: Vec<DiscoveredDevice>,
    pub simulation_mode: bool,
    pub error: Option<String>,
}

/// Aggregate status of the device manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub simulation_mode: bool,
    pub total_devices: usize,
    pub connected_devices: usize,
    pub devices: HashMap<String, DeviceSummary>,
    pub last_scan: Option<DateTime<Utc>>,
    pub scanning: bool,
}
