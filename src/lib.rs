//! # pvsrv - Solar/Battery Hardware Abstraction Service
//!
//! Finds inverter and battery devices on a shared RS485 bus, classifies
//! them, keeps resilient connections to heterogeneous vendor register maps,
//! and falls back to a synthetic data generator when no hardware answers.
//!
//! The surrounding application drives the service through a small contract:
//! `start`/`stop` for lifecycle, `scan`, `status`, `latest_data` and
//! `write_control` for operation. Rendering, routing and persistence live
//! with that application, not here.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pvsrv::{DeviceManager, ProfileStore, PvSrvConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PvSrvConfig::default();
//!     let profiles = ProfileStore::empty();
//!
//!     let manager = DeviceManager::new(config, profiles);
//!     manager.start().await;
//!
//!     if let Some(data) = manager.latest_data().await {
//!         println!("solar: {} W, SOC: {} %", data.solar_power_w, data.battery_soc_percent);
//!     }
//!
//!     manager.stop().await;
//! }
//! ```

pub mod core;
pub mod utils;

// === Device manager API ===
pub use crate::core::manager::{DeviceManager, SIMULATOR_DEVICE_ID};

// === Configuration ===
pub use crate::core::config::{DeviceProfile, ProfileStore, PvSrvConfig};

// === Core types ===
pub use crate::core::types::{
    DeviceControl, DeviceData, DeviceInfo, DeviceStatus, DeviceSummary, DeviceType,
    DiscoveredDevice, HealthReport, OutputPriority, Rs485Adapter, ScanResult, ScanStatus,
    SerialPortSummary, StatusSummary,
};

// === Drivers and transport (advanced usage) ===
pub use crate::core::drivers::{create_driver, DeviceDriver, DriverState};
pub use crate::core::transport::{ModbusRtuTransport, RegisterTransport};

// === Simulation ===
pub use crate::core::simulation::{SimulationEngine, SimulationParams};

// === Error handling ===
pub use crate::utils::error::{PvSrvError, Result};
