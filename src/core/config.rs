//! Service configuration and device register profiles.
//!
//! The service configuration is loaded once at startup from a YAML file with
//! a `PVSRV_` environment overlay. Device profiles map a device-type tag to a
//! named register table; after loading, the profile store is an opaque lookup
//! table for the driver factory.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::scanner::SCAN_BAUD_RATES;
use crate::core::simulation::SimulationParams;
use crate::utils::error::{PvSrvError, Result};

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Discovery scan loop period, seconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Data collection loop period, seconds
    #[serde(default = "default_data_interval")]
    pub data_interval_secs: u64,
}

fn default_service_name() -> String {
    "pvsrv".to_string()
}

fn default_scan_interval() -> u64 {
    30
}

fn default_data_interval() -> u64 {
    5
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            scan_interval_secs: default_scan_interval(),
            data_interval_secs: default_data_interval(),
        }
    }
}

/// Serial line settings shared by discovery and drivers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Per-transaction response timeout, milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Transaction attempts before a call is reported failed
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Baud rates probed during bus discovery
    #[serde(default = "default_baud_rates")]
    pub baud_rates: Vec<u32>,
    /// First bus station probed during discovery
    #[serde(default = "default_station_min")]
    pub station_min: u8,
    /// Last bus station probed during discovery
    #[serde(default = "default_station_max")]
    pub station_max: u8,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    3
}

fn default_baud_rates() -> Vec<u32> {
    SCAN_BAUD_RATES.to_vec()
}

fn default_station_min() -> u8 {
    1
}

fn default_station_max() -> u8 {
    247
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            baud_rates: default_baud_rates(),
            station_min: default_station_min(),
            station_max: default_station_max(),
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stations(&self) -> std::ops::RangeInclusive<u8> {
        self.station_min..=self.station_max
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvSrvConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    /// Skip hardware discovery entirely and run on synthetic data
    #[serde(default)]
    pub simulate_hardware: bool,
    #[serde(default)]
    pub simulation: SimulationParams,
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: String,
}

fn default_profiles_dir() -> String {
    "config/device_profiles".to_string()
}

impl Default for PvSrvConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            serial: SerialConfig::default(),
            simulate_hardware: false,
            simulation: SimulationParams::default(),
            profiles_dir: default_profiles_dir(),
        }
    }
}

impl PvSrvConfig {
    /// Load configuration from a YAML file with `PVSRV_` env overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("PVSRV_").split("__"))
            .extract()
            .map_err(|e| PvSrvError::ConfigError(format!("Failed to load configuration: {}", e)))
    }
}

/// Which register table a specification addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFunction {
    Input,
    Holding,
}

impl Default for RegisterFunction {
    fn default() -> Self {
        RegisterFunction::Holding
    }
}

/// One named register in a device profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSpec {
    #[serde(default)]
    pub function: RegisterFunction,
    pub address: u16,
    /// Register count: 1 for 16-bit values, 2 for 32-bit values
    #[serde(default = "default_register_count")]
    pub count: u16,
    /// Raw-to-engineering multiplier
    #[serde(default = "default_register_scale")]
    pub scale: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub signed: bool,
}

fn default_register_count() -> u16 {
    1
}

fn default_register_scale() -> f64 {
    1.0
}

/// Identity block of a device profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDevice {
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
}

/// Register map for one device type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device: ProfileDevice,
    /// Telemetry registers keyed by canonical field name
    #[serde(default)]
    pub registers: HashMap<String, RegisterSpec>,
    /// Writable control registers keyed by canonical field name
    #[serde(default)]
    pub controls: HashMap<String, RegisterSpec>,
}

/// Device profiles keyed by device-type tag
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: HashMap<String, Arc<DeviceProfile>>,
}

impl ProfileStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every `*.yaml`/`*.yml` profile in a directory.
    ///
    /// A missing directory yields an empty store; a malformed profile file is
    /// a startup configuration error.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut profiles = HashMap::new();

        if !dir.is_dir() {
            warn!("Device profile directory {} not found", dir.display());
            return Ok(Self { profiles });
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let text = std::fs::read_to_string(&path)?;
            let profile: DeviceProfile = serde_yaml::from_str(&text).map_err(|e| {
                PvSrvError::ConfigError(format!(
                    "Invalid device profile {}: {}",
                    path.display(),
                    e
                ))
            })?;

            info!("Loaded device profile: {}", profile.device.device_type);
            profiles.insert(profile.device.device_type.clone(), Arc::new(profile));
        }

        Ok(Self { profiles })
    }

    pub fn get(&self, device_type: &str) -> Option<Arc<DeviceProfile>> {
        self.profiles.get(device_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PROFILE_YAML: &str = r#"
device:
  type: generic_modbus
  name: Generic Modbus Inverter
  manufacturer: Unknown
registers:
  solar_power:
    function: input
    address: 3
    count: 2
    scale: 0.1
    unit: W
  battery_soc:
    function: input
    address: 18
controls:
  output_priority:
    address: 1
"#;

    #[test]
    fn load_profile_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("generic.yaml")).unwrap();
        file.write_all(PROFILE_YAML.as_bytes()).unwrap();

        let store = ProfileStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.len(), 1);

        let profile = store.get("generic_modbus").unwrap();
        let solar = &profile.registers["solar_power"];
        assert_eq!(solar.function, RegisterFunction::Input);
        assert_eq!(solar.address, 3);
        assert_eq!(solar.count, 2);
        assert!((solar.scale - 0.1).abs() < f64::EPSILON);

        let soc = &profile.registers["battery_soc"];
        assert_eq!(soc.count, 1);
        assert!((soc.scale - 1.0).abs() < f64::EPSILON);
        assert_eq!(profile.controls["output_priority"].function, RegisterFunction::Holding);
    }

    #[test]
    fn malformed_profile_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "device: [not, a, mapping]").unwrap();

        assert!(ProfileStore::load_dir(dir.path()).is_err());
    }

    #[test]
    fn missing_dir_yields_empty_store() {
        let store = ProfileStore::load_dir("/nonexistent/profiles").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn config_defaults() {
        let config = PvSrvConfig::default();
        assert_eq!(config.service.scan_interval_secs, 30);
        assert_eq!(config.service.data_interval_secs, 5);
        assert_eq!(config.serial.timeout_ms, 1000);
        assert_eq!(config.serial.retries, 3);
        assert_eq!(config.serial.stations(), 1..=247);
        assert!(!config.simulate_hardware);
    }
}
