//! Generic Modbus driver for devices without a dedicated vendor map.
//!
//! Telemetry and control registers come from an external device profile.
//! Without a profile the driver keeps the connection alive but reports no
//! data: guessing register semantics on an unknown inverter is how
//! configurations get corrupted.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::config::{DeviceProfile, RegisterFunction, RegisterSpec};
use crate::core::transport::RegisterTransport;
use crate::core::types::{
    DeviceControl, DeviceData, DeviceInfo, DeviceStatus, DeviceType, DiscoveredDevice,
};

use super::{connection_string, i32_from_regs, u32_from_regs, DeviceDriver, DriverState, ModbusDriverCore};

pub struct GenericModbusDriver {
    core: ModbusDriverCore,
    profile: Option<Arc<DeviceProfile>>,
}

impl GenericModbusDriver {
    pub fn new(
        discovered: &DiscoveredDevice,
        transport: Box<dyn RegisterTransport>,
        profile: Option<Arc<DeviceProfile>>,
    ) -> Self {
        let (name, manufacturer, model) = match &profile {
            Some(p) => (
                p.device.name.clone(),
                p.device.manufacturer.clone(),
                p.device.model.clone(),
            ),
            None => (
                "Generic Modbus Device".to_string(),
                "Unknown".to_string(),
                "Modbus Device".to_string(),
            ),
        };

        let info = DeviceInfo {
            name,
            manufacturer,
            model,
            serial_number: discovered.identification.clone(),
            firmware_version: "unknown".to_string(),
            device_type: DeviceType::GenericModbus,
            protocol: "modbus_rtu".to_string(),
            connection_string: connection_string(discovered),
        };
        Self {
            core: ModbusDriverCore::new(info, transport, discovered.station),
            profile,
        }
    }

    async fn read_spec(&mut self, spec: &RegisterSpec) -> Option<f64> {
        let station = self.core.station;
        let result = match spec.function {
            RegisterFunction::Input => {
                self.core
                    .transport
                    .read_input_registers(station, spec.address, spec.count)
                    .await
            }
            RegisterFunction::Holding => {
                self.core
                    .transport
                    .read_holding_registers(station, spec.address, spec.count)
                    .await
            }
        };

        let regs = result.ok()?;
        let raw = match regs.as_slice() {
            [single] => {
                if spec.signed {
                    *single as i16 as f64
                } else {
                    *single as f64
                }
            }
            [high, low] => {
                if spec.signed {
                    i32_from_regs(*high, *low)
                } else {
                    u32_from_regs(*high, *low)
                }
            }
            _ => return None,
        };
        Some(raw * spec.scale)
    }
}

#[async_trait]
impl DeviceDriver for GenericModbusDriver {
    fn device_info(&self) -> &DeviceInfo {
        &self.core.info
    }

    fn state(&self) -> &DriverState {
        &self.core.state
    }

    fn state_mut(&mut self) -> &mut DriverState {
        &mut self.core.state
    }

    async fn connect(&mut self) -> bool {
        self.core.connect().await
    }

    async fn disconnect(&mut self) {
        self.core.disconnect().await;
    }

    async fn read_data(&mut self) -> Option<DeviceData> {
        if !self.core.state.status.is_readable() {
            return None;
        }

        let Some(profile) = self.profile.clone() else {
            debug!(
                "No register profile for {}, reporting no data",
                self.core.info.connection_string
            );
            return None;
        };

        let mut any_read = false;
        let field = |name: &str| -> Option<RegisterSpec> { profile.registers.get(name).cloned() };

        let mut values = [0.0f64; 8];
        let names = [
            "solar_power",
            "battery_power",
            "load_power",
            "grid_power",
            "battery_soc",
            "battery_voltage",
            "efficiency",
            "temperature",
        ];
        for (slot, name) in values.iter_mut().zip(names) {
            if let Some(spec) = field(name) {
                if let Some(value) = self.read_spec(&spec).await {
                    *slot = value;
                    any_read = true;
                }
            }
        }

        if !any_read {
            debug!("No mapped register answered for {}", self.core.info.name);
            return None;
        }

        let [solar, battery, load, grid, soc, voltage, efficiency, temperature] = values;
        let data = DeviceData {
            timestamp: Utc::now(),
            solar_power_w: solar,
            battery_power_w: battery,
            load_power_w: load,
            grid_power_w: grid,
            battery_soc_percent: soc,
            battery_voltage_v: voltage,
            system_efficiency_percent: efficiency,
            temperature_c: temperature,
            device_status: DeviceStatus::Connected,
            error_code: None,
        };
        Some(self.core.commit(data))
    }

    async fn write_control(&mut self, control: &DeviceControl) -> bool {
        if self.core.state.status != DeviceStatus::Connected {
            return false;
        }

        let Some(profile) = self.profile.clone() else {
            debug!(
                "No control mapping for {}, rejecting write",
                self.core.info.connection_string
            );
            return false;
        };
        if profile.controls.is_empty() {
            return false;
        }

        let fields = [
            (
                "output_priority",
                control.output_priority.register_value() as f64,
            ),
            ("battery_charge_limit", control.battery_charge_limit),
            ("battery_discharge_limit", control.battery_discharge_limit),
            ("grid_export_limit", control.grid_export_limit),
            ("emergency_power", control.emergency_power as u16 as f64),
        ];

        let station = self.core.station;
        for (name, value) in fields {
            let Some(spec) = profile.controls.get(name) else {
                continue;
            };
            let raw = (value / spec.scale).round();
            let result = if spec.count == 2 {
                let raw = raw.clamp(0.0, u32::MAX as f64) as u32;
                let pair = [(raw >> 16) as u16, raw as u16];
                self.core
                    .transport
                    .write_registers(station, spec.address, &pair)
                    .await
            } else {
                let raw = raw.clamp(0.0, u16::MAX as f64) as u16;
                self.core
                    .transport
                    .write_register(station, spec.address, raw)
                    .await
            };

            if let Err(e) = result {
                warn!(
                    "Control write '{}' to {} failed: {}",
                    name, self.core.info.name, e
                );
                return false;
            }
        }
        true
    }

    async fn test_connection(&mut self) -> bool {
        self.core.test_connection().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ProfileDevice;
    use crate::core::transport::testing::MockTransport;
    use std::collections::HashMap;

    fn discovered() -> DiscoveredDevice {
        DiscoveredDevice {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            station: 5,
            identification: "ACME POWERBOX".to_string(),
            registers: Vec::new(),
        }
    }

    fn spec(function: RegisterFunction, address: u16, count: u16, scale: f64, signed: bool) -> RegisterSpec {
        RegisterSpec {
            function,
            address,
            count,
            scale,
            unit: None,
            signed,
        }
    }

    fn profile() -> Arc<DeviceProfile> {
        let mut registers = HashMap::new();
        registers.insert(
            "solar_power".to_string(),
            spec(RegisterFunction::Input, 10, 2, 0.1, false),
        );
        registers.insert(
            "battery_power".to_string(),
            spec(RegisterFunction::Input, 20, 1, 1.0, true),
        );
        registers.insert(
            "battery_soc".to_string(),
            spec(RegisterFunction::Holding, 30, 1, 1.0, false),
        );

        let mut controls = HashMap::new();
        controls.insert(
            "grid_export_limit".to_string(),
            spec(RegisterFunction::Holding, 100, 1, 10.0, false),
        );

        Arc::new(DeviceProfile {
            device: ProfileDevice {
                device_type: "generic_modbus".to_string(),
                name: "Generic Modbus Inverter".to_string(),
                manufacturer: "Unknown".to_string(),
                model: "GM-1".to_string(),
            },
            registers,
            controls,
        })
    }

    fn mock_with_telemetry() -> MockTransport {
        let mut mock = MockTransport::new().with_station(5);
        mock.input.insert(10, 0);
        mock.input.insert(11, 21500); // 2150.0 W at scale 0.1
        mock.input.insert(20, (-400i16) as u16); // signed battery power
        mock.holding.insert(30, 58);
        mock
    }

    #[tokio::test]
    async fn profile_driven_read_scales_and_signs() {
        let mut driver =
            GenericModbusDriver::new(&discovered(), Box::new(mock_with_telemetry()), Some(profile()));
        assert!(driver.connect().await);

        let data = driver.read_data().await.expect("telemetry expected");
        assert!((data.solar_power_w - 2150.0).abs() < 1e-9);
        assert!((data.battery_power_w + 400.0).abs() < 1e-9);
        assert!((data.battery_soc_percent - 58.0).abs() < 1e-9);
        // Unmapped fields stay at zero
        assert_eq!(data.load_power_w, 0.0);
    }

    #[tokio::test]
    async fn no_profile_means_no_data() {
        let mut driver =
            GenericModbusDriver::new(&discovered(), Box::new(mock_with_telemetry()), None);
        assert!(driver.connect().await);
        assert!(driver.read_data().await.is_none());
        assert!(!driver.write_control(&DeviceControl::default()).await);
    }

    #[tokio::test]
    async fn control_write_encodes_with_inverse_scale() {
        let mock = mock_with_telemetry();
        let written = std::sync::Arc::clone(&mock.written);
        let mut driver = GenericModbusDriver::new(&discovered(), Box::new(mock), Some(profile()));
        assert!(driver.connect().await);

        let control = DeviceControl {
            grid_export_limit: 2500.0,
            ..DeviceControl::default()
        };
        assert!(driver.write_control(&control).await);

        // 2500 W at 10 W/count resolution
        let written = written.lock().unwrap();
        assert_eq!(written.as_slice(), &[(100, vec![250])]);
    }
}
