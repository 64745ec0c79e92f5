//! Deye SUN series hybrid inverter driver.
//!
//! The SUN hybrid layout spreads telemetry across a few holding-register
//! blocks; battery and grid power are signed 16-bit values, temperatures
//! carry a 1000-count offset at 0.1 degC resolution.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::core::transport::RegisterTransport;
use crate::core::types::{
    DeviceControl, DeviceData, DeviceInfo, DeviceStatus, DeviceType, DiscoveredDevice,
};

use super::{
    connection_string, derived_efficiency, DeviceDriver, DriverState, ModbusDriverCore,
};

// Battery block
const BATTERY_BLOCK_START: u16 = 586;
const BATTERY_BLOCK_LEN: u16 = 5;
const OFF_BATTERY_VOLTAGE: usize = 1; // 587, 0.01 V
const OFF_BATTERY_SOC: usize = 2; // 588, %
const OFF_BATTERY_POWER: usize = 4; // 590, signed W, positive discharging

// Grid and load block
const GRID_BLOCK_START: u16 = 619;
const GRID_BLOCK_LEN: u16 = 7;
const OFF_GRID_POWER: usize = 0; // 619, signed W, positive importing
const OFF_LOAD_POWER: usize = 6; // 625, W

// PV block
const PV_BLOCK_START: u16 = 672;
const PV_BLOCK_LEN: u16 = 2; // pv1, pv2 power, W

// Radiator temperature, 0.1 degC with 1000 offset
const REG_TEMPERATURE: u16 = 541;

// Control holding registers
const HREG_CHARGE_LIMIT: u16 = 108;
const HREG_DISCHARGE_LIMIT: u16 = 109;
const HREG_EMERGENCY_POWER: u16 = 141;
const HREG_OUTPUT_PRIORITY: u16 = 142;
const HREG_EXPORT_LIMIT: u16 = 143;

pub struct DeyeSunDriver {
    core: ModbusDriverCore,
}

impl DeyeSunDriver {
    pub fn new(discovered: &DiscoveredDevice, transport: Box<dyn RegisterTransport>) -> Self {
        let info = DeviceInfo {
            name: "Deye SUN Series".to_string(),
            manufacturer: "Deye".to_string(),
            model: "SUN Series".to_string(),
            serial_number: discovered.identification.clone(),
            firmware_version: "unknown".to_string(),
            device_type: DeviceType::DeyeSun,
            protocol: "modbus_rtu".to_string(),
            connection_string: connection_string(discovered),
        };
        Self {
            core: ModbusDriverCore::new(info, transport, discovered.station),
        }
    }
}

#[async_trait]
impl DeviceDriver for DeyeSunDriver {
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

        let station = self.core.station;
        let transport = &mut self.core.transport;

        let result = async {
            let battery = transport
                .read_holding_registers(station, BATTERY_BLOCK_START, BATTERY_BLOCK_LEN)
                .await?;
            let grid = transport
                .read_holding_registers(station, GRID_BLOCK_START, GRID_BLOCK_LEN)
                .await?;
            let pv = transport
                .read_holding_registers(station, PV_BLOCK_START, PV_BLOCK_LEN)
                .await?;
            let temp = transport
                .read_holding_registers(station, REG_TEMPERATURE, 1)
                .await?;
            Ok::<_, crate::utils::error::PvSrvError>((battery, grid, pv, temp))
        }
        .await;

        let (battery, grid, pv, temp) = match result {
            Ok(blocks) => blocks,
            Err(e) => {
                debug!("Telemetry read failed for {}: {}", self.core.info.name, e);
                return None;
            }
        };

        let solar_power_w = pv.iter().map(|&r| r as f64).sum::<f64>();
        let battery_power_w = battery[OFF_BATTERY_POWER] as i16 as f64;
        let grid_power_w = grid[OFF_GRID_POWER] as i16 as f64;
        let load_power_w = grid[OFF_LOAD_POWER] as f64;

        let data = DeviceData {
            timestamp: Utc::now(),
            solar_power_w,
            battery_power_w,
            load_power_w,
            grid_power_w,
            battery_soc_percent: battery[OFF_BATTERY_SOC] as f64,
            battery_voltage_v: battery[OFF_BATTERY_VOLTAGE] as f64 * 0.01,
            system_efficiency_percent: derived_efficiency(
                solar_power_w,
                battery_power_w,
                grid_power_w,
                load_power_w,
            ),
            temperature_c: (temp[0] as f64 - 1000.0) * 0.1,
            device_status: DeviceStatus::Connected,
            error_code: None,
        };
        Some(self.core.commit(data))
    }

    async fn write_control(&mut self, control: &DeviceControl) -> bool {
        if self.core.state.status != DeviceStatus::Connected {
            return false;
        }

        let station = self.core.station;
        let writes = [
            (HREG_OUTPUT_PRIORITY, control.output_priority.register_value()),
            (HREG_CHARGE_LIMIT, control.battery_charge_limit.clamp(0.0, 100.0) as u16),
            (
                HREG_DISCHARGE_LIMIT,
                control.battery_discharge_limit.clamp(0.0, 100.0) as u16,
            ),
            (
                HREG_EXPORT_LIMIT,
                control.grid_export_limit.clamp(0.0, u16::MAX as f64) as u16,
            ),
            (HREG_EMERGENCY_POWER, control.emergency_power as u16),
        ];

        for (address, value) in writes {
            if let Err(e) = self.core.transport.write_register(station, address, value).await {
                warn!(
                    "Control write to {} register {} failed: {}",
                    self.core.info.name, address, e
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
    use crate::core::transport::testing::MockTransport;

    fn discovered() -> DiscoveredDevice {
        DiscoveredDevice {
            port: "/dev/ttyUSB1".to_string(),
            baud_rate: 9600,
            station: 3,
            identification: "DEYE SUN-8K-SG04".to_string(),
            registers: Vec::new(),
        }
    }

    fn mock_with_telemetry() -> MockTransport {
        let mut mock = MockTransport::new().with_station(3);
        mock.holding.insert(587, 5320); // 53.20 V
        mock.holding.insert(588, 67); // SOC %
        mock.holding.insert(590, (-850i16) as u16); // charging at 850 W
        mock.holding.insert(619, 120); // importing 120 W
        mock.holding.insert(625, 1470); // load W
        mock.holding.insert(672, 1400); // pv1 W
        mock.holding.insert(673, 800); // pv2 W
        mock.holding.insert(541, 1385); // 38.5 degC
        mock
    }

    #[tokio::test]
    async fn decodes_split_register_blocks() {
        let mut driver = DeyeSunDriver::new(&discovered(), Box::new(mock_with_telemetry()));
        assert!(driver.connect().await);

        let data = driver.read_data().await.expect("telemetry expected");
        assert!((data.solar_power_w - 2200.0).abs() < 1e-9);
        assert!((data.battery_power_w + 850.0).abs() < 1e-9);
        assert!((data.grid_power_w - 120.0).abs() < 1e-9);
        assert!((data.load_power_w - 1470.0).abs() < 1e-9);
        assert!((data.battery_voltage_v - 53.20).abs() < 1e-9);
        assert!((data.battery_soc_percent - 67.0).abs() < 1e-9);
        assert!((data.temperature_c - 38.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_block_read_yields_no_data_and_keeps_status() {
        let mut mock = mock_with_telemetry();
        let mut driver = DeyeSunDriver::new(&discovered(), Box::new(mock_with_telemetry()));
        assert!(driver.connect().await);

        // Replace the transport with one whose station went silent
        mock.stations.clear();
        driver.core.transport = Box::new(mock);
        driver.core.transport.open().await;

        assert!(driver.read_data().await.is_none());
        assert_eq!(driver.state().status, DeviceStatus::Connected);
    }
}
