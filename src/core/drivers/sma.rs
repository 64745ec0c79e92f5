//! SMA Sunny Boy / Sunny Island driver.
//!
//! SMA devices expose 32-bit values in the 30xxx measurement range and take
//! settings as 32-bit writes in the 40xxx range. Output priority has no
//! register equivalent on this platform and is skipped.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::core::transport::RegisterTransport;
use crate::core::types::{
    DeviceControl, DeviceData, DeviceInfo, DeviceStatus, DeviceType, DiscoveredDevice,
};

use super::{
    connection_string, derived_efficiency, i32_from_regs, u32_from_regs, DeviceDriver,
    DriverState, ModbusDriverCore,
};

// Measurement registers, all 32-bit pairs
const REG_AC_POWER: u16 = 30775; // W, signed
const REG_BATTERY_SOC: u16 = 30845; // %
const REG_BATTERY_VOLTAGE: u16 = 30851; // 0.01 V
const REG_BATTERY_POWER: u16 = 30865; // W, signed, positive discharging
const REG_GRID_POWER: u16 = 30885; // W, signed, positive importing
const REG_TEMPERATURE: u16 = 30953; // 0.1 degC, signed

// Setting registers, 32-bit pairs
const HREG_CHARGE_LIMIT: u16 = 40793; // W
const HREG_DISCHARGE_LIMIT: u16 = 40795; // W
const HREG_EXPORT_LIMIT: u16 = 40915; // W
const HREG_EMERGENCY_POWER: u16 = 40237; // backup operation on/off

pub struct SmaSunnyBoyDriver {
    core: ModbusDriverCore,
}

impl SmaSunnyBoyDriver {
    pub fn new(discovered: &DiscoveredDevice, transport: Box<dyn RegisterTransport>) -> Self {
        let info = DeviceInfo {
            name: "SMA Sunny Boy".to_string(),
            manufacturer: "SMA".to_string(),
            model: "Sunny Boy".to_string(),
            serial_number: discovered.identification.clone(),
            firmware_version: "unknown".to_string(),
            device_type: DeviceType::SmaSunnyBoy,
            protocol: "modbus_rtu".to_string(),
            connection_string: connection_string(discovered),
        };
        Self {
            core: ModbusDriverCore::new(info, transport, discovered.station),
        }
    }

    async fn read_pair(&mut self, address: u16) -> crate::utils::error::Result<[u16; 2]> {
        let regs = self
            .core
            .transport
            .read_holding_registers(self.core.station, address, 2)
            .await?;
        Ok([regs[0], regs[1]])
    }
}

#[async_trait]
impl DeviceDriver for SmaSunnyBoyDriver {
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

        let result = async {
            let ac = self.read_pair(REG_AC_POWER).await?;
            let soc = self.read_pair(REG_BATTERY_SOC).await?;
            let voltage = self.read_pair(REG_BATTERY_VOLTAGE).await?;
            let battery = self.read_pair(REG_BATTERY_POWER).await?;
            let grid = self.read_pair(REG_GRID_POWER).await?;
            let temp = self.read_pair(REG_TEMPERATURE).await?;
            Ok::<_, crate::utils::error::PvSrvError>((ac, soc, voltage, battery, grid, temp))
        }
        .await;

        let (ac, soc, voltage, battery, grid, temp) = match result {
            Ok(values) => values,
            Err(e) => {
                debug!("Telemetry read failed for {}: {}", self.core.info.name, e);
                return None;
            }
        };

        let solar_power_w = i32_from_regs(ac[0], ac[1]).max(0.0);
        let battery_power_w = i32_from_regs(battery[0], battery[1]);
        let grid_power_w = i32_from_regs(grid[0], grid[1]);
        // No load register on this map; close the power balance
        let load_power_w = (solar_power_w + battery_power_w + grid_power_w).max(0.0);

        let data = DeviceData {
            timestamp: Utc::now(),
            solar_power_w,
            battery_power_w,
            load_power_w,
            grid_power_w,
            battery_soc_percent: u32_from_regs(soc[0], soc[1]),
            battery_voltage_v: u32_from_regs(voltage[0], voltage[1]) * 0.01,
            system_efficiency_percent: derived_efficiency(
                solar_power_w,
                battery_power_w,
                grid_power_w,
                load_power_w,
            ),
            temperature_c: i32_from_regs(temp[0], temp[1]) * 0.1,
            device_status: DeviceStatus::Connected,
            error_code: None,
        };
        Some(self.core.commit(data))
    }

    async fn write_control(&mut self, control: &DeviceControl) -> bool {
        if self.core.state.status != DeviceStatus::Connected {
            return false;
        }

        // No output-priority register on SMA storage devices
        debug!(
            "Output priority {:?} not supported by {}, skipping",
            control.output_priority, self.core.info.name
        );

        let station = self.core.station;
        // Percent limits are applied against the rated charge/discharge power
        let charge_w = (control.battery_charge_limit.clamp(0.0, 100.0) / 100.0 * 5000.0) as u32;
        let discharge_w =
            (control.battery_discharge_limit.clamp(0.0, 100.0) / 100.0 * 5000.0) as u32;
        let export_w = control.grid_export_limit.max(0.0) as u32;

        let writes = [
            (HREG_CHARGE_LIMIT, charge_w),
            (HREG_DISCHARGE_LIMIT, discharge_w),
            (HREG_EXPORT_LIMIT, export_w),
            (HREG_EMERGENCY_POWER, control.emergency_power as u32),
        ];

        for (address, value) in writes {
            let pair = [(value >> 16) as u16, value as u16];
            if let Err(e) = self
                .core
                .transport
                .write_registers(station, address, &pair)
                .await
            {
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
            port: "/dev/ttyUSB2".to_string(),
            baud_rate: 19200,
            station: 126,
            identification: "SMA Sunny Boy 5.0".to_string(),
            registers: Vec::new(),
        }
    }

    fn insert_pair(mock: &mut MockTransport, address: u16, value: i64) {
        let raw = value as u32;
        mock.holding.insert(address, (raw >> 16) as u16);
        mock.holding.insert(address + 1, raw as u16);
    }

    fn mock_with_telemetry() -> MockTransport {
        let mut mock = MockTransport::new().with_station(126);
        insert_pair(&mut mock, REG_AC_POWER, 4200);
        insert_pair(&mut mock, REG_BATTERY_SOC, 91);
        insert_pair(&mut mock, REG_BATTERY_VOLTAGE, 4985); // 49.85 V
        insert_pair(&mut mock, REG_BATTERY_POWER, -1500); // charging
        insert_pair(&mut mock, REG_GRID_POWER, -900); // exporting
        insert_pair(&mut mock, REG_TEMPERATURE, 365); // 36.5 degC
        mock
    }

    #[tokio::test]
    async fn decodes_signed_32bit_pairs() {
        let mut driver = SmaSunnyBoyDriver::new(&discovered(), Box::new(mock_with_telemetry()));
        assert!(driver.connect().await);

        let data = driver.read_data().await.expect("telemetry expected");
        assert!((data.solar_power_w - 4200.0).abs() < 1e-9);
        assert!((data.battery_power_w + 1500.0).abs() < 1e-9);
        assert!((data.grid_power_w + 900.0).abs() < 1e-9);
        assert!((data.load_power_w - 1800.0).abs() < 1e-9);
        assert!((data.battery_soc_percent - 91.0).abs() < 1e-9);
        assert!((data.battery_voltage_v - 49.85).abs() < 1e-9);
        assert!((data.temperature_c - 36.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn control_writes_use_32bit_blocks() {
        let mock = mock_with_telemetry();
        let written = std::sync::Arc::clone(&mock.written);
        let mut driver = SmaSunnyBoyDriver::new(&discovered(), Box::new(mock));
        assert!(driver.connect().await);

        assert!(driver.write_control(&DeviceControl::default()).await);

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 4);
        // Default charge limit is 100 % of the 5 kW rating
        assert_eq!(written[0], (HREG_CHARGE_LIMIT, vec![0, 5000]));
        assert_eq!(written[3], (HREG_EMERGENCY_POWER, vec![0, 0]));
    }
}
