//! Growatt SPF series storage inverter driver.
//!
//! Telemetry comes from one input-register block; power values are 32-bit
//! with 0.1 W resolution, battery voltage is centivolts. Control settings go
//! to individual holding registers.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::core::transport::RegisterTransport;
use crate::core::types::{
    DeviceControl, DeviceData, DeviceInfo, DeviceStatus, DeviceType, DiscoveredDevice,
};

use super::{
    connection_string, derived_efficiency, u32_from_regs, DeviceDriver, DriverState,
    ModbusDriverCore,
};

/// Start of the telemetry input-register block
const INPUT_BLOCK_START: u16 = 0;
/// Registers in the telemetry block
const INPUT_BLOCK_LEN: u16 = 27;

// Offsets within the telemetry block
const OFF_PV_POWER_H: usize = 3; // PV charging power, 0.1 W, 32-bit
const OFF_OUTPUT_POWER_H: usize = 9; // output active power, 0.1 W, 32-bit
const OFF_GRID_POWER_H: usize = 13; // AC input power, 0.1 W, 32-bit
const OFF_BATTERY_VOLTAGE: usize = 17; // 0.01 V
const OFF_BATTERY_SOC: usize = 18; // %
const OFF_INVERTER_TEMP: usize = 25; // 0.1 degC

// Holding registers for control settings
const HREG_OUTPUT_PRIORITY: u16 = 1;
const HREG_EMERGENCY_POWER: u16 = 23;
const HREG_CHARGE_LIMIT: u16 = 34; // max charge, % of rated current
const HREG_DISCHARGE_LIMIT: u16 = 37; // max discharge, % of rated current
const HREG_EXPORT_LIMIT: u16 = 122; // grid export ceiling, W

pub struct GrowattSpfDriver {
    core: ModbusDriverCore,
}

impl GrowattSpfDriver {
    pub fn new(discovered: &DiscoveredDevice, transport: Box<dyn RegisterTransport>) -> Self {
        let info = DeviceInfo {
            name: "Growatt SPF Series".to_string(),
            manufacturer: "Growatt".to_string(),
            model: "SPF Series".to_string(),
            serial_number: discovered.identification.clone(),
            firmware_version: "unknown".to_string(),
            device_type: DeviceType::GrowattSpf,
            protocol: "modbus_rtu".to_string(),
            connection_string: connection_string(discovered),
        };
        Self {
            core: ModbusDriverCore::new(info, transport, discovered.station),
        }
    }

    fn decode(&self, regs: &[u16]) -> DeviceData {
        let solar_power_w = u32_from_regs(regs[OFF_PV_POWER_H], regs[OFF_PV_POWER_H + 1]) * 0.1;
        let load_power_w =
            u32_from_regs(regs[OFF_OUTPUT_POWER_H], regs[OFF_OUTPUT_POWER_H + 1]) * 0.1;
        let grid_power_w =
            u32_from_regs(regs[OFF_GRID_POWER_H], regs[OFF_GRID_POWER_H + 1]) * 0.1;
        // The SPF map has no battery power register; close the power balance
        let battery_power_w = load_power_w - solar_power_w - grid_power_w;

        DeviceData {
            timestamp: Utc::now(),
            solar_power_w,
            battery_power_w,
            load_power_w,
            grid_power_w,
            battery_soc_percent: regs[OFF_BATTERY_SOC] as f64,
            battery_voltage_v: regs[OFF_BATTERY_VOLTAGE] as f64 * 0.01,
            system_efficiency_percent: derived_efficiency(
                solar_power_w,
                battery_power_w,
                grid_power_w,
                load_power_w,
            ),
            temperature_c: regs[OFF_INVERTER_TEMP] as f64 * 0.1,
            device_status: DeviceStatus::Connected,
            error_code: None,
        }
    }
}

#[async_trait]
impl DeviceDriver for GrowattSpfDriver {
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
        match self
            .core
            .transport
            .read_input_registers(station, INPUT_BLOCK_START, INPUT_BLOCK_LEN)
            .await
        {
            Ok(regs) if regs.len() == INPUT_BLOCK_LEN as usize => {
                let data = self.decode(&regs);
                Some(self.core.commit(data))
            }
            Ok(regs) => {
                debug!("Short telemetry block from {}: {} registers", self.core.info.name, regs.len());
                None
            }
            Err(e) => {
                debug!("Telemetry read failed for {}: {}", self.core.info.name, e);
                None
            }
        }
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
