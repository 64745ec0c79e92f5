//! Simulation driver backing the no-hardware fallback.
//!
//! Wraps the simulation engine behind the driver interface so the rest of
//! the system cannot tell synthetic telemetry from a live bus device.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::core::simulation::{SimulationEngine, SimulationParams};
use crate::core::types::{
    DeviceControl, DeviceData, DeviceInfo, DeviceStatus, DeviceType,
};

use super::{DeviceDriver, DriverState};

pub struct SimulationDriver {
    info: DeviceInfo,
    state: DriverState,
    engine: SimulationEngine,
}

impl SimulationDriver {
    pub fn new(params: SimulationParams) -> Self {
        let info = DeviceInfo {
            name: "Simulated Hybrid Inverter".to_string(),
            manufacturer: "Voltage Energy".to_string(),
            model: "SIM-5000".to_string(),
            serial_number: "SIM-001".to_string(),
            firmware_version: "1.0.0".to_string(),
            device_type: DeviceType::Simulation,
            protocol: "simulation".to_string(),
            connection_string: "simulation://local".to_string(),
        };
        Self {
            info,
            state: DriverState::new(DeviceStatus::Simulation),
            engine: SimulationEngine::new(params),
        }
    }
}

#[async_trait]
impl DeviceDriver for SimulationDriver {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn state(&self) -> &DriverState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut DriverState {
        &mut self.state
    }

    async fn connect(&mut self) -> bool {
        info!("Simulation driver connected");
        self.state.set_connected();
        true
    }

    async fn disconnect(&mut self) {
        debug!("Simulation driver disconnected");
        self.state.status = DeviceStatus::Disconnected;
    }

    async fn read_data(&mut self) -> Option<DeviceData> {
        if !self.state.status.is_readable() {
            return None;
        }

        let reading = self.engine.sample();
        let data = DeviceData {
            timestamp: Utc::now(),
            solar_power_w: reading.solar_power_w,
            battery_power_w: reading.battery_power_w,
            load_power_w: reading.load_power_w,
            grid_power_w: reading.grid_power_w,
            battery_soc_percent: reading.battery_soc_percent,
            battery_voltage_v: reading.battery_voltage_v,
            system_efficiency_percent: reading.system_efficiency_percent,
            temperature_c: reading.temperature_c,
            device_status: self.state.status,
            error_code: None,
        };
        self.state.last_data = Some(data.clone());
        Some(data)
    }

    async fn write_control(&mut self, control: &DeviceControl) -> bool {
        if !self.state.status.is_readable() {
            return false;
        }
        info!("Simulated control command accepted: {:?}", control);
        true
    }

    async fn test_connection(&mut self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_in_simulation_state_and_connects() {
        let mut driver = SimulationDriver::new(SimulationParams::default());
        assert_eq!(driver.state().status, DeviceStatus::Simulation);

        assert!(driver.connect().await);
        assert_eq!(driver.state().status, DeviceStatus::Connected);
        assert!(driver.test_connection().await);
    }

    #[tokio::test]
    async fn repeated_reads_keep_soc_in_band() {
        let mut driver = SimulationDriver::new(SimulationParams::default());
        driver.connect().await;

        for _ in 0..50 {
            let data = driver.read_data().await.expect("simulation always serves data");
            assert!((20.0..=95.0).contains(&data.battery_soc_percent));
        }
        assert!(driver.state().last_data.is_some());
    }

    #[tokio::test]
    async fn control_is_accepted_and_logged_only() {
        let mut driver = SimulationDriver::new(SimulationParams::default());
        driver.connect().await;
        assert!(driver.write_control(&DeviceControl::default()).await);

        driver.disconnect().await;
        assert!(!driver.write_control(&DeviceControl::default()).await);
    }

    #[tokio::test]
    async fn reconnect_resets_the_attempt_counter() {
        let mut driver = SimulationDriver::new(SimulationParams::default());
        driver.state_mut().status = DeviceStatus::Error;
        driver.state_mut().connection_attempts = 2;

        assert!(driver.auto_reconnect().await);
        assert_eq!(driver.state().status, DeviceStatus::Connected);
        assert_eq!(driver.state().connection_attempts, 0);
    }
}
