//! Central device manager.
//!
//! Owns the device table, runs the periodic discovery and data collection
//! loops, and exposes the operations the surrounding application consumes.
//! All hardware failures surface here as status fields and booleans; a bad
//! device never takes a loop down with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::{ProfileStore, PvSrvConfig};
use crate::core::drivers::{create_driver, DeviceDriver, SimulationDriver};
use crate::core::scanner::{self, BusScanner};
use crate::core::types::{
    DeviceControl, DeviceData, DeviceStatus, DeviceSummary, DiscoveredDevice, HealthReport,
    ScanResult, ScanStatus, StatusSummary,
};

/// Fixed table key of the simulation fallback device
pub const SIMULATOR_DEVICE_ID: &str = "simulator";

type SharedDriver = Arc<Mutex<Box<dyn DeviceDriver>>>;

struct LoopHandles {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct ManagerInner {
    config: PvSrvConfig,
    profiles: ProfileStore,
    devices: RwLock<HashMap<String, SharedDriver>>,
    simulation_mode: AtomicBool,
    scanning: AtomicBool,
    last_scan: RwLock<Option<DateTime<Utc>>>,
    runtime: Mutex<Option<LoopHandles>>,
}

/// Cloneable handle to the device manager service
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

impl DeviceManager {
    pub fn new(config: PvSrvConfig, profiles: ProfileStore) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                profiles,
                devices: RwLock::new(HashMap::new()),
                simulation_mode: AtomicBool::new(false),
                scanning: AtomicBool::new(false),
                last_scan: RwLock::new(None),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Run an initial scan and launch the background loops; idempotent
    pub async fn start(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            debug!("Device manager already running");
            return;
        }

        info!("Starting device manager");
        self.scan().await;

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(Self::scan_loop(self.clone(), cancel.child_token())),
            tokio::spawn(Self::collection_loop(self.clone(), cancel.child_token())),
        ];
        *runtime = Some(LoopHandles { cancel, tasks });
        info!("Device manager started");
    }

    /// Cancel both loops, disconnect every driver and clear the table;
    /// idempotent
    pub async fn stop(&self) {
        let handles = self.inner.runtime.lock().await.take();
        let Some(handles) = handles else {
            return;
        };

        info!("Stopping device manager");
        handles.cancel.cancel();
        for task in handles.tasks {
            let _ = task.await;
        }

        let drained: Vec<(String, SharedDriver)> =
            self.inner.devices.write().await.drain().collect();
        for (device_id, driver) in drained {
            driver.lock().await.disconnect().await;
            debug!("Disconnected device {}", device_id);
        }
        info!("Device manager stopped");
    }

    /// Discover devices on every recognized adapter.
    ///
    /// Guarded by the scanning flag: a concurrent call returns immediately
    /// with no side effects. Zero discoveries, and any internal failure,
    /// fall back to simulation mode.
    pub async fn scan(&self) -> ScanResult {
        if self
            .inner
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return ScanResult {
                status: ScanStatus::Scanning,
                devices: Vec::new(),
                simulation_mode: self.simulation_mode(),
                error: None,
            };
        }

        let result = self.run_scan().await;
        *self.inner.last_scan.write().await = Some(Utc::now());
        self.inner.scanning.store(false, Ordering::SeqCst);
        result
    }

    async fn run_scan(&self) -> ScanResult {
        if self.inner.config.simulate_hardware {
            info!("Hardware discovery disabled by configuration, using simulation");
            self.enable_simulation_mode().await;
            return ScanResult {
                status: ScanStatus::Completed,
                devices: Vec::new(),
                simulation_mode: true,
                error: None,
            };
        }

        info!("Starting device scan");
        let adapters = match scanner::find_rs485_adapters() {
            Ok(adapters) => adapters,
            Err(e) => {
                error!("Device scan failed: {}", e);
                self.enable_simulation_mode().await;
                return ScanResult {
                    status: ScanStatus::Failed,
                    devices: Vec::new(),
                    simulation_mode: true,
                    error: Some(e.to_string()),
                };
            }
        };
        info!("Found {} RS485 adapters", adapters.len());

        let bus = BusScanner::new(&self.inner.config.serial);
        let mut found = Vec::new();
        for adapter in &adapters {
            info!("Scanning adapter {} ({})", adapter.path, adapter.chip);
            found.extend(bus.scan_bus(&adapter.path).await);
        }

        if found.is_empty() {
            info!("No devices discovered, enabling simulation mode");
            self.enable_simulation_mode().await;
        } else {
            info!("Discovered {} devices", found.len());
            self.connect_discovered(&found).await;
            // Real hardware answered, so the fallback no longer applies
            self.inner.simulation_mode.store(false, Ordering::SeqCst);
            let removed = self.inner.devices.write().await.remove(SIMULATOR_DEVICE_ID);
            if let Some(simulator) = removed {
                simulator.lock().await.disconnect().await;
            }
        }

        ScanResult {
            status: ScanStatus::Completed,
            devices: found,
            simulation_mode: self.simulation_mode(),
            error: None,
        }
    }

    async fn connect_discovered(&self, found: &[DiscoveredDevice]) {
        for discovered in found {
            let device_id = format!("{}_{}", discovered.port, discovered.station);
            let mut driver =
                create_driver(discovered, &self.inner.profiles, &self.inner.config.serial);

            if driver.connect().await {
                info!(
                    "Connected to device {}: {}",
                    device_id,
                    driver.device_info().name
                );
            } else {
                warn!("Initial connect to {} failed", device_id);
            }

            // Failed drivers enter the table too; the collection loop keeps
            // retrying them until the reconnect breaker latches
            self.inner
                .devices
                .write()
                .await
                .insert(device_id, Arc::new(Mutex::new(driver)));
        }
    }

    async fn enable_simulation_mode(&self) {
        self.inner.simulation_mode.store(true, Ordering::SeqCst);

        let mut devices = self.inner.devices.write().await;
        if devices.contains_key(SIMULATOR_DEVICE_ID) {
            return;
        }

        let mut simulator: Box<dyn DeviceDriver> =
            Box::new(SimulationDriver::new(self.inner.config.simulation.clone()));
        simulator.connect().await;
        devices.insert(
            SIMULATOR_DEVICE_ID.to_string(),
            Arc::new(Mutex::new(simulator)),
        );
        info!("Simulation mode enabled");
    }

    /// Install the simulation fallback explicitly
    pub async fn enable_simulation(&self) {
        self.enable_simulation_mode().await;
    }

    /// Remove the simulation fallback and trigger a fresh scan
    pub async fn disable_simulation(&self) -> ScanResult {
        self.inner.simulation_mode.store(false, Ordering::SeqCst);
        let removed = self.inner.devices.write().await.remove(SIMULATOR_DEVICE_ID);
        if let Some(simulator) = removed {
            simulator.lock().await.disconnect().await;
        }
        info!("Simulation mode disabled, rescanning");
        self.scan().await
    }

    pub async fn status(&self) -> StatusSummary {
        let mut devices = HashMap::new();
        let mut connected_devices = 0;

        for (device_id, driver) in self.device_handles().await {
            let summary = driver.lock().await.status_summary();
            if summary.connected {
                connected_devices += 1;
            }
            devices.insert(device_id, summary);
        }

        StatusSummary {
            simulation_mode: self.simulation_mode(),
            total_devices: devices.len(),
            connected_devices,
            devices,
            last_scan: *self.inner.last_scan.read().await,
            scanning: self.is_scanning(),
        }
    }

    /// The freshest committed snapshot across all drivers.
    ///
    /// Ids are visited in lexical order and only a strictly newer timestamp
    /// replaces the winner, so ties go to the lexically smallest id.
    pub async fn latest_data(&self) -> Option<DeviceData> {
        let mut handles = self.device_handles().await;
        handles.sort_by(|a, b| a.0.cmp(&b.0));

        let mut latest: Option<DeviceData> = None;
        for (_, driver) in handles {
            let driver = driver.lock().await;
            if let Some(data) = &driver.state().last_data {
                if latest
                    .as_ref()
                    .map_or(true, |current| data.timestamp > current.timestamp)
                {
                    latest = Some(data.clone());
                }
            }
        }
        latest
    }

    /// A specific device's committed snapshot
    pub async fn device_data(&self, device_id: &str) -> Option<DeviceData> {
        let driver = self.driver(device_id).await?;
        let driver = driver.lock().await;
        driver.state().last_data.clone()
    }

    pub async fn list_devices(&self) -> HashMap<String, DeviceSummary> {
        let mut summaries = HashMap::new();
        for (device_id, driver) in self.device_handles().await {
            summaries.insert(device_id, driver.lock().await.status_summary());
        }
        summaries
    }

    pub async fn get_device(&self, device_id: &str) -> Option<DeviceSummary> {
        let driver = self.driver(device_id).await?;
        let summary = driver.lock().await.status_summary();
        Some(summary)
    }

    /// Probe one device and fold the outcome into its status
    pub async fn health_check(&self, device_id: &str) -> Option<HealthReport> {
        let driver = self.driver(device_id).await?;
        let report = driver.lock().await.health_check().await;
        Some(report)
    }

    /// Manually trigger a reconnect attempt; `false` for unknown devices or
    /// a latched reconnect breaker
    pub async fn reconnect_device(&self, device_id: &str) -> bool {
        let Some(driver) = self.driver(device_id).await else {
            warn!("Reconnect requested for unknown device {}", device_id);
            return false;
        };
        let result = driver.lock().await.auto_reconnect().await;
        result
    }

    /// Write a control payload to one device; `false` on unknown id or a
    /// device that is not connected
    pub async fn write_control(&self, device_id: &str, control: &DeviceControl) -> bool {
        let Some(driver) = self.driver(device_id).await else {
            warn!("Control write for unknown device {}", device_id);
            return false;
        };

        let mut driver = driver.lock().await;
        if driver.state().status != DeviceStatus::Connected {
            warn!("Control write rejected, device {} not connected", device_id);
            return false;
        }
        driver.write_control(control).await
    }

    pub fn simulation_mode(&self) -> bool {
        self.inner.simulation_mode.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Consistent snapshot of the table for loop iteration; inserts and
    /// removals during the walk cannot invalidate it
    async fn device_handles(&self) -> Vec<(String, SharedDriver)> {
        self.inner
            .devices
            .read()
            .await
            .iter()
            .map(|(id, driver)| (id.clone(), Arc::clone(driver)))
            .collect()
    }

    async fn driver(&self, device_id: &str) -> Option<SharedDriver> {
        self.inner.devices.read().await.get(device_id).cloned()
    }

    async fn all_disconnected(&self) -> bool {
        let handles = self.device_handles().await;
        if handles.is_empty() {
            return true;
        }
        for (_, driver) in handles {
            if driver.lock().await.state().status != DeviceStatus::Disconnected {
                return false;
            }
        }
        true
    }

    /// Periodic rescan, skipped while any driver is alive
    async fn scan_loop(manager: DeviceManager, cancel: CancellationToken) {
        let period = Duration::from_secs(manager.inner.config.service.scan_interval_secs.max(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if manager.all_disconnected().await {
                        manager.scan().await;
                    }
                }
            }
        }
        debug!("Scan loop terminated");
    }

    /// Periodic telemetry collection; error drivers get a reconnect attempt
    async fn collection_loop(manager: DeviceManager, cancel: CancellationToken) {
        let period = Duration::from_secs(manager.inner.config.service.data_interval_secs.max(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    for (device_id, driver) in manager.device_handles().await {
                        let mut driver = driver.lock().await;
                        match driver.state().status {
                            DeviceStatus::Connected | DeviceStatus::Simulation => {
                                if driver.read_data().await.is_none() {
                                    debug!("No data from {}", device_id);
                                }
                            }
                            DeviceStatus::Error => {
                                driver.auto_reconnect().await;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        debug!("Collection loop terminated");
    }
}
