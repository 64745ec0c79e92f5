//! Serial port enumeration and bus discovery.
//!
//! Discovery is conservative: a station is only reported when it answers a
//! liveness probe, and classification defaults to a placeholder tag rather
//! than guessing. Writing the wrong register map into a mis-identified
//! inverter can corrupt its configuration.

use std::time::Duration;

use tokio_serial::SerialPortType;
use tracing::{debug, info};

use crate::core::config::SerialConfig;
use crate::core::transport::{ModbusRtuTransport, RegisterTransport};
use crate::core::types::{DiscoveredDevice, Rs485Adapter, SerialPortSummary};
use crate::utils::error::{PvSrvError, Result};

/// Baud rates probed during bus discovery, most common first
pub const SCAN_BAUD_RATES: &[u32] = &[9600, 19200, 38400, 57600, 115200];

/// Known USB-to-RS485 bridge chips by (vendor id, product id)
pub const KNOWN_RS485_ADAPTERS: &[(u16, u16, &str)] = &[
    (0x0403, 0x6001, "FTDI FT232R"),
    (0x0403, 0x6015, "FTDI FT231X"),
    (0x067B, 0x2303, "Prolific PL2303"),
    (0x10C4, 0xEA60, "Silicon Labs CP210x"),
    (0x1A86, 0x7523, "CH340"),
];

/// Register windows probed for device identification
const IDENT_WINDOWS: &[(u16, u16)] = &[(0x0000, 10), (0x0100, 10), (0x0200, 10)];

/// Registers kept from the identification window for diagnostics
const IDENT_SAMPLE_LEN: usize = 5;

/// List OS-visible serial ports with their USB identifiers
pub fn scan_serial_ports() -> Result<Vec<SerialPortSummary>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| PvSrvError::SerialError(format!("Port enumeration failed: {}", e)))?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let mut summary = SerialPortSummary {
                path: port.port_name,
                manufacturer: None,
                product: None,
                vid: None,
                pid: None,
                serial_number: None,
            };
            if let SerialPortType::UsbPort(usb) = port.port_type {
                summary.manufacturer = usb.manufacturer;
                summary.product = usb.product;
                summary.vid = Some(usb.vid);
                summary.pid = Some(usb.pid);
                summary.serial_number = usb.serial_number;
            }
            summary
        })
        .collect())
}

/// Look up a (vid, pid) pair in the known adapter table
pub fn match_adapter(vid: u16, pid: u16) -> Option<&'static str> {
    KNOWN_RS485_ADAPTERS
        .iter()
        .find(|(known_vid, known_pid, _)| *known_vid == vid && *known_pid == pid)
        .map(|(_, _, chip)| *chip)
}

/// Filter the visible serial ports down to recognized RS485 bridges
pub fn find_rs485_adapters() -> Result<Vec<Rs485Adapter>> {
    let mut adapters = Vec::new();
    for port in scan_serial_ports()? {
        let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
            continue;
        };
        if let Some(chip) = match_adapter(vid, pid) {
            info!("Found RS485 adapter: {} - {}", port.path, chip);
            adapters.push(Rs485Adapter {
                path: port.path,
                chip: chip.to_string(),
                vid,
                pid,
                serial_number: port.serial_number,
            });
        }
    }
    Ok(adapters)
}

/// Sweeps one adapter port across baud rates and station addresses
pub struct BusScanner {
    baud_rates: Vec<u32>,
    stations: std::ops::RangeInclusive<u8>,
    timeout: Duration,
    retries: u32,
}

impl BusScanner {
    pub fn new(config: &SerialConfig) -> Self {
        Self {
            baud_rates: config.baud_rates.clone(),
            stations: config.stations(),
            timeout: config.timeout(),
            retries: config.retries,
        }
    }

    /// Probe one port for responding Modbus stations.
    ///
    /// The first identified device per baud rate ends that rate's sweep:
    /// dwelling on all 247 stations at every rate is prohibitively slow on a
    /// live bus, and one device per rate is enough to bring the bus up.
    pub async fn scan_bus(&self, port: &str) -> Vec<DiscoveredDevice> {
        self.scan_bus_with(port, |device, baud| {
            Box::new(
                ModbusRtuTransport::new(device, baud)
                    .with_timeout(self.timeout)
                    .with_retries(self.retries),
            )
        })
        .await
    }

    pub(crate) async fn scan_bus_with<F>(&self, port: &str, make_transport: F) -> Vec<DiscoveredDevice>
    where
        F: Fn(&str, u32) -> Box<dyn RegisterTransport>,
    {
        let mut found = Vec::new();

        for &baud_rate in &self.baud_rates {
            debug!("Scanning {} at {} baud", port, baud_rate);
            let mut transport = make_transport(port, baud_rate);
            if !transport.open().await {
                continue;
            }

            for station in self.stations.clone() {
                if !transport.test_connection(station).await {
                    continue;
                }

                // A silent classification failure skips the station
                match identify_station(transport.as_mut(), station).await {
                    Some((identification, registers)) => {
                        info!(
                            "Found Modbus device on {} at {} baud, station {}: {}",
                            port, baud_rate, station, identification
                        );
                        found.push(DiscoveredDevice {
                            port: port.to_string(),
                            baud_rate,
                            station,
                            identification,
                            registers,
                        });
                        break;
                    }
                    None => {
                        debug!(
                            "Station {} on {} answered but could not be identified",
                            station, port
                        );
                    }
                }
            }

            transport.close().await;
        }

        found
    }
}

/// Read the identification windows and decode a tag from the first one that
/// holds non-zero data.
async fn identify_station(
    transport: &mut dyn RegisterTransport,
    station: u8,
) -> Option<(String, Vec<u16>)> {
    for &(address, count) in IDENT_WINDOWS {
        let Ok(registers) = transport.read_holding_registers(station, address, count).await
        else {
            continue;
        };
        if registers.iter().all(|&r| r == 0) {
            continue;
        }

        let sample = registers[..registers.len().min(IDENT_SAMPLE_LEN)].to_vec();
        let tag = decode_identification(&registers)
            .unwrap_or_else(|| format!("Unknown device (registers: {:?})", sample));
        return Some((tag, sample));
    }
    None
}

/// Decode register words as printable ASCII; a tag shorter than four
/// characters is rejected as noise.
pub fn decode_identification(registers: &[u16]) -> Option<String> {
    let ascii: String = registers
        .iter()
        .filter(|&&r| (32..=126).contains(&r))
        .map(|&r| r as u8 as char)
        .collect();
    let trimmed = ascii.trim();
    (trimmed.len() > 3).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::testing::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tag_registers(tag: &str) -> Vec<u16> {
        tag.chars().map(|c| c as u16).collect()
    }

    #[test]
    fn adapter_table_matches_known_chips() {
        assert_eq!(match_adapter(0x0403, 0x6001), Some("FTDI FT232R"));
        assert_eq!(match_adapter(0x1A86, 0x7523), Some("CH340"));
        assert_eq!(match_adapter(0x1234, 0x5678), None);
        // Vendor match alone is not enough
        assert_eq!(match_adapter(0x0403, 0x0000), None);
    }

    #[test]
    fn identification_decodes_printable_ascii() {
        let registers = tag_registers("GROWATT SPF5000");
        assert_eq!(
            decode_identification(&registers).as_deref(),
            Some("GROWATT SPF5000")
        );
    }

    #[test]
    fn identification_rejects_short_and_binary_tags() {
        assert_eq!(decode_identification(&tag_registers("SPF")), None);
        assert_eq!(decode_identification(&[0x0001, 0x8000, 0xFFFF, 0x0000]), None);
        // Mixed content keeps only the printable words
        let mut mixed = tag_registers("DEYE");
        mixed.push(0xFFFF);
        assert_eq!(decode_identification(&mixed).as_deref(), Some("DEYE"));
    }

    fn scanner_for_test(baud_rates: Vec<u32>, station_max: u8) -> BusScanner {
        BusScanner {
            baud_rates,
            stations: 1..=station_max,
            timeout: Duration::from_millis(10),
            retries: 1,
        }
    }

    #[tokio::test]
    async fn scan_finds_device_and_advances_to_next_rate() {
        let reads = Arc::new(AtomicUsize::new(0));
        let reads_handle = Arc::clone(&reads);

        // Station 7 answers only at 19200 baud and identifies as a Growatt
        let scanner = scanner_for_test(vec![9600, 19200], 10);
        let found = scanner
            .scan_bus_with("/dev/ttyTEST", move |_, baud| {
                let mut mock = MockTransport::new();
                mock.reads = Arc::clone(&reads_handle);
                if baud == 19200 {
                    mock = mock.with_station(7);
                    for (i, word) in tag_registers("GROWATT SPF5000").into_iter().enumerate() {
                        mock.holding.insert(i as u16, word);
                    }
                }
                Box::new(mock)
            })
            .await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].baud_rate, 19200);
        assert_eq!(found[0].station, 7);
        assert_eq!(found[0].identification, "GROWATT SPF5000");
        assert_eq!(found[0].registers.len(), 5);

        // 10 probes at 9600; at 19200: 6 silent probes, the probe for
        // station 7, one identification window. Never more than rates times
        // stations plus the identification reads.
        let total_reads = reads.load(Ordering::SeqCst);
        assert_eq!(total_reads, 10 + 7 + 1);
    }

    #[tokio::test]
    async fn scan_stops_at_first_identified_station_per_rate() {
        // Stations 3 and 9 both answer; only the first is reported
        let scanner = scanner_for_test(vec![9600], 247);
        let found = scanner
            .scan_bus_with("/dev/ttyTEST", |_, _| {
                let mut mock = MockTransport::new().with_station(3).with_station(9);
                for (i, word) in tag_registers("DEYE SUN-5K").into_iter().enumerate() {
                    mock.holding.insert(i as u16, word);
                }
                Box::new(mock)
            })
            .await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].station, 3);
    }

    #[tokio::test]
    async fn unidentifiable_station_is_skipped() {
        // Station answers the probe but every identification window is zero
        let scanner = scanner_for_test(vec![9600], 5);
        let found = scanner
            .scan_bus_with("/dev/ttyTEST", |_, _| {
                Box::new(MockTransport::new().with_station(2))
            })
            .await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn unopenable_port_yields_nothing() {
        let scanner = scanner_for_test(vec![9600, 19200], 247);
        let found = scanner
            .scan_bus_with("/dev/ttyTEST", |_, _| {
                let mut mock = MockTransport::new();
                mock.fail_open = true;
                Box::new(mock)
            })
            .await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn raw_register_placeholder_for_binary_devices() {
        // Station answers with non-zero, non-printable registers
        let scanner = scanner_for_test(vec![9600], 5);
        let found = scanner
            .scan_bus_with("/dev/ttyTEST", |_, _| {
                let mut mock = MockTransport::new().with_station(1);
                mock.holding.insert(0, 0x8001);
                mock.holding.insert(1, 0x8002);
                Box::new(mock)
            })
            .await;

        assert_eq!(found.len(), 1);
        assert!(found[0].identification.starts_with("Unknown device"));
    }
}
