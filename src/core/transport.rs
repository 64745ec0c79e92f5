//! Modbus RTU transport layer.
//!
//! One serial line, request/response register transactions against a numeric
//! station address. Every call carries a fixed per-response timeout and a
//! bounded internal retry; callers see a single logical failure after
//! exhaustion. Exception responses are definitive and are not retried.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use crate::utils::error::{PvSrvError, Result};

/// Read holding registers
pub const FUNC_READ_HOLDING: u8 = 0x03;
/// Read input registers
pub const FUNC_READ_INPUT: u8 = 0x04;
/// Write single register
pub const FUNC_WRITE_SINGLE: u8 = 0x06;
/// Write multiple registers
pub const FUNC_WRITE_MULTIPLE: u8 = 0x10;

/// Default per-transaction response timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
/// Transaction attempts before a call is reported failed
pub const DEFAULT_RETRIES: u32 = 3;

/// Register-level transaction interface over one bus line.
///
/// Implemented by the RTU serial transport; drivers and the bus scanner
/// program against this seam so tests can substitute an in-memory bank.
#[async_trait]
pub trait RegisterTransport: Send + Sync {
    /// Open the line; `false` on failure to open, never an error
    async fn open(&mut self) -> bool;

    fn is_open(&self) -> bool;

    async fn close(&mut self);

    async fn read_holding_registers(
        &mut self,
        station: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    async fn read_input_registers(
        &mut self,
        station: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    async fn write_register(&mut self, station: u8, address: u16, value: u16) -> Result<()>;

    async fn write_registers(&mut self, station: u8, address: u16, values: &[u16]) -> Result<()>;

    /// Liveness probe: one register read against the station
    async fn test_connection(&mut self, station: u8) -> bool {
        self.read_holding_registers(station, 0, 1).await.is_ok()
    }
}

/// Modbus RTU client over a `tokio-serial` stream, 8N1 framing
pub struct ModbusRtuTransport {
    device: String,
    baud_rate: u32,
    timeout: Duration,
    retries: u32,
    stream: Option<SerialStream>,
}

impl ModbusRtuTransport {
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retries: DEFAULT_RETRIES,
            stream: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    /// One request/response exchange with retry; returns the PDU payload
    /// after the function code, CRC stripped.
    async fn transact(&mut self, station: u8, function: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(PvSrvError::NotConnected)?;
        let request = build_request(station, function, payload);

        let mut last_err = PvSrvError::TimeoutError("no attempt made".to_string());
        for attempt in 1..=self.retries {
            match transact_once(stream, &request, station, function, self.timeout).await {
                Ok(pdu) => return Ok(pdu),
                // The station answered with a definitive refusal
                Err(err @ PvSrvError::ModbusException(_)) => return Err(err),
                Err(err) => {
                    debug!(
                        "Transaction attempt {}/{} to station {} failed: {}",
                        attempt, self.retries, station, err
                    );
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

async fn transact_once(
    stream: &mut SerialStream,
    request: &[u8],
    station: u8,
    function: u8,
    response_timeout: Duration,
) -> Result<Vec<u8>> {
    // Drop stale bytes a late response from a previous attempt may have left
    let _ = stream.clear(ClearBuffer::Input);

    debug!("Modbus RTU TX [{}]", hex::encode(request));
    stream.write_all(request).await?;

    let frame = timeout(response_timeout, read_response_frame(stream, function))
        .await
        .map_err(|_| {
            PvSrvError::TimeoutError(format!("No response from station {}", station))
        })??;

    debug!("Modbus RTU RX [{}]", hex::encode(&frame));
    validate_frame(&frame, station, function).map(<[u8]>::to_vec)
}

/// Assemble one response frame; length is derived from the function code
/// and, for reads, the byte-count header.
async fn read_response_frame(stream: &mut SerialStream, function: u8) -> Result<Vec<u8>> {
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;

    let total_len = expected_frame_len(function, &header)?;
    let mut frame = vec![0u8; total_len];
    frame[..3].copy_from_slice(&header);
    stream.read_exact(&mut frame[3..]).await?;
    Ok(frame)
}

/// Build a request frame: station, function, payload, CRC (little-endian)
pub fn build_request(station: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(station);
    frame.push(function);
    frame.extend_from_slice(payload);
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Total response length implied by the echoed function code
fn expected_frame_len(function: u8, header: &[u8; 3]) -> Result<usize> {
    let echoed = header[1];
    if echoed == function | 0x80 {
        // station, exception function, code, CRC
        return Ok(5);
    }
    if echoed != function {
        return Err(PvSrvError::ProtocolError(format!(
            "Unexpected function code 0x{:02X} in response to 0x{:02X}",
            echoed, function
        )));
    }
    match function {
        FUNC_READ_HOLDING | FUNC_READ_INPUT => Ok(5 + header[2] as usize),
        FUNC_WRITE_SINGLE | FUNC_WRITE_MULTIPLE => Ok(8),
        _ => Err(PvSrvError::ProtocolError(format!(
            "Unsupported function code 0x{:02X}",
            function
        ))),
    }
}

/// Validate CRC, station echo and function echo; returns the PDU payload
/// after the function code, CRC stripped.
pub fn validate_frame<'a>(frame: &'a [u8], station: u8, function: u8) -> Result<&'a [u8]> {
    if frame.len() < 4 {
        return Err(PvSrvError::ProtocolError("Response frame too short".to_string()));
    }

    let crc_pos = frame.len() - 2;
    let received = u16::from_le_bytes([frame[crc_pos], frame[crc_pos + 1]]);
    let calculated = crc16_modbus(&frame[..crc_pos]);
    if received != calculated {
        return Err(PvSrvError::ProtocolError(format!(
            "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
            calculated, received
        )));
    }

    if frame[0] != station {
        return Err(PvSrvError::ProtocolError(format!(
            "Station mismatch: expected {}, got {}",
            station, frame[0]
        )));
    }

    let echoed = frame[1];
    if echoed == function | 0x80 {
        return Err(PvSrvError::ModbusException(frame[2]));
    }
    if echoed != function {
        return Err(PvSrvError::ProtocolError(format!(
            "Function mismatch: expected 0x{:02X}, got 0x{:02X}",
            function, echoed
        )));
    }

    Ok(&frame[2..crc_pos])
}

/// Decode the payload of a register-read response into 16-bit words
pub fn parse_read_payload(payload: &[u8], count: u16) -> Result<Vec<u16>> {
    if payload.is_empty() {
        return Err(PvSrvError::ProtocolError("Empty read payload".to_string()));
    }
    let byte_count = payload[0] as usize;
    let data = &payload[1..];
    if data.len() != byte_count || byte_count != count as usize * 2 {
        return Err(PvSrvError::ProtocolError(format!(
            "Register count mismatch: expected {} registers, got {} bytes",
            count, byte_count
        )));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// CRC-16/MODBUS, table driven
pub fn crc16_modbus(data: &[u8]) -> u16 {
    const CRC_TABLE: [u16; 256] = [
        0x0000, 0xC0C1, 0xC181, 0x0140, 0xC301, 0x03C0, 0x0280, 0xC241, 0xC601, 0x06C0, 0x0780,
        0xC741, 0x0500, 0xC5C1, 0xC481, 0x0440, 0xCC01, 0x0CC0, 0x0D80, 0xCD41, 0x0F00, 0xCFC1,
        0xCE81, 0x0E40, 0x0A00, 0xCAC1, 0xCB81, 0x0B40, 0xC901, 0x09C0, 0x0880, 0xC841, 0xD801,
        0x18C0, 0x1980, 0xD941, 0x1B00, 0xDBC1, 0xDA81, 0x1A40, 0x1E00, 0xDEC1, 0xDF81, 0x1F40,
        0xDD01, 0x1DC0, 0x1C80, 0xDC41, 0x1400, 0xD4C1, 0xD581, 0x1540, 0xD701, 0x17C0, 0x1680,
        0xD641, 0xD201, 0x12C0, 0x1380, 0xD341, 0x1100, 0xD1C1, 0xD081, 0x1040, 0xF001, 0x30C0,
        0x3180, 0xF141, 0x3300, 0xF3C1, 0xF281, 0x3240, 0x3600, 0xF6C1, 0xF781, 0x3740, 0xF501,
        0x35C0, 0x3480, 0xF441, 0x3C00, 0xFCC1, 0xFD81, 0x3D40, 0xFF01, 0x3FC0, 0x3E80, 0xFE41,
        0xFA01, 0x3AC0, 0x3B80, 0xFB41, 0x3900, 0xF9C1, 0xF881, 0x3840, 0x2800, 0xE8C1, 0xE981,
        0x2940, 0xEB01, 0x2BC0, 0x2A80, 0xEA41, 0xEE01, 0x2EC0, 0x2F80, 0xEF41, 0x2D00, 0xEDC1,
        0xEC81, 0x2C40, 0xE401, 0x24C0, 0x2580, 0xE541, 0x2700, 0xE7C1, 0xE681, 0x2640, 0x2200,
        0xE2C1, 0xE381, 0x2340, 0xE101, 0x21C0, 0x2080, 0xE041, 0xA001, 0x60C0, 0x6180, 0xA141,
        0x6300, 0xA3C1, 0xA281, 0x6240, 0x6600, 0xA6C1, 0xA781, 0x6740, 0xA501, 0x65C0, 0x6480,
        0xA441, 0x6C00, 0xACC1, 0xAD81, 0x6D40, 0xAF01, 0x6FC0, 0x6E80, 0xAE41, 0xAA01, 0x6AC0,
        0x6B80, 0xAB41, 0x6900, 0xA9C1, 0xA881, 0x6840, 0x7800, 0xB8C1, 0xB981, 0x7940, 0xBB01,
        0x7BC0, 0x7A80, 0xBA41, 0xBE01, 0x7EC0, 0x7F80, 0xBF41, 0x7D00, 0xBDC1, 0xBC81, 0x7C40,
        0xB401, 0x74C0, 0x7580, 0xB541, 0x7700, 0xB7C1, 0xB681, 0x7640, 0x7200, 0xB2C1, 0xB381,
        0x7340, 0xB101, 0x71C0, 0x7080, 0xB041, 0x5000, 0x90C1, 0x9181, 0x5140, 0x9301, 0x53C0,
        0x5280, 0x9241, 0x9601, 0x56C0, 0x5780, 0x9741, 0x5500, 0x95C1, 0x9481, 0x5440, 0x9C01,
        0x5CC0, 0x5D80, 0x9D41, 0x5F00, 0x9FC1, 0x9E81, 0x5E40, 0x5A00, 0x9AC1, 0x9B81, 0x5B40,
        0x9901, 0x59C0, 0x5880, 0x9841, 0x8801, 0x48C0, 0x4980, 0x8941, 0x4B00, 0x8BC1, 0x8A81,
        0x4A40, 0x4E00, 0x8EC1, 0x8F81, 0x4F40, 0x8D01, 0x4DC0, 0x4C80, 0x8C41, 0x4400, 0x84C1,
        0x8581, 0x4540, 0x8701, 0x47C0, 0x4680, 0x8641, 0x8201, 0x42C0, 0x4380, 0x8341, 0x4100,
        0x81C1, 0x8081, 0x4040,
    ];

    let mut crc = 0xFFFFu16;
    for &byte in data {
        let index = ((crc ^ byte as u16) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC_TABLE[index];
    }
    crc
}

#[async_trait]
impl RegisterTransport for ModbusRtuTransport {
    async fn open(&mut self) -> bool {
        self.close().await;

        let builder = tokio_serial::new(&self.device, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .timeout(self.timeout);

        match builder.open_native_async() {
            Ok(stream) => {
                debug!("Serial port opened: {} at {} baud", self.device, self.baud_rate);
                self.stream = Some(stream);
                true
            }
            Err(e) => {
                warn!("Failed to open serial port {}: {}", self.device, e);
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Serial port closed: {}", self.device);
        }
    }

    async fn read_holding_registers(
        &mut self,
        station: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let mut payload = [0u8; 4];
        payload[..2].copy_from_slice(&address.to_be_bytes());
        payload[2..].copy_from_slice(&count.to_be_bytes());
        let pdu = self.transact(station, FUNC_READ_HOLDING, &payload).await?;
        parse_read_payload(&pdu, count)
    }

    async fn read_input_registers(
        &mut self,
        station: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let mut payload = [0u8; 4];
        payload[..2].copy_from_slice(&address.to_be_bytes());
        payload[2..].copy_from_slice(&count.to_be_bytes());
        let pdu = self.transact(station, FUNC_READ_INPUT, &payload).await?;
        parse_read_payload(&pdu, count)
    }

    async fn write_register(&mut self, station: u8, address: u16, value: u16) -> Result<()> {
        let mut payload = [0u8; 4];
        payload[..2].copy_from_slice(&address.to_be_bytes());
        payload[2..].copy_from_slice(&value.to_be_bytes());
        let pdu = self.transact(station, FUNC_WRITE_SINGLE, &payload).await?;

        // The response echoes address and value
        if pdu != payload {
            return Err(PvSrvError::ProtocolError(
                "Write echo does not match request".to_string(),
            ));
        }
        Ok(())
    }

    async fn write_registers(&mut self, station: u8, address: u16, values: &[u16]) -> Result<()> {
        if values.is_empty() || values.len() > 123 {
            return Err(PvSrvError::InvalidData(format!(
                "Invalid register count for block write: {}",
                values.len()
            )));
        }

        let count = values.len() as u16;
        let mut payload = Vec::with_capacity(5 + values.len() * 2);
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        payload.push((count * 2) as u8);
        for value in values {
            payload.extend_from_slice(&value.to_be_bytes());
        }

        let pdu = self.transact(station, FUNC_WRITE_MULTIPLE, &payload).await?;
        if pdu.len() != 4 || pdu[..2] != address.to_be_bytes() || pdu[2..4] != count.to_be_bytes()
        {
            return Err(PvSrvError::ProtocolError(
                "Block write echo does not match request".to_string(),
            ));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vector() {
        // Read holding registers, station 1, address 0, count 2
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(crc16_modbus(&frame), 0x0BC4);
    }

    #[test]
    fn build_request_appends_crc_little_endian() {
        let frame = build_request(0x01, FUNC_READ_HOLDING, &[0x00, 0x00, 0x00, 0x02]);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[test]
    fn validate_frame_accepts_good_response() {
        // Station 1 returns two registers: 0x1234, 0x5678
        let frame = build_request(0x01, FUNC_READ_HOLDING, &[0x04, 0x12, 0x34, 0x56, 0x78]);
        let payload = validate_frame(&frame, 0x01, FUNC_READ_HOLDING).unwrap();
        let registers = parse_read_payload(payload, 2).unwrap();
        assert_eq!(registers, vec![0x1234, 0x5678]);
    }

    #[test]
    fn validate_frame_rejects_bad_crc() {
        let mut frame = build_request(0x01, FUNC_READ_HOLDING, &[0x02, 0x00, 0x01]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            validate_frame(&frame, 0x01, FUNC_READ_HOLDING),
            Err(PvSrvError::ProtocolError(_))
        ));
    }

    #[test]
    fn validate_frame_maps_exception_response() {
        // Exception 0x02 (illegal data address) to a read request
        let frame = build_request(0x01, 0x83, &[0x02]);
        assert!(matches!(
            validate_frame(&frame, 0x01, FUNC_READ_HOLDING),
            Err(PvSrvError::ModbusException(0x02))
        ));
    }

    #[test]
    fn validate_frame_rejects_station_mismatch() {
        let frame = build_request(0x05, FUNC_READ_HOLDING, &[0x02, 0x00, 0x01]);
        assert!(matches!(
            validate_frame(&frame, 0x01, FUNC_READ_HOLDING),
            Err(PvSrvError::ProtocolError(_))
        ));
    }

    #[test]
    fn parse_read_payload_rejects_count_mismatch() {
        // Byte count says 4 but only one register requested
        let payload = [0x04, 0x00, 0x01, 0x00, 0x02];
        assert!(parse_read_payload(&payload, 1).is_err());
    }

    #[tokio::test]
    async fn transport_requires_open_line() {
        let mut transport = ModbusRtuTransport::new("/dev/null", 9600);
        assert!(!transport.is_open());
        assert!(matches!(
            transport.read_holding_registers(1, 0, 1).await,
            Err(PvSrvError::NotConnected)
        ));
    }
}
