//! Serial IMU driver.
//!
//! The IMU streams 11-byte packets: header `0x55`, a type byte, four
//! little-endian `i16` words and an additive checksum over the first ten
//! bytes. Acceleration, angular velocity and quaternion packets are merged
//! into one 10-component vector `[qx, qy, qz, qw, wx, wy, wz, ax, ay, az]`.
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};
use log::{debug, warn};
use serialport::{ClearBuffer, SerialPort};
use crate::config::{SensorConfig, SerialAddress};
use crate::drivers::SensorDevice;
use crate::error::ForceError;
use crate::types::{Reading, IMU_WIDTH};
const PACKET_SIZE: usize = 11;
const HEADER: u8 = 0x55;
const DEFAULT_BAUD: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(500);
const G: f64 = 9.80665;
const ACCEL_RANGE_G: f64 = 16.0;
const GYRO_RANGE_DPS: f64 = 2000.0;
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Accel,
    Gyro,
    Quaternion,
}
impl PacketType {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x51 => Some(PacketType::Accel),
            0x52 => Some(PacketType::Gyro),
            0x59 => Some(PacketType::Quaternion),
            _ => None,
        }
    }
    fn bit(self) -> u8 {
        match self {
            PacketType::Accel => 0b001,
            PacketType::Gyro => 0b010,
            PacketType::Quaternion => 0b100,
        }
    }
}
/// Byte-at-a-time packet decoder keeping the latest value of every field.
pub struct FrameParser {
    buffer: [u8; PACKET_SIZE],
    index: usize,
    latest: [f64; IMU_WIDTH],
    seen: u8,
}
impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: [0; PACKET_SIZE],
            index: 0,
            latest: [0.0; IMU_WIDTH],
            seen: 0,
        }
    }
    /// Returns the packet type once a complete packet with a valid checksum is decoded.
    pub fn feed_byte(&mut self, byte: u8) -> Option<PacketType> {
        if self.index == 0 && byte != HEADER {
            return None;
        }
        self.buffer[self.index] = byte;
        self.index += 1;
        if self.index < PACKET_SIZE {
            return None;
        }
        self.index = 0;
        let checksum = self.buffer[..10]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        if checksum != self.buffer[10] {
            debug!(
                "IMU checksum mismatch: expected {:#04x}, got {:#04x}",
                self.buffer[10], checksum
            );
            return None;
        }
        let packet = PacketType::from_u8(self.buffer[1])?;
        let word = |i: usize| {
            i16::from_le_bytes([self.buffer[2 + 2 * i], self.buffer[3 + 2 * i]]) as f64 / 32768.0
        };
        match packet {
            PacketType::Accel => {
                for axis in 0..3 {
                    self.latest[7 + axis] = word(axis) * ACCEL_RANGE_G * G;
                }
            }
            PacketType::Gyro => {
                for axis in 0..3 {
                    self.latest[4 + axis] = word(axis) * GYRO_RANGE_DPS;
                }
            }
            PacketType::Quaternion => {
                // wire order is w, x, y, z
                let (w, x, y, z) = (word(0), word(1), word(2), word(3));
                self.latest[..4].copy_from_slice(&[x, y, z, w]);
            }
        }
        self.seen |= packet.bit();
        Some(packet)
    }
    /// All three packet kinds have been decoded at least once.
    pub fn is_complete(&self) -> bool {
        self.seen == 0b111
    }
    pub fn latest(&self) -> [f64; IMU_WIDTH] {
        self.latest
    }
}
pub struct SerialImu {
    name: String,
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
    parser: FrameParser,
}
impl SerialImu {
    pub fn from_config(config: &SensorConfig) -> Result<Self, ForceError> {
        let port_name = match &config.connection.serial {
            Some(SerialAddress::Path(path)) => path.clone(),
            other => {
                return Err(ForceError::Configuration(format!(
                    "{}: IMU needs a serial port path, got {other:?}",
                    config.name
                )))
            }
        };
        let baud_rate = config
            .properties
            .get("baud_rate")
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(DEFAULT_BAUD);
        Ok(Self {
            name: config.name.clone(),
            port_name,
            baud_rate,
            port: None,
            parser: FrameParser::new(),
        })
    }
}
impl SensorDevice for SerialImu {
    fn open(&mut self) -> Result<(), ForceError> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| ForceError::device(&self.name, e.to_string()))?;
        if let Err(e) = port.clear(ClearBuffer::Input) {
            warn!("{}: could not flush input buffer: {e}", self.name);
        }
        self.port = Some(port);
        self.parser = FrameParser::new();
        debug!("{} opened on {} @ {}", self.name, self.port_name, self.baud_rate);
        Ok(())
    }
    /// Drains the port up to the next quaternion packet and returns the merged vector.
    fn read_one(&mut self) -> Result<Reading, ForceError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ForceError::device(&self.name, "port not open"))?;
        let deadline = Instant::now() + READ_TIMEOUT;
        let mut chunk = [0u8; 64];
        while Instant::now() < deadline {
            let n = match port.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::TimedOut => 0,
                Err(e) => return Err(ForceError::device(&self.name, e.to_string())),
            };
            let mut fresh = false;
            for byte in &chunk[..n] {
                if self.parser.feed_byte(*byte) == Some(PacketType::Quaternion) {
                    fresh = true;
                }
            }
            if fresh && self.parser.is_complete() {
                return Ok(Reading::Imu(self.parser.latest()));
            }
        }
        Err(ForceError::device(&self.name, "no complete IMU frame before timeout"))
    }
    fn close(&mut self) {
        self.port = None;
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    fn packet(kind: u8, words: [i16; 4]) -> Vec<u8> {
        let mut bytes = vec![HEADER, kind];
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes.push(sum);
        bytes
    }
    fn feed(parser: &mut FrameParser, bytes: &[u8]) -> Vec<PacketType> {
        bytes.iter().filter_map(|b| parser.feed_byte(*b)).collect()
    }
    #[test]
    fn decodes_quaternion_in_xyzw_order() {
        let mut parser = FrameParser::new();
        // w = 0.5, x = 0.25, y = -0.5, z = 0
        let got = feed(&mut parser, &packet(0x59, [16384, 8192, -16384, 0]));
        assert_eq!(got, vec![PacketType::Quaternion]);
        let v = parser.latest();
        assert_eq!(&v[..4], &[0.25, -0.5, 0.0, 0.5]);
        assert!(!parser.is_complete());
    }
    #[test]
    fn merges_all_packet_kinds() {
        let mut parser = FrameParser::new();
        let mut stream = vec![0x00, 0x13];
        stream.extend(packet(0x51, [2048, 0, 0, 0]));
        stream.extend(packet(0x52, [0, 16384, 0, 0]));
        stream.extend(packet(0x59, [32767, 0, 0, 0]));
        let got = feed(&mut parser, &stream);
        assert_eq!(got.len(), 3);
        assert!(parser.is_complete());
        let v = parser.latest();
        assert!((v[7] - G).abs() < 1e-9);
        assert!((v[5] - 1000.0).abs() < 1e-9);
        assert!((v[3] - 1.0).abs() < 1e-4);
    }
    #[test]
    fn drops_packets_with_bad_checksum() {
        let mut parser = FrameParser::new();
        let mut bytes = packet(0x59, [100, 0, 0, 0]);
        bytes[10] = bytes[10].wrapping_add(1);
        assert!(feed(&mut parser, &bytes).is_empty());
        // parser resynchronises on the next header
        assert_eq!(feed(&mut parser, &packet(0x52, [0; 4])), vec![PacketType::Gyro]);
    }
}
