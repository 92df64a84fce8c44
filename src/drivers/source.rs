use std::collections::VecDeque;
use std::thread;
use std::time::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use crate::config::SensorConfig;
use crate::drivers::{PhidgetClass, PhidgetDevice, SerialImu};
use crate::error::ForceError;
use crate::types::{Reading, SensorKind, IMU_WIDTH};
/// One physical channel: open once, then read one value (or vector) per tick.
///
/// Implementations move into their sampling thread for the duration of a test
/// and are handed back when the thread joins, hence `Send`.
pub trait SensorDevice: Send {
    fn open(&mut self) -> Result<(), ForceError>;
    fn read_one(&mut self) -> Result<Reading, ForceError>;
    fn close(&mut self) {}
}
/// Builds the device that backs a configured sensor.
pub trait DeviceFactory {
    fn build(&self, config: &SensorConfig) -> Result<Box<dyn SensorDevice>, ForceError>;
}
impl<F> DeviceFactory for F
where
    F: Fn(&SensorConfig) -> Result<Box<dyn SensorDevice>, ForceError>,
{
    fn build(&self, config: &SensorConfig) -> Result<Box<dyn SensorDevice>, ForceError> {
        self(config)
    }
}
/// Real hardware: Phidget bridge/encoder boards and serial IMUs.
pub struct HardwareFactory;
impl DeviceFactory for HardwareFactory {
    fn build(&self, config: &SensorConfig) -> Result<Box<dyn SensorDevice>, ForceError> {
        Ok(match config.kind {
            SensorKind::Loadcell => Box::new(PhidgetDevice::from_config(
                config,
                PhidgetClass::VoltageRatio,
            )?),
            SensorKind::Encoder => Box::new(PhidgetDevice::from_config(
                config,
                PhidgetClass::Encoder,
            )?),
            SensorKind::Imu => Box::new(SerialImu::from_config(config)?),
        })
    }
}
/// Synthetic devices so the whole chain runs without hardware.
pub struct SimulatedFactory;
impl DeviceFactory for SimulatedFactory {
    fn build(&self, config: &SensorConfig) -> Result<Box<dyn SensorDevice>, ForceError> {
        Ok(Box::new(SimulatedDevice::new(config.kind)))
    }
}
/// Constant level plus uniform noise; IMUs report a resting identity pose.
pub struct SimulatedDevice {
    kind: SensorKind,
    level: f64,
    noise: f64,
    rng: StdRng,
}
impl SimulatedDevice {
    pub fn new(kind: SensorKind) -> Self {
        let mut rng = StdRng::from_entropy();
        let level = match kind {
            SensorKind::Loadcell => rng.gen_range(1.0e-4..5.0e-4),
            SensorKind::Encoder => rng.gen_range(0.0..100.0),
            SensorKind::Imu => 0.0,
        };
        Self {
            kind,
            level,
            noise: 1.0e-6,
            rng,
        }
    }
    fn jitter(&mut self) -> f64 {
        self.rng.gen_range(-self.noise..=self.noise)
    }
}
impl SensorDevice for SimulatedDevice {
    fn open(&mut self) -> Result<(), ForceError> {
        Ok(())
    }
    fn read_one(&mut self) -> Result<Reading, ForceError> {
        Ok(match self.kind {
            SensorKind::Imu => {
                let mut values = [0.0; IMU_WIDTH];
                values[3] = 1.0;
                // gravity on z
                values[9] = 9.80665 + self.jitter();
                Reading::Imu(values)
            }
            _ => Reading::Scalar(self.level + self.jitter()),
        })
    }
}
/// In-memory device useful for tests and deterministic playback.
///
/// Yields the queued readings in order and then repeats the last one.
pub struct ScriptedDevice {
    name: String,
    queue: VecDeque<Reading>,
    last: Option<Reading>,
    reads: usize,
    fail_at: Option<usize>,
    connected: bool,
    delay: Duration,
}
impl ScriptedDevice {
    pub fn new(name: &str, readings: impl IntoIterator<Item = Reading>) -> Self {
        Self {
            name: name.to_owned(),
            queue: readings.into_iter().collect(),
            last: None,
            reads: 0,
            fail_at: None,
            connected: true,
            delay: Duration::ZERO,
        }
    }
    pub fn constant(name: &str, reading: Reading) -> Self {
        Self::new(name, [reading])
    }
    /// Makes the `nth` read (1-based) and every later one fail.
    pub fn failing_at(mut self, nth: usize) -> Self {
        self.fail_at = Some(nth);
        self
    }
    pub fn disconnected(mut self) -> Self {
        self.connected = false;
        self
    }
    /// Adds a blocking delay to every read.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}
impl SensorDevice for ScriptedDevice {
    fn open(&mut self) -> Result<(), ForceError> {
        if self.connected {
            Ok(())
        } else {
            Err(ForceError::device(&self.name, "no device attached"))
        }
    }
    fn read_one(&mut self) -> Result<Reading, ForceError> {
        self.reads += 1;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail_at.is_some_and(|n| self.reads >= n) {
            return Err(ForceError::device(
                &self.name,
                format!("scripted failure on read {}", self.reads),
            ));
        }
        if let Some(next) = self.queue.pop_front() {
            self.last = Some(next);
        }
        self.last
            .ok_or_else(|| ForceError::device(&self.name, "no scripted readings"))
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn scripted_device_repeats_last_reading() {
        let mut dev = ScriptedDevice::new("a", [Reading::Scalar(1.0), Reading::Scalar(2.0)]);
        dev.open().unwrap();
        assert_eq!(dev.read_one().unwrap(), Reading::Scalar(1.0));
        assert_eq!(dev.read_one().unwrap(), Reading::Scalar(2.0));
        assert_eq!(dev.read_one().unwrap(), Reading::Scalar(2.0));
    }
    #[test]
    fn scripted_device_fails_from_nth_read() {
        let mut dev = ScriptedDevice::constant("a", Reading::Scalar(1.0)).failing_at(3);
        assert!(dev.read_one().is_ok());
        assert!(dev.read_one().is_ok());
        assert!(matches!(dev.read_one(), Err(ForceError::Device { .. })));
        assert!(dev.read_one().is_err());
    }
    #[test]
    fn disconnected_device_does_not_open() {
        let mut dev = ScriptedDevice::constant("a", Reading::Scalar(1.0)).disconnected();
        assert!(dev.open().is_err());
    }
    #[test]
    fn simulated_imu_rests_at_identity() {
        let mut dev = SimulatedDevice::new(SensorKind::Imu);
        let Reading::Imu(values) = dev.read_one().unwrap() else {
            panic!("imu must yield a vector");
        };
        assert_eq!(&values[..4], &[0.0, 0.0, 0.0, 1.0]);
    }
}
