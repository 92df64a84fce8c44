// src/types.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Components of one IMU tick: quaternion (x, y, z, w), angular velocity, linear acceleration.
pub const IMU_WIDTH: usize = 10;

/// Marks a tick a sensor could not deliver (read failure after the fault tick).
pub const SENTINEL: f64 = f64::NAN;

// Sensor role
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    #[serde(rename = "SENSOR_LOADCELL")]
    Loadcell,
    #[serde(rename = "SENSOR_ENCODER")]
    Encoder,
    #[serde(rename = "SENSOR_IMU")]
    Imu,
}

impl SensorKind {
    /// Loadcells and encoders carry a linear calibration, IMUs do not.
    pub fn is_calibrated(self) -> bool {
        !matches!(self, SensorKind::Imu)
    }

    pub fn units(self) -> &'static str {
        match self {
            SensorKind::Loadcell => "Force (N)",
            SensorKind::Encoder => "Displacement (mm)",
            SensorKind::Imu => "",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SensorKind::Loadcell => "SENSOR_LOADCELL",
            SensorKind::Encoder => "SENSOR_ENCODER",
            SensorKind::Imu => "SENSOR_IMU",
        };
        f.write_str(s)
    }
}

// Connection state after the last connection check (or a read failure)
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ConnectionState {
    Ignored,
    NotFound,
    Available,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Ignored => "Ignored",
            ConnectionState::NotFound => "Not found",
            ConnectionState::Available => "Available",
            ConnectionState::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum GroupKind {
    #[serde(rename = "GROUP_DEFAULT")]
    Default,
    #[serde(rename = "GROUP_PLATFORM")]
    Platform,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum GroupStatus {
    Ok,
    Ignored,
    Error,
}

/// Stable handle of a sensor inside the registry arena.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, PartialOrd, Ord)]
pub struct SensorId(pub usize);

/// Stable handle of a sensor group inside the registry arena.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash, PartialOrd, Ord)]
pub struct GroupId(pub usize);

/// One value per tick, shaped by the sensor role.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reading {
    Scalar(f64),
    Imu([f64; IMU_WIDTH]),
}

impl Reading {
    pub fn sentinel(kind: SensorKind) -> Self {
        match kind {
            SensorKind::Imu => Reading::Imu([SENTINEL; IMU_WIDTH]),
            _ => Reading::Scalar(SENTINEL),
        }
    }

    pub fn components(&self) -> &[f64] {
        match self {
            Reading::Scalar(v) => std::slice::from_ref(v),
            Reading::Imu(v) => v,
        }
    }

    pub fn scalar(&self) -> Option<f64> {
        match self {
            Reading::Scalar(v) => Some(*v),
            Reading::Imu(_) => None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.components().iter().all(|v| v.is_nan())
    }
}

/// Linear calibration `value * slope + intercept`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    pub slope: f64,
    pub intercept: f64,
}

impl Calibration {
    pub fn identity() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }

    pub fn apply(&self, value: f64) -> f64 {
        value * self.slope + self.intercept
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::identity()
    }
}

// Lifecycle of the acquisition engine
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum EngineState {
    Idle,
    Recording,
    Taring,
    Stopping,
}

/// Live numbers of the running (or last) test, pulled by the front end.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TestStatus {
    pub recording: bool,
    pub samples: usize,
    /// Sensors excluded after a failed read so far.
    pub faulted: usize,
    pub elapsed: Duration,
}

impl TestStatus {
    /// `mm:ss` as shown next to the sample counter.
    pub fn elapsed_label(&self) -> String {
        let secs = self.elapsed.as_secs();
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_matches_sensor_shape() {
        assert!(Reading::sentinel(SensorKind::Loadcell).is_sentinel());
        let imu = Reading::sentinel(SensorKind::Imu);
        assert_eq!(imu.components().len(), IMU_WIDTH);
        assert!(imu.is_sentinel());
        assert!(!Reading::Scalar(0.0).is_sentinel());
    }

    #[test]
    fn calibration_is_linear() {
        let cal = Calibration {
            slope: 2.0,
            intercept: -1.0,
        };
        assert_eq!(cal.apply(3.0), 5.0);
        assert_eq!(Calibration::identity().apply(7.5), 7.5);
    }

    #[test]
    fn kinds_parse_from_config_names() {
        let kind: SensorKind = serde_yaml::from_str("SENSOR_ENCODER").unwrap();
        assert_eq!(kind, SensorKind::Encoder);
        let group: GroupKind = serde_yaml::from_str("GROUP_PLATFORM").unwrap();
        assert_eq!(group, GroupKind::Platform);
    }

    #[test]
    fn elapsed_label_is_minutes_and_seconds() {
        let status = TestStatus {
            recording: true,
            samples: 10,
            faulted: 0,
            elapsed: Duration::from_secs(125),
        };
        assert_eq!(status.elapsed_label(), "02:05");
    }
}
